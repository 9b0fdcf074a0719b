use std::path::Path;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use dbrparser::config::{Config, IndexScheme, OutputTarget, ProcessMode};
use dbrparser::pipeline;

/// Parse AWS Detailed Billing Record exports into newline-delimited JSON or
/// an Elasticsearch-compatible document store.
#[derive(Parser)]
#[command(name = "dbrparser", version)]
struct Cli {
    /// Input DBR CSV file (derived from account id/year/month when omitted)
    #[arg(short, long)]
    input: Option<String>,

    /// Output JSON file (derived from the input name when omitted)
    #[arg(short, long)]
    output: Option<String>,

    /// Document store host
    #[arg(short = 'e', long, default_value = "localhost")]
    es_host: String,

    /// Document store port
    #[arg(short = 'p', long, default_value_t = 9200)]
    es_port: u16,

    /// Document store request timeout in seconds
    #[arg(long, default_value_t = 30)]
    es_timeout: u64,

    /// Index name prefix
    #[arg(long, default_value = "billing")]
    es_index: String,

    /// Document type for billing line items
    #[arg(long, default_value = "billing")]
    es_doctype: String,

    /// Index naming scheme
    #[arg(long, value_enum, default_value = "monthly")]
    index_scheme: IndexScheme,

    /// Run the EC2 usage analytics scan alongside ingestion
    #[arg(long)]
    analytics: bool,

    /// Timeout for the analytics-only mode, in minutes
    #[arg(long, default_value_t = 30)]
    analytics_timeout: u64,

    /// AWS account id used in derived filenames
    #[arg(short = 'a', long, default_value = "012345678901")]
    account_id: String,

    /// Billing year (defaults to the current year)
    #[arg(short = 'y', long)]
    year: Option<i32>,

    /// Billing month (defaults to the current month)
    #[arg(short = 'm', long)]
    month: Option<u32>,

    /// Where processed documents are delivered
    #[arg(short = 't', long = "output-type", value_enum, default_value = "file")]
    output_type: OutputTarget,

    /// CSV field delimiter
    #[arg(short = 'd', long, default_value_t = ',')]
    csv_delimiter: char,

    /// Input character encoding label
    #[arg(long, default_value = "utf-8")]
    encoding: String,

    /// Delete the target index before ingestion
    #[arg(long)]
    delete_index: bool,

    /// Delivery strategy
    #[arg(long, value_enum, default_value = "line")]
    process_mode: ProcessMode,

    /// Documents per bulk chunk
    #[arg(long, default_value_t = 1000)]
    bulk_size: usize,

    /// Query the store for an existing RecordId before indexing
    #[arg(short = 'c', long)]
    check: bool,

    /// With --check: tally existing documents as updated instead of skipped
    #[arg(short = 'u', long)]
    update: bool,

    /// Sign store requests with AWS credentials from the environment
    #[arg(long)]
    awsauth: bool,

    /// Suppress banner, progress bar and summary output
    #[arg(short = 'q', long)]
    quiet: bool,

    /// Abort the run on the first delivery failure
    #[arg(long)]
    fail_fast: bool,

    /// Print every transformed document
    #[arg(long)]
    debug: bool,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<Config> {
        let defaults = Config::default();

        Ok(Config {
            input_filename: self.input.unwrap_or_default(),
            output_filename: self.output.unwrap_or_default(),
            es_host: self.es_host,
            es_port: self.es_port,
            es_timeout: Duration::from_secs(self.es_timeout),
            es_index: self.es_index,
            es_doctype: self.es_doctype,
            es_year: self.year.unwrap_or(defaults.es_year),
            es_month: self.month.unwrap_or(defaults.es_month),
            index_scheme: self.index_scheme,
            account_id: self.account_id,
            output: self.output_type,
            process_mode: self.process_mode,
            csv_delimiter: u8::try_from(self.csv_delimiter)
                .map_err(|_| anyhow!("CSV delimiter must be a single ASCII character"))?,
            encoding: self.encoding,
            bulk_size: self.bulk_size,
            check: self.check,
            update: self.update,
            delete_index: self.delete_index,
            fail_fast: self.fail_fast,
            awsauth: self.awsauth,
            analytics: self.analytics,
            analytics_timeout: Duration::from_secs(self.analytics_timeout * 60),
            debug: self.debug,
            quiet: self.quiet,
            control_spec: defaults.control_spec,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { &cli.log_level };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let chain = format!("{err:#}");
            error!(error = %chain, "dbrparser failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let cfg = cli.into_config()?;
    cfg.validate()?;

    let input = cfg.input_filename();
    if !Path::new(&input).is_file() {
        bail!("input file {input} does not exist");
    }

    if !cfg.quiet {
        println!("dbrparser {}", env!("CARGO_PKG_VERSION"));
        println!("Processing {input}");
    }

    let started = Instant::now();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building async runtime")?;
    let summary = runtime.block_on(pipeline::run(&cfg))?;

    if !cfg.quiet {
        println!("Added:            {}", summary.added);
        println!("Skipped:          {}", summary.skipped);
        println!("Updated:          {}", summary.updated);
        println!("Control messages: {}", summary.control_messages);
        println!("Elapsed:          {:.2?}", started.elapsed());
    }

    Ok(())
}
