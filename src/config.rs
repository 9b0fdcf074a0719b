use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::ValueEnum;

/// Where processed documents are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputTarget {
    /// Newline-delimited JSON file.
    File,
    /// Elasticsearch-compatible document store.
    Store,
}

/// How documents are submitted to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ProcessMode {
    /// One synchronous call per record, in input order.
    Line,
    /// Buffered chunks submitted through the bulk endpoint.
    Bulk,
    /// Skip ingestion entirely; run only the analytics scan.
    AnalyticsOnly,
}

/// Index naming scheme. Legacy store versions keep one index per billing
/// month; newer versions use a single bare index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IndexScheme {
    /// `{prefix}-{year}-{month:02}`.
    Monthly,
    /// `{prefix}` as-is.
    Bare,
}

/// Run configuration, built once from the CLI and immutable afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    /// Input DBR CSV file. Empty means "derive from account id/year/month".
    pub input_filename: String,

    /// Output JSON file (file mode). Empty means "derive from input".
    pub output_filename: String,

    /// Document store host name or IP address.
    pub es_host: String,

    /// Document store port.
    pub es_port: u16,

    /// Document store request timeout.
    pub es_timeout: Duration,

    /// Index name prefix.
    pub es_index: String,

    /// Document type for billing line items.
    pub es_doctype: String,

    /// Billing year for the index name and derived filenames.
    pub es_year: i32,

    /// Billing month for the index name and derived filenames.
    pub es_month: u32,

    /// Index naming scheme.
    pub index_scheme: IndexScheme,

    /// AWS account id used in derived filenames.
    pub account_id: String,

    /// Sink selection.
    pub output: OutputTarget,

    /// Delivery strategy.
    pub process_mode: ProcessMode,

    /// CSV field delimiter.
    pub csv_delimiter: u8,

    /// Input character encoding label (e.g. "utf-8", "iso-8859-1").
    pub encoding: String,

    /// Documents per bulk chunk.
    pub bulk_size: usize,

    /// Query the store for an existing RecordId before indexing.
    pub check: bool,

    /// With `check`: tally existing documents as updated instead of skipped.
    /// No merge is issued against the store (see DESIGN.md).
    pub update: bool,

    /// Delete the target index before ingestion.
    pub delete_index: bool,

    /// Abort the run on the first delivery failure.
    pub fail_fast: bool,

    /// Sign store requests with AWS SigV4 credentials from the environment.
    pub awsauth: bool,

    /// Run the analytics scan alongside ingestion.
    pub analytics: bool,

    /// How long analytics-only mode waits for the scan to finish.
    pub analytics_timeout: Duration,

    /// Print every transformed document, even in quiet mode.
    pub debug: bool,

    /// Suppress banner, progress bar and summary output.
    pub quiet: bool,

    /// Control-message sentinels: any row where one of these fields equals
    /// one of the listed values is a summary row, excluded from delivery.
    pub control_spec: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        use chrono::Datelike;
        let today = chrono::Utc::now();

        Self {
            input_filename: String::new(),
            output_filename: String::new(),
            es_host: "localhost".to_string(),
            es_port: 9200,
            es_timeout: default_es_timeout(),
            es_index: "billing".to_string(),
            es_doctype: "billing".to_string(),
            es_year: today.year(),
            es_month: today.month(),
            index_scheme: IndexScheme::Monthly,
            account_id: "012345678901".to_string(),
            output: OutputTarget::File,
            process_mode: ProcessMode::Line,
            csv_delimiter: b',',
            encoding: "utf-8".to_string(),
            bulk_size: default_bulk_size(),
            check: false,
            update: false,
            delete_index: false,
            fail_fast: false,
            awsauth: false,
            analytics: false,
            analytics_timeout: default_analytics_timeout(),
            debug: false,
            quiet: false,
            control_spec: default_control_spec(),
        }
    }
}

impl Config {
    /// Input filename, deriving the conventional DBR export name when unset.
    pub fn input_filename(&self) -> String {
        if self.input_filename.is_empty() {
            self.suggested_filename("csv")
        } else {
            self.input_filename.clone()
        }
    }

    /// Output filename, deriving from the input name when unset.
    pub fn output_filename(&self) -> String {
        if self.output_filename.is_empty() {
            let input = self.input_filename();
            match input.rsplit_once('.') {
                Some((stem, _)) => format!("{stem}.json"),
                None => format!("{input}.json"),
            }
        } else {
            self.output_filename.clone()
        }
    }

    /// Target index name under the configured naming scheme.
    pub fn index_name(&self) -> String {
        match self.index_scheme {
            IndexScheme::Monthly => {
                format!("{}-{}-{:02}", self.es_index, self.es_year, self.es_month)
            }
            IndexScheme::Bare => self.es_index.clone(),
        }
    }

    /// Base URL of the document store.
    pub fn es_url(&self) -> String {
        format!("http://{}:{}", self.es_host, self.es_port)
    }

    /// Validate the configuration for consistency before a run.
    pub fn validate(&self) -> Result<()> {
        if !(1..=12).contains(&self.es_month) {
            bail!("month must be between 1 and 12, got {}", self.es_month);
        }

        if self.bulk_size == 0 {
            bail!("bulk size must be positive");
        }

        if self.es_index.is_empty() {
            bail!("index prefix must not be empty");
        }

        if encoding_rs::Encoding::for_label(self.encoding.as_bytes()).is_none() {
            bail!("unknown input encoding: {}", self.encoding);
        }

        if self.process_mode == ProcessMode::Bulk && self.output != OutputTarget::Store {
            bail!("bulk mode requires store output");
        }

        if self.analytics_enabled() && self.output != OutputTarget::Store {
            // Two tasks must not append to one output stream.
            bail!("analytics requires store output");
        }

        if self.update && !self.check {
            bail!("--update requires --check");
        }

        Ok(())
    }

    /// Whether the analytics scan runs at all in this configuration.
    pub fn analytics_enabled(&self) -> bool {
        self.analytics || self.process_mode == ProcessMode::AnalyticsOnly
    }

    fn suggested_filename(&self, extension: &str) -> String {
        format!(
            "{}-aws-billing-detailed-line-items-with-resources-and-tags-{:04}-{:02}.{}",
            self.account_id, self.es_year, self.es_month, extension
        )
    }
}

// --- Default value functions ---

fn default_es_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_bulk_size() -> usize {
    1000
}

fn default_analytics_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_control_spec() -> HashMap<String, Vec<String>> {
    let mut spec = HashMap::new();
    spec.insert(
        "RecordType".to_string(),
        vec![
            "StatementTotal".to_string(),
            "InvoiceTotal".to_string(),
            "Rounding".to_string(),
            "AccountTotal".to_string(),
        ],
    );
    spec
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_name_monthly() {
        let cfg = Config {
            es_year: 2015,
            es_month: 3,
            ..Default::default()
        };
        assert_eq!(cfg.index_name(), "billing-2015-03");
    }

    #[test]
    fn test_index_name_bare() {
        let cfg = Config {
            index_scheme: IndexScheme::Bare,
            ..Default::default()
        };
        assert_eq!(cfg.index_name(), "billing");
    }

    #[test]
    fn test_suggested_filenames() {
        let cfg = Config {
            account_id: "012345678901".to_string(),
            es_year: 2015,
            es_month: 12,
            ..Default::default()
        };
        assert_eq!(
            cfg.input_filename(),
            "012345678901-aws-billing-detailed-line-items-with-resources-and-tags-2015-12.csv"
        );
        assert_eq!(
            cfg.output_filename(),
            "012345678901-aws-billing-detailed-line-items-with-resources-and-tags-2015-12.json"
        );
    }

    #[test]
    fn test_output_filename_follows_explicit_input() {
        let cfg = Config {
            input_filename: "march.csv".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.output_filename(), "march.json");
    }

    #[test]
    fn test_validate_rejects_bulk_to_file() {
        let cfg = Config {
            process_mode: ProcessMode::Bulk,
            output: OutputTarget::File,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_analytics_to_file() {
        let cfg = Config {
            analytics: true,
            output: OutputTarget::File,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_update_without_check() {
        let cfg = Config {
            update: true,
            check: false,
            output: OutputTarget::Store,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_encoding() {
        let cfg = Config {
            encoding: "not-a-charset".to_string(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_defaults_ok() {
        assert!(Config::default().validate().is_ok());
    }
}
