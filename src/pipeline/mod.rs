//! Ingestion pipeline: streams DBR CSV rows through the transformer into the
//! configured sink, tallying a run summary.

use std::fs::File;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use encoding_rs_io::{DecodeReaderBytes, DecodeReaderBytesBuilder};
use indicatif::{ProgressBar, ProgressStyle};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::analytics;
use crate::config::{Config, OutputTarget, ProcessMode};
use crate::record::{self, Document, Row};
use crate::sink::{FileSink, Outcome, Sink, StoreSink};
use crate::store::{mapping, DocumentStore, HttpStore};

/// Per-run delivery tallies.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Summary {
    pub added: u64,
    /// Records not delivered: duplicates found by `--check`, plus non-fatal
    /// rejections and malformed rows under the default failure policy.
    pub skipped: u64,
    pub updated: u64,
    pub control_messages: u64,
}

/// Terminal pipeline failures under the fail-fast policy.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("record {recno}: delivery rejected: {reason}")]
    IndexFailed { recno: usize, reason: String },

    #[error("record {recno}: malformed row: {reason}")]
    MalformedRow { recno: usize, reason: String },
}

/// Runs the configured pipeline end to end, building an HTTP store client
/// when one is needed.
pub async fn run(cfg: &Config) -> Result<Summary> {
    if cfg.output == OutputTarget::Store {
        let store = HttpStore::new(&cfg.es_url(), cfg.es_timeout, cfg.awsauth)?;
        run_with_store(cfg, Some(&store)).await
    } else {
        run_with_store::<HttpStore>(cfg, None).await
    }
}

/// Like [`run`], but against a caller-provided store. Pass `None` for
/// file-only runs.
pub async fn run_with_store<S: DocumentStore + Sync>(
    cfg: &Config,
    store: Option<&S>,
) -> Result<Summary> {
    cfg.validate()?;

    if cfg.output == OutputTarget::Store {
        let store = store.context("store output requires a document store")?;
        prepare_index(cfg, store).await?;
    }

    match cfg.process_mode {
        ProcessMode::AnalyticsOnly => {
            let store = store.context("analytics requires a document store")?;
            run_analytics_with_deadline(cfg, store).await?;
            Ok(Summary::default())
        }
        _ if cfg.analytics_enabled() => {
            let store = store.context("analytics requires a document store")?;
            // Ingestion and the analytics scan each hold their own file
            // handle, so they can run side by side.
            let (summary, analytics_result) =
                tokio::join!(ingest(cfg, Some(store)), analytics::run(cfg, store));
            if let Err(err) = analytics_result {
                error!(error = %err, "analytics scan failed");
            }
            summary
        }
        _ => ingest(cfg, store).await,
    }
}

/// Index lifecycle before ingestion: optional delete, idempotent create,
/// mapping installation. Failures here are terminal.
async fn prepare_index<S: DocumentStore>(cfg: &Config, store: &S) -> Result<()> {
    let index = cfg.index_name();

    if cfg.delete_index {
        store.delete_index(&index, true).await?;
        info!(index, "deleted existing index");
    }

    store.create_index(&index, true).await?;
    store
        .put_mapping(&index, &cfg.es_doctype, &mapping::dbr_mapping(&cfg.es_doctype))
        .await?;
    info!(index, doctype = cfg.es_doctype, "index ready");

    Ok(())
}

/// Waits for the analytics scan, polling every few seconds so a stuck scan
/// cannot hold the process past `analytics_timeout`.
async fn run_analytics_with_deadline<S: DocumentStore + Sync>(
    cfg: &Config,
    store: &S,
) -> Result<()> {
    let scan = analytics::run(cfg, store);
    tokio::pin!(scan);

    let started = tokio::time::Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            result = &mut scan => return result,
            _ = ticker.tick() => {
                if started.elapsed() > cfg.analytics_timeout {
                    bail!(
                        "analytics scan exceeded its {}s timeout",
                        cfg.analytics_timeout.as_secs()
                    );
                }
            }
        }
    }
}

/// One full ingestion pass over the input file.
async fn ingest<S: DocumentStore + Sync>(cfg: &Config, store: Option<&S>) -> Result<Summary> {
    let input = cfg.input_filename();
    info!(input, "starting ingestion");

    // The pre-count pass exists only to size the progress bar.
    let progress = if cfg.quiet {
        ProgressBar::hidden()
    } else {
        let bar = ProgressBar::new(count_rows(cfg)? as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40} {pos}/{len} records ({eta})")
                .context("progress bar template")?,
        );
        bar
    };

    let summary = match (cfg.output, cfg.process_mode) {
        (OutputTarget::Store, ProcessMode::Bulk) => {
            let store = store.context("store output requires a document store")?;
            let sink = StoreSink::new(store, &cfg.index_name(), &cfg.es_doctype, false, false);
            ingest_bulk(cfg, &sink, &progress).await
        }
        _ => {
            let mut sink: Sink<'_, S> = match cfg.output {
                OutputTarget::File => {
                    let path = cfg.output_filename();
                    Sink::File(FileSink::create(Path::new(&path))?)
                }
                OutputTarget::Store => {
                    let store = store.context("store output requires a document store")?;
                    Sink::Store(StoreSink::new(
                        store,
                        &cfg.index_name(),
                        &cfg.es_doctype,
                        cfg.check,
                        cfg.update,
                    ))
                }
            };
            let summary = ingest_line(cfg, &mut sink, &progress).await;
            sink.finish()?;
            summary
        }
    }?;

    progress.finish_and_clear();
    info!(
        added = summary.added,
        skipped = summary.skipped,
        updated = summary.updated,
        control_messages = summary.control_messages,
        "ingestion finished"
    );

    Ok(summary)
}

/// One synchronous delivery per record, in input order.
async fn ingest_line<S: DocumentStore + Sync>(
    cfg: &Config,
    sink: &mut Sink<'_, S>,
    progress: &ProgressBar,
) -> Result<Summary> {
    let mut summary = Summary::default();
    let mut reader = open_reader(cfg)?;

    for (recno, result) in reader.deserialize::<Row>().enumerate().map(offset_recno) {
        progress.inc(1);

        let row = match result {
            Ok(row) => row,
            Err(err) => {
                handle_failure(
                    cfg,
                    &mut summary,
                    PipelineError::MalformedRow {
                        recno,
                        reason: err.to_string(),
                    },
                )?;
                continue;
            }
        };

        if record::is_control_message(&row, &cfg.control_spec) {
            summary.control_messages += 1;
            continue;
        }

        let doc = transform(cfg, recno, &row)?;
        match sink.deliver(&doc).await? {
            Outcome::Added => summary.added += 1,
            Outcome::Skipped => summary.skipped += 1,
            Outcome::Updated => summary.updated += 1,
            Outcome::Failed(reason) => {
                handle_failure(
                    cfg,
                    &mut summary,
                    PipelineError::IndexFailed { recno, reason },
                )?;
            }
        }
    }

    Ok(summary)
}

/// Buffered delivery through the store's bulk endpoint.
async fn ingest_bulk<S: DocumentStore + Sync>(
    cfg: &Config,
    sink: &StoreSink<'_, S>,
    progress: &ProgressBar,
) -> Result<Summary> {
    let mut summary = Summary::default();
    let mut reader = open_reader(cfg)?;

    let mut docs: Vec<Document> = Vec::with_capacity(cfg.bulk_size);
    let mut recnos: Vec<usize> = Vec::with_capacity(cfg.bulk_size);

    for (recno, result) in reader.deserialize::<Row>().enumerate().map(offset_recno) {
        progress.inc(1);

        let row = match result {
            Ok(row) => row,
            Err(err) => {
                handle_failure(
                    cfg,
                    &mut summary,
                    PipelineError::MalformedRow {
                        recno,
                        reason: err.to_string(),
                    },
                )?;
                continue;
            }
        };

        if record::is_control_message(&row, &cfg.control_spec) {
            summary.control_messages += 1;
            continue;
        }

        docs.push(transform(cfg, recno, &row)?);
        recnos.push(recno);

        if docs.len() >= cfg.bulk_size {
            flush_bulk(cfg, sink, &mut summary, &docs, &recnos).await?;
            docs.clear();
            recnos.clear();
        }
    }

    if !docs.is_empty() {
        flush_bulk(cfg, sink, &mut summary, &docs, &recnos).await?;
    }

    Ok(summary)
}

async fn flush_bulk<S: DocumentStore + Sync>(
    cfg: &Config,
    sink: &StoreSink<'_, S>,
    summary: &mut Summary,
    docs: &[Document],
    recnos: &[usize],
) -> Result<()> {
    for (outcome, &recno) in sink.put_bulk(docs, cfg.bulk_size).await?.iter().zip(recnos) {
        match outcome {
            Outcome::Added => summary.added += 1,
            Outcome::Skipped => summary.skipped += 1,
            Outcome::Updated => summary.updated += 1,
            Outcome::Failed(reason) => {
                handle_failure(
                    cfg,
                    summary,
                    PipelineError::IndexFailed {
                        recno,
                        reason: reason.clone(),
                    },
                )?;
            }
        }
    }
    Ok(())
}

fn transform(cfg: &Config, recno: usize, row: &Row) -> Result<Document> {
    let mut doc = record::restructure(row);
    record::classify_usage(&mut doc);
    if cfg.debug {
        debug!(
            recno,
            doc = %serde_json::to_string(&doc).context("serializing document")?,
            "transformed document"
        );
    }
    Ok(doc)
}

/// Escalates under fail-fast; otherwise logs the failure and tallies the
/// record as skipped.
fn handle_failure(cfg: &Config, summary: &mut Summary, err: PipelineError) -> Result<()> {
    if cfg.fail_fast {
        return Err(err.into());
    }
    warn!(error = %err, "record not delivered");
    summary.skipped += 1;
    Ok(())
}

/// 1-based data record numbers (the header row is not a record).
fn offset_recno<T>((index, item): (usize, T)) -> (usize, T) {
    (index + 1, item)
}

fn count_rows(cfg: &Config) -> Result<usize> {
    let mut reader = open_reader(cfg)?;
    // Malformed rows still occupy a progress slot.
    Ok(reader.records().count())
}

pub(crate) fn open_reader(cfg: &Config) -> Result<csv::Reader<DecodeReaderBytes<File, Vec<u8>>>> {
    let path = cfg.input_filename();
    let file = File::open(&path).with_context(|| format!("opening input file {path}"))?;

    let encoding = encoding_rs::Encoding::for_label(cfg.encoding.as_bytes())
        .with_context(|| format!("unknown input encoding: {}", cfg.encoding))?;
    let decoder = DecodeReaderBytesBuilder::new()
        .encoding(Some(encoding))
        .build(file);

    Ok(csv::ReaderBuilder::new()
        .delimiter(cfg.csv_delimiter)
        .flexible(false)
        .from_reader(decoder))
}
