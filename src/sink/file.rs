//! Newline-delimited JSON file sink.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::record::Document;
use crate::sink::Outcome;

/// Writes one JSON object per line to a buffered file.
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("creating output file {}", path.display()))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    pub fn write(&mut self, doc: &Document) -> Result<Outcome> {
        serde_json::to_writer(&mut self.writer, doc).context("serializing document")?;
        self.writer.write_all(b"\n").context("writing document")?;
        Ok(Outcome::Added)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.writer.flush().context("flushing output file")
    }
}
