//! Delivery sinks. The pipeline hands each transformed document to exactly
//! one sink; dispatch is a plain enum so adding a target stays a local change.

pub mod file;
pub mod store;

use anyhow::Result;

use crate::record::Document;
use crate::store::DocumentStore;

pub use file::FileSink;
pub use store::StoreSink;

/// What happened to one delivered document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Written as a new entry.
    Added,
    /// Already present and left untouched.
    Skipped,
    /// Already present and counted as refreshed.
    Updated,
    /// The sink rejected the document; carries the store's reason.
    Failed(String),
}

/// A delivery target for transformed documents.
pub enum Sink<'a, S: DocumentStore> {
    File(FileSink),
    Store(StoreSink<'a, S>),
}

impl<'a, S: DocumentStore + Sync> Sink<'a, S> {
    /// Delivers one document. Transport-level errors surface as `Err`;
    /// per-document rejections surface as `Outcome::Failed`.
    pub async fn deliver(&mut self, doc: &Document) -> Result<Outcome> {
        match self {
            Sink::File(sink) => sink.write(doc),
            Sink::Store(sink) => sink.put(doc).await,
        }
    }

    /// Flushes any buffered output.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            Sink::File(sink) => sink.finish(),
            Sink::Store(_) => Ok(()),
        }
    }
}
