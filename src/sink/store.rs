//! Document-store sink with optional duplicate checking.

use anyhow::Result;
use tracing::debug;

use crate::record::Document;
use crate::sink::Outcome;
use crate::store::DocumentStore;

/// Delivers documents to one index/doctype of a document store.
pub struct StoreSink<'a, S: DocumentStore> {
    store: &'a S,
    index: String,
    doctype: String,
    check: bool,
    update: bool,
}

impl<'a, S: DocumentStore + Sync> StoreSink<'a, S> {
    pub fn new(store: &'a S, index: &str, doctype: &str, check: bool, update: bool) -> Self {
        Self {
            store,
            index: index.to_string(),
            doctype: doctype.to_string(),
            check,
            update,
        }
    }

    /// Indexes one document. With `check`, an existing RecordId short-circuits
    /// to Skipped (or Updated with `update` set) without re-indexing.
    pub async fn put(&self, doc: &Document) -> Result<Outcome> {
        if self.check {
            let record_id = doc
                .get("RecordId")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("");
            if self
                .store
                .exists(&self.index, &self.doctype, record_id)
                .await?
            {
                debug!(record_id, "document already present");
                return Ok(if self.update {
                    Outcome::Updated
                } else {
                    Outcome::Skipped
                });
            }
        }

        let result = self
            .store
            .index_document(&self.index, &self.doctype, doc)
            .await?;
        if result.acknowledged() {
            Ok(Outcome::Added)
        } else {
            Ok(Outcome::Failed(result.detail))
        }
    }

    /// Submits buffered documents through the store's bulk endpoint,
    /// returning one outcome per document in input order.
    pub async fn put_bulk(&self, docs: &[Document], chunk_size: usize) -> Result<Vec<Outcome>> {
        let results = self
            .store
            .bulk_index(&self.index, &self.doctype, docs, chunk_size)
            .await?;
        Ok(results
            .into_iter()
            .map(|item| {
                if item.success {
                    Outcome::Added
                } else {
                    Outcome::Failed(item.detail)
                }
            })
            .collect())
    }
}
