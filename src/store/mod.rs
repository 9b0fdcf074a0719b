//! Document-store client: the minimal capability set the pipeline needs,
//! plus an HTTP implementation targeting the legacy Elasticsearch REST API.

pub mod mapping;
pub mod sign;

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tracing::debug;

use crate::record::Document;

/// Result of indexing one document.
#[derive(Debug, Clone)]
pub struct IndexResult {
    /// Number of shard replicas that acknowledged the write.
    pub successful_shards: u64,
    /// Raw store response, kept for failure reporting.
    pub detail: String,
}

impl IndexResult {
    /// An index operation succeeded if at least one replica acknowledged it.
    pub fn acknowledged(&self) -> bool {
        self.successful_shards >= 1
    }
}

/// Per-document result of a bulk submission, in input order.
#[derive(Debug, Clone)]
pub struct BulkItemResult {
    pub success: bool,
    pub detail: String,
}

/// Minimal contract the pipeline requires from a document store.
pub trait DocumentStore {
    /// Declare an index. Already-existing indices are tolerated when
    /// `ok_if_exists` is set.
    fn create_index(
        &self,
        name: &str,
        ok_if_exists: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Drop an index. Missing indices are tolerated when `ok_if_missing`
    /// is set.
    fn delete_index(
        &self,
        name: &str,
        ok_if_missing: bool,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Install the document schema for a type within an index.
    fn put_mapping(
        &self,
        index: &str,
        doctype: &str,
        schema: &Value,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Whether a document with this RecordId already exists.
    fn exists(
        &self,
        index: &str,
        doctype: &str,
        record_id: &str,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Submit one document as a new entry.
    fn index_document(
        &self,
        index: &str,
        doctype: &str,
        body: &Document,
    ) -> impl Future<Output = Result<IndexResult>> + Send;

    /// Submit documents in chunks of `chunk_size`, returning one result per
    /// input document in input order. Partial chunk failures surface as
    /// per-item results, not as an error.
    fn bulk_index(
        &self,
        index: &str,
        doctype: &str,
        docs: &[Document],
        chunk_size: usize,
    ) -> impl Future<Output = Result<Vec<BulkItemResult>>> + Send;
}

/// HTTP document-store client built on reqwest.
pub struct HttpStore {
    client: reqwest::Client,
    base_url: String,
    signer: Option<sign::SigV4Signer>,
}

impl HttpStore {
    /// Creates a client for the store at `base_url` (e.g. "http://host:9200").
    /// With `awsauth`, requests are signed with SigV4 credentials sourced
    /// from the environment.
    pub fn new(base_url: &str, timeout: Duration, awsauth: bool) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let signer = if awsauth {
            Some(sign::SigV4Signer::from_env()?)
        } else {
            None
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            signer,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let mut request = builder.build().context("building store request")?;
        if let Some(signer) = &self.signer {
            signer.sign(&mut request)?;
        }
        self.client
            .execute(request)
            .await
            .context("sending store request")
    }

    /// Submits one `_bulk` chunk and appends its per-item results.
    async fn bulk_chunk(
        &self,
        index: &str,
        doctype: &str,
        chunk: &[Document],
        results: &mut Vec<BulkItemResult>,
    ) -> Result<()> {
        let mut body = Vec::with_capacity(chunk.len() * 256);
        for doc in chunk {
            body.extend_from_slice(b"{\"index\":{}}\n");
            serde_json::to_writer(&mut body, doc).context("serializing bulk document")?;
            body.push(b'\n');
        }

        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{index}/{doctype}/_bulk")))
                    .header("Content-Type", "application/x-ndjson")
                    .body(body),
            )
            .await?;

        let status = response.status();
        let payload: Value = response.json().await.context("decoding bulk response")?;
        if !status.is_success() {
            bail!("bulk request rejected with status {status}: {payload}");
        }

        let items = payload
            .get("items")
            .and_then(Value::as_array)
            .context("bulk response has no items array")?;
        if items.len() != chunk.len() {
            bail!(
                "bulk response has {} items for {} documents",
                items.len(),
                chunk.len()
            );
        }

        for item in items {
            // Each item is wrapped in its action name ("index" or "create").
            let action = item
                .get("index")
                .or_else(|| item.get("create"))
                .unwrap_or(item);
            let item_status = action.get("status").and_then(Value::as_u64).unwrap_or(0);
            let success = (200..300).contains(&item_status);
            let detail = match action.get("error") {
                Some(error) => error.to_string(),
                None => format!("status {item_status}"),
            };
            results.push(BulkItemResult { success, detail });
        }

        debug!(index, items = chunk.len(), "bulk chunk submitted");

        Ok(())
    }
}

impl DocumentStore for HttpStore {
    async fn create_index(&self, name: &str, ok_if_exists: bool) -> Result<()> {
        let response = self.send(self.client.put(self.url(name))).await?;
        let status = response.status();
        if status.is_success() || (ok_if_exists && status == reqwest::StatusCode::BAD_REQUEST) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        bail!("creating index {name} failed with status {status}: {body}");
    }

    async fn delete_index(&self, name: &str, ok_if_missing: bool) -> Result<()> {
        let response = self.send(self.client.delete(self.url(name))).await?;
        let status = response.status();
        if status.is_success() || (ok_if_missing && status == reqwest::StatusCode::NOT_FOUND) {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        bail!("deleting index {name} failed with status {status}: {body}");
    }

    async fn put_mapping(&self, index: &str, doctype: &str, schema: &Value) -> Result<()> {
        let response = self
            .send(
                self.client
                    .put(self.url(&format!("{index}/_mapping/{doctype}")))
                    .json(schema),
            )
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        bail!("installing mapping for {index}/{doctype} failed with status {status}: {body}");
    }

    async fn exists(&self, index: &str, doctype: &str, record_id: &str) -> Result<bool> {
        let query = serde_json::json!({
            "size": 0,
            "query": { "term": { "RecordId": record_id } }
        });
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{index}/{doctype}/_search")))
                    .json(&query),
            )
            .await?;
        let status = response.status();
        let payload: Value = response.json().await.context("decoding search response")?;
        if !status.is_success() {
            bail!("existence check failed with status {status}: {payload}");
        }

        // hits.total is a bare number on legacy stores and an object with a
        // "value" field on newer ones.
        let total = match payload.pointer("/hits/total") {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
            Some(Value::Object(o)) => o.get("value").and_then(Value::as_u64).unwrap_or(0),
            _ => 0,
        };
        Ok(total > 0)
    }

    async fn index_document(
        &self,
        index: &str,
        doctype: &str,
        body: &Document,
    ) -> Result<IndexResult> {
        let response = self
            .send(
                self.client
                    .post(self.url(&format!("{index}/{doctype}")))
                    .json(body),
            )
            .await?;
        let payload: Value = response.json().await.context("decoding index response")?;

        let successful_shards = payload
            .pointer("/_shards/successful")
            .and_then(Value::as_u64)
            .unwrap_or(0);

        Ok(IndexResult {
            successful_shards,
            detail: payload.to_string(),
        })
    }

    async fn bulk_index(
        &self,
        index: &str,
        doctype: &str,
        docs: &[Document],
        chunk_size: usize,
    ) -> Result<Vec<BulkItemResult>> {
        let mut results = Vec::with_capacity(docs.len());
        for chunk in docs.chunks(chunk_size.max(1)) {
            self.bulk_chunk(index, doctype, chunk, &mut results).await?;
        }
        Ok(results)
    }
}
