//! Elasticsearch/OpenSearch implementation of [`SearchIndex`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use notely_core::defaults::{SEARCH_INDEX, SEARCH_TIMEOUT_SECS, SEARCH_URL};
use notely_core::{Error, NoteDocument, NoteSearchHit, Result, SearchIndex};

/// Connection settings for the search engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    pub base_url: String,
    pub index: String,
    pub timeout: Duration,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: SEARCH_URL.to_string(),
            index: SEARCH_INDEX.to_string(),
            timeout: Duration::from_secs(SEARCH_TIMEOUT_SECS),
        }
    }
}

impl SearchConfig {
    /// Read `SEARCH_URL`, `SEARCH_INDEX`, and `SEARCH_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let base_url = std::env::var("SEARCH_URL").unwrap_or(defaults.base_url);
        let index = std::env::var("SEARCH_INDEX").unwrap_or(defaults.index);
        let timeout = std::env::var("SEARCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);

        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            index,
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeleteByQueryResponse {
    #[serde(default)]
    deleted: u64,
    #[serde(default)]
    version_conflicts: u64,
    #[serde(default)]
    failures: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    hits: HitsEnvelope,
}

#[derive(Debug, Deserialize)]
struct HitsEnvelope {
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct Hit {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_score")]
    score: Option<f32>,
}

/// Search index client over the engine's REST API.
pub struct ElasticIndex {
    client: Client,
    base_url: String,
    index: String,
}

impl ElasticIndex {
    pub fn new(config: SearchConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        info!(
            subsystem = "search",
            base_url = %config.base_url,
            index = %config.index,
            timeout_secs = config.timeout.as_secs(),
            "Initializing search index client"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            index: config.index,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(SearchConfig::from_env())
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.index, path)
    }

    /// Create the index with its mapping if it does not exist yet.
    pub async fn ensure_index(&self) -> Result<()> {
        let mapping = json!({
            "mappings": {
                "properties": {
                    "note_id": { "type": "keyword" },
                    "space_id": { "type": "keyword" },
                    "user_id": { "type": "long" },
                    "type": { "type": "keyword" },
                    "text": { "type": "text" },
                    "file": { "type": "keyword", "index": false },
                    "created": { "type": "date" },
                    "last_edit": { "type": "date" }
                }
            }
        });

        let response = self
            .client
            .put(format!("{}/{}", self.base_url, self.index))
            .json(&mapping)
            .send()
            .await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            if body.contains("resource_already_exists_exception") {
                debug!(subsystem = "search", index = %self.index, "Index already exists");
                return Ok(());
            }
            return Err(Error::Index(format!("create index failed: {}", body)));
        }
        check_status(response, "create_index").await?;
        info!(subsystem = "search", index = %self.index, "Index created");
        Ok(())
    }
}

/// Turn a non-success response into an index error carrying the body.
async fn check_status(response: Response, op: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(subsystem = "search", op, status = status.as_u16(), "Search engine rejected request");
    Err(Error::Index(format!("{} returned {}: {}", op, status, body)))
}

#[async_trait]
impl SearchIndex for ElasticIndex {
    async fn index_document(&self, doc: &NoteDocument) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("_doc/{}", doc.note_id)))
            .query(&[("refresh", "wait_for")])
            .json(doc)
            .send()
            .await?;
        check_status(response, "index").await?;
        debug!(subsystem = "search", op = "index", note_id = %doc.note_id, "Document indexed");
        Ok(())
    }

    async fn update_document(&self, doc: &NoteDocument) -> Result<()> {
        // Upsert so an update never fails on a document the index lost.
        let response = self
            .client
            .post(self.url(&format!("_update/{}", doc.note_id)))
            .query(&[("refresh", "wait_for")])
            .json(&json!({ "doc": doc, "doc_as_upsert": true }))
            .send()
            .await?;
        check_status(response, "update").await?;
        debug!(subsystem = "search", op = "update", note_id = %doc.note_id, "Document updated");
        Ok(())
    }

    async fn delete_document(&self, note_id: Uuid) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("_doc/{}", note_id)))
            .query(&[("refresh", "wait_for")])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!(subsystem = "search", op = "delete", note_id = %note_id, "Document already absent");
            return Ok(());
        }
        check_status(response, "delete").await?;
        Ok(())
    }

    async fn delete_by_space(&self, space_id: Uuid) -> Result<u64> {
        let start = Instant::now();
        let response = self
            .client
            .post(self.url("_delete_by_query"))
            .query(&[("refresh", "true"), ("conflicts", "proceed")])
            .json(&json!({ "query": { "term": { "space_id": space_id.to_string() } } }))
            .send()
            .await?;
        let response = check_status(response, "delete_by_query").await?;

        let result: DeleteByQueryResponse = response.json().await?;
        if !result.failures.is_empty() || result.version_conflicts > 0 {
            return Err(Error::Index(format!(
                "delete_by_query partially failed: deleted={}, conflicts={}, failures={}",
                result.deleted,
                result.version_conflicts,
                result.failures.len()
            )));
        }

        debug!(
            subsystem = "search",
            op = "delete_by_query",
            space_id = %space_id,
            deleted = result.deleted,
            duration_ms = start.elapsed().as_millis() as u64,
            "Space documents deleted"
        );
        Ok(result.deleted)
    }

    async fn search(
        &self,
        space_id: Uuid,
        query: &str,
        limit: usize,
    ) -> Result<Vec<NoteSearchHit>> {
        let body = json!({
            "size": limit,
            "query": {
                "bool": {
                    "must": { "match": { "text": query } },
                    "filter": { "term": { "space_id": space_id.to_string() } }
                }
            }
        });

        let response = self.client.post(self.url("_search")).json(&body).send().await?;
        let response = check_status(response, "search").await?;
        let result: SearchResponse = response.json().await?;

        result
            .hits
            .hits
            .into_iter()
            .map(|hit| {
                let note_id = Uuid::parse_str(&hit.id)
                    .map_err(|e| Error::Serialization(format!("bad document id {}: {}", hit.id, e)))?;
                Ok(NoteSearchHit {
                    note_id,
                    score: hit.score.unwrap_or(0.0),
                })
            })
            .collect()
    }
}
