//! # Search Engine Client
//!
//! Thin typed client for the external search engine, speaking the
//! Meilisearch REST contract: index lifecycle, document upserts, search and
//! filtered deletion. The engine is opaque to the rest of the crate; the
//! batch writer only sees the [`DocumentSink`] seam.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::{ENGINE_REQUEST_TIMEOUT, INDEX_MAX_TOTAL_HITS, INDEX_NAME};
use crate::model::LogRecord;

/// How long to poll a queued engine task before giving up.
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const TASK_POLL_ATTEMPTS: u32 = 200;

/// Errors from the engine, classified by whether a retry can succeed.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network failure, timeout, or a 5xx response. Retryable.
    #[error("transient engine error: {0}")]
    Transient(String),
    /// A 4xx response. Retrying the same payload cannot succeed.
    #[error("permanent engine error ({status}): {message}")]
    Permanent { status: u16, message: String },
}

impl EngineError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

/// Anything that can durably accept a batch of records. The production impl
/// is [`EngineClient`]; tests substitute an in-memory sink.
#[async_trait]
pub trait DocumentSink: Send + Sync + 'static {
    async fn upsert_documents(&self, docs: &[LogRecord]) -> Result<(), EngineError>;
}

/// A search request against the records index.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub q: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<String>,
    pub limit: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Vec<String>>,
}

/// The subset of the engine's search response the query layer consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    #[serde(default)]
    pub hits: Vec<serde_json::Value>,
    #[serde(default)]
    pub estimated_total_hits: u64,
    #[serde(default)]
    pub facet_distribution: BTreeMap<String, BTreeMap<String, u64>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRef {
    task_uid: u64,
}

#[derive(Debug, Deserialize)]
struct TaskView {
    status: String,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// HTTP client for the engine. Stateless beyond its connection pool; cheap to
/// clone and safe to share.
#[derive(Debug, Clone)]
pub struct EngineClient {
    http: reqwest::Client,
    base: String,
    key: Option<String>,
}

impl EngineClient {
    pub fn new(host: &str, key: &str) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(ENGINE_REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base: host.trim_end_matches('/').to_string(),
            key: if key.is_empty() {
                None
            } else {
                Some(key.to_string())
            },
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.url(path));
        match &self.key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Send a request and classify the outcome per the error taxonomy.
    async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, EngineError> {
        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            Err(EngineError::Permanent {
                status: status.as_u16(),
                message,
            })
        } else {
            Err(EngineError::Transient(format!(
                "engine returned {}: {}",
                status.as_u16(),
                message
            )))
        }
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, EngineError> {
        self.execute(builder)
            .await?
            .json::<T>()
            .await
            .map_err(|e| EngineError::Transient(format!("malformed engine response: {e}")))
    }

    /// Probe engine reachability.
    pub async fn health(&self) -> Result<(), EngineError> {
        self.execute(self.request(reqwest::Method::GET, "/health"))
            .await
            .map(|_| ())
    }

    /// Whether the records index exists.
    pub async fn index_exists(&self) -> Result<bool, EngineError> {
        let path = format!("/indexes/{INDEX_NAME}");
        match self.execute(self.request(reqwest::Method::GET, &path)).await {
            Ok(_) => Ok(true),
            Err(EngineError::Permanent { status: 404, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Create the records index if absent and push its schema: searchable,
    /// filterable and sortable attributes, ranking rules that honor the sort,
    /// and the pagination ceiling. Idempotent.
    pub async fn ensure_index(&self) -> Result<(), EngineError> {
        if !self.index_exists().await? {
            let task: TaskRef = self
                .json(
                    self.request(reqwest::Method::POST, "/indexes")
                        .json(&json!({ "uid": INDEX_NAME, "primaryKey": "id" })),
                )
                .await?;
            self.wait_for_task(task.task_uid).await?;
        }

        let settings = json!({
            "searchableAttributes": ["message", "source", "meta", "project"],
            "filterableAttributes": [
                "project", "level", "environment", "traceId", "timestampMs",
            ],
            "sortableAttributes": ["timestamp", "timestampMs"],
            "rankingRules": [
                "sort", "words", "typo", "proximity", "attribute", "exactness",
            ],
            "pagination": { "maxTotalHits": INDEX_MAX_TOTAL_HITS },
        });
        let path = format!("/indexes/{INDEX_NAME}/settings");
        let task: TaskRef = self
            .json(self.request(reqwest::Method::PATCH, &path).json(&settings))
            .await?;
        self.wait_for_task(task.task_uid).await
    }

    /// Poll a queued engine task until it reaches a terminal state.
    async fn wait_for_task(&self, uid: u64) -> Result<(), EngineError> {
        let path = format!("/tasks/{uid}");
        for _ in 0..TASK_POLL_ATTEMPTS {
            let task: TaskView = self.json(self.request(reqwest::Method::GET, &path)).await?;
            match task.status.as_str() {
                "succeeded" => return Ok(()),
                "failed" | "canceled" => {
                    return Err(EngineError::Permanent {
                        status: 400,
                        message: task
                            .error
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "engine task failed".to_string()),
                    });
                }
                _ => tokio::time::sleep(TASK_POLL_INTERVAL).await,
            }
        }
        Err(EngineError::Transient(format!(
            "engine task {uid} did not settle in time"
        )))
    }

    /// Run a search against the records index.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults, EngineError> {
        let path = format!("/indexes/{INDEX_NAME}/search");
        self.json(self.request(reqwest::Method::POST, &path).json(request))
            .await
    }

    /// Delete every document matching a filter expression. Retention helper
    /// for the out-of-band cleanup job; not reachable from the HTTP surface.
    pub async fn delete_by_filter(&self, filter: &str) -> Result<(), EngineError> {
        let path = format!("/indexes/{INDEX_NAME}/documents/delete");
        let task: TaskRef = self
            .json(
                self.request(reqwest::Method::POST, &path)
                    .json(&json!({ "filter": filter })),
            )
            .await?;
        self.wait_for_task(task.task_uid).await
    }
}

#[async_trait]
impl DocumentSink for EngineClient {
    /// Push one batch of documents. The engine applies the write as a queued
    /// task; delivery is acknowledged once the task is accepted.
    async fn upsert_documents(&self, docs: &[LogRecord]) -> Result<(), EngineError> {
        let path = format!("/indexes/{INDEX_NAME}/documents?primaryKey=id");
        let _: TaskRef = self
            .json(self.request(reqwest::Method::POST, &path).json(&docs))
            .await?;
        Ok(())
    }
}
