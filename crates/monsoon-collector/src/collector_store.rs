//! Storage backend client for aggregated records.
//!
//! The backend owns persistence and dedup: inserting a batch that overlaps
//! already-stored rows is safe, conflicts collapse silently on its unique
//! (sender_name, sender_id, text, timestamp) tuple. Callers only learn
//! success or failure; a failed batch is the delivery worker's to retry.

use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collector_contract::AggregatedRecord;

pub const DEFAULT_STORAGE_HTTP_TIMEOUT_MS: u64 = 5000;

const INSERT_PATH: &str = "raw-messages";
const LAST_TIMESTAMP_PATH: &str = "raw-messages/last-timestamp";

#[derive(Debug, Error)]
/// Transport-level storage failures. All variants are retryable from the
/// delivery worker's point of view; they are distinguished for logs only.
pub enum StorageClientError {
    #[error("storage transport error: {0}")]
    Transport(String),
    #[error("storage backend returned status {status}: {detail}")]
    Status { status: u16, detail: String },
    #[error("failed to decode storage response: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Backend verdict for one insert attempt. `success: false` covers any
/// backend-side failure that is not a duplicate conflict; conflicts are
/// silent no-ops and count as success.
pub struct InsertOutcome {
    pub success: bool,
    #[serde(default)]
    pub inserted: usize,
}

#[async_trait]
/// Seam between the delivery pipeline and whatever store backs it.
pub trait StorageBackend: Send + Sync {
    /// Inserts a batch. Must be idempotent for overlapping batches and must
    /// report non-conflict failures as `success: false` rather than erroring,
    /// so the caller can backlog and retry without special cases.
    async fn insert_batch(
        &self,
        records: &[AggregatedRecord],
    ) -> Result<InsertOutcome, StorageClientError>;

    /// Maximum timestamp among stored records, `None` for an empty store.
    /// The ingestion path uses this to bound how far back history is replayed.
    async fn last_delivered_timestamp(
        &self,
    ) -> Result<Option<DateTime<Utc>>, StorageClientError>;
}

#[derive(Debug, Clone)]
pub struct HttpStorageBackendConfig {
    pub base_url: String,
    pub http_timeout_ms: u64,
}

impl Default for HttpStorageBackendConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            http_timeout_ms: DEFAULT_STORAGE_HTTP_TIMEOUT_MS,
        }
    }
}

/// HTTP implementation of [`StorageBackend`] against the data backend's
/// insert and last-timestamp endpoints.
pub struct HttpStorageBackend {
    config: HttpStorageBackendConfig,
    client: reqwest::Client,
}

impl HttpStorageBackend {
    pub fn new(config: HttpStorageBackendConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(anyhow!("storage backend base url must not be empty"));
        }
        if config.http_timeout_ms == 0 {
            return Err(anyhow!("storage backend http timeout must be greater than 0"));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .build()
            .context("failed to build storage backend http client")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Deserialize)]
struct LastTimestampResponse {
    timestamp: Option<DateTime<Utc>>,
}

#[async_trait]
impl StorageBackend for HttpStorageBackend {
    async fn insert_batch(
        &self,
        records: &[AggregatedRecord],
    ) -> Result<InsertOutcome, StorageClientError> {
        let response = self
            .client
            .post(self.endpoint(INSERT_PATH))
            .json(&records)
            .send()
            .await
            .map_err(|error| StorageClientError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StorageClientError::Status {
                status: status.as_u16(),
                detail: truncate_detail(&body),
            });
        }
        serde_json::from_str(&body).map_err(|error| StorageClientError::Decode(error.to_string()))
    }

    async fn last_delivered_timestamp(
        &self,
    ) -> Result<Option<DateTime<Utc>>, StorageClientError> {
        let response = self
            .client
            .get(self.endpoint(LAST_TIMESTAMP_PATH))
            .send()
            .await
            .map_err(|error| StorageClientError::Transport(error.to_string()))?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(StorageClientError::Status {
                status: status.as_u16(),
                detail: truncate_detail(&body),
            });
        }
        let parsed: LastTimestampResponse = serde_json::from_str(&body)
            .map_err(|error| StorageClientError::Decode(error.to_string()))?;
        Ok(parsed.timestamp)
    }
}

fn truncate_detail(body: &str) -> String {
    const MAX_DETAIL_CHARS: usize = 256;
    match body.char_indices().nth(MAX_DETAIL_CHARS) {
        Some((cut, _)) => format!("{}…", &body[..cut]),
        None => body.to_string(),
    }
}

#[derive(Debug, Default)]
/// In-process [`StorageBackend`] with the same dedup semantics as the real
/// store: rows live in a set keyed by the full record tuple, so overlapping
/// inserts collapse. Used by dry-run mode and tests.
pub struct MemoryStorageBackend {
    rows: Mutex<BTreeSet<AggregatedRecord>>,
}

impl MemoryStorageBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<AggregatedRecord> {
        self.rows
            .lock()
            .expect("memory store lock poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().expect("memory store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    async fn insert_batch(
        &self,
        records: &[AggregatedRecord],
    ) -> Result<InsertOutcome, StorageClientError> {
        let mut rows = self.rows.lock().expect("memory store lock poisoned");
        let mut inserted = 0usize;
        for record in records {
            if rows.insert(record.clone()) {
                inserted += 1;
            }
        }
        Ok(InsertOutcome {
            success: true,
            inserted,
        })
    }

    async fn last_delivered_timestamp(
        &self,
    ) -> Result<Option<DateTime<Utc>>, StorageClientError> {
        let rows = self.rows.lock().expect("memory store lock poisoned");
        Ok(rows.iter().map(|record| record.timestamp).max())
    }
}
