//! Document store adapter.
//!
//! The store is the only shared mutable resource between sessions and server
//! processes. Everything the lease layer needs reduces to four calls plus an
//! insert for ingestion: read by key, conditional replace guarded by the
//! version tag last read, delete, and filtered scan.

mod document;
mod memory;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::model::{QueuedRecord, RecordKey, Version, Versioned};

pub use self::document::RecordDocument;
pub use self::memory::InMemoryStore;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    #[error("corrupted document {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("document already exists: {0}")]
    AlreadyExists(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Timeout { .. })
    }
}

/// Result of a conditional replace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    Replaced(Version),
    /// Someone else wrote the document since it was read.
    Conflict,
    /// The document was deleted since it was read.
    NotFound,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanFilter {
    pub partition: Option<String>,
    pub leased_only: bool,
    pub limit: Option<usize>,
}

impl ScanFilter {
    pub fn partition(partition: impl Into<String>) -> Self {
        Self {
            partition: Some(partition.into()),
            ..Self::default()
        }
    }

    pub fn leased_only(mut self) -> Self {
        self.leased_only = true;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &QueuedRecord) -> bool {
        if let Some(partition) = &self.partition {
            if record.key.partition_key() != partition {
                return false;
            }
        }
        !self.leased_only || record.lease.is_leased()
    }
}

/// Scan rows that failed to decode come back as per-item errors so one bad
/// document never hides the rest of the partition.
pub type ScanItem = Result<Versioned<QueuedRecord>, StoreError>;

#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, key: &RecordKey) -> Result<Option<Versioned<QueuedRecord>>, StoreError>;

    /// Replace `record` (addressed by `record.key`) only if the stored version
    /// still equals `expected`.
    async fn conditional_replace(
        &self,
        record: &QueuedRecord,
        expected: &Version,
    ) -> Result<CasOutcome, StoreError>;

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError>;

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ScanItem>, StoreError>;

    async fn insert(&self, record: &QueuedRecord) -> Result<Version, StoreError>;
}

/// Runs one store call under a hard latency bound.
pub async fn bounded<T, F>(operation: &'static str, limit: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            operation,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// ETag over the key, a writer-chosen salt, and the serialized body.
pub(crate) fn compute_etag(key: &RecordKey, body: &str, salt: &[u8]) -> Version {
    let mut hasher = blake3::Hasher::new();
    hasher.update(key.partition_key().as_bytes());
    hasher.update(&[0]);
    hasher.update(key.row_key().as_bytes());
    hasher.update(&[0]);
    hasher.update(salt);
    hasher.update(body.as_bytes());
    let digest = hasher.finalize();
    Version::new(hex::encode(&digest.as_bytes()[..16]))
}
