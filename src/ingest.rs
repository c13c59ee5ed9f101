//! Bulk loading and clearing of the pending pool.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::CheckoutConfig;
use crate::error::CheckoutError;
use crate::model::{QueuedRecord, RecordKey, StoredPayload, UnixTimeMs};
use crate::store::{bounded, DocumentStore, ScanFilter, StoreError};

/// Inline payloads above this size need blob storage, which ingestion does
/// not write.
pub const MAX_INLINE_PAYLOAD_BYTES: usize = 1_900_000;

pub const DEFAULT_RECORD_ID_FIELD: &str = "IdCorreo";

pub struct Ingestor<S: DocumentStore> {
    store: Arc<S>,
    partition: String,
    call_timeout: Duration,
    scan_limit: usize,
    record_id_field: String,
}

impl<S: DocumentStore> Ingestor<S> {
    pub fn new(store: Arc<S>, config: &CheckoutConfig) -> Self {
        Self {
            store,
            partition: config.partition.clone(),
            call_timeout: config.store_call_timeout(),
            scan_limit: config.scan_limit,
            record_id_field: DEFAULT_RECORD_ID_FIELD.to_string(),
        }
    }

    /// Payload field copied into the record's `recordId`.
    pub fn with_record_id_field(mut self, field: impl Into<String>) -> Self {
        self.record_id_field = field.into();
        self
    }

    fn build(&self, fields: &Map<String, Value>, now: UnixTimeMs) -> Result<QueuedRecord, CheckoutError> {
        let json = serde_json::to_string(fields)
            .map_err(|e| CheckoutError::Validation(format!("unserializable record: {e}")))?;
        if json.len() > MAX_INLINE_PAYLOAD_BYTES {
            return Err(CheckoutError::Validation(format!(
                "record payload of {} bytes exceeds the inline limit",
                json.len()
            )));
        }

        let record_id = match fields.get(&self.record_id_field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        let key = RecordKey::new(&self.partition, Uuid::new_v4().simple().to_string())?;
        Ok(QueuedRecord::new(key, StoredPayload::Inline(json))
            .with_record_id(record_id)
            .with_created_at(now))
    }

    /// Create one unleased record per row, each under a fresh row key.
    /// Stops at the first failure; rows before it stay created.
    #[instrument(skip_all, fields(partition = %self.partition))]
    pub async fn ingest_records<I>(&self, rows: I, now: UnixTimeMs) -> Result<usize, CheckoutError>
    where
        I: IntoIterator<Item = Map<String, Value>>,
    {
        let mut created = 0;
        for fields in rows {
            let record = self.build(&fields, now)?;
            bounded("insert", self.call_timeout, self.store.insert(&record)).await?;
            created += 1;
        }
        info!("Ingested {} records", created);
        Ok(created)
    }

    /// Delete every record in the partition, leased or not. Per-record
    /// failures are skipped.
    #[instrument(skip_all, fields(partition = %self.partition))]
    pub async fn clear_partition(&self) -> Result<usize, CheckoutError> {
        let filter = ScanFilter::partition(&self.partition).limit(self.scan_limit);
        let items = bounded("scan", self.call_timeout, self.store.scan(&filter)).await?;

        let mut deleted = 0;
        for item in items {
            let key = match item {
                Ok(versioned) => versioned.value.key,
                Err(StoreError::Corrupted { key, .. }) => match corrupted_key(&key) {
                    Some(key) => key,
                    None => {
                        warn!("Cannot address corrupt document {}", key);
                        continue;
                    }
                },
                Err(e) => {
                    warn!("Skipping unreadable document: {}", e);
                    continue;
                }
            };
            match bounded("delete", self.call_timeout, self.store.delete(&key)).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => warn!("Delete of {} failed: {}", key, e),
            }
        }
        info!("Cleared {} records", deleted);
        Ok(deleted)
    }
}

fn corrupted_key(display: &str) -> Option<RecordKey> {
    let (pk, rk) = display.split_once('/')?;
    RecordKey::new(pk, rk).ok()
}
