use std::collections::BTreeMap;

use tokio::sync::RwLock;

use crate::model::{QueuedRecord, RecordKey, Version, Versioned};

use super::document::{decode, encode};
use super::{compute_etag, CasOutcome, DocumentStore, ScanFilter, ScanItem, StoreError};

struct Slot {
    body: String,
    etag: Version,
}

#[derive(Default)]
struct MemoryState {
    docs: BTreeMap<RecordKey, Slot>,
    // Bumped on every write so a rewrite of identical content still gets a new tag
    generation: u64,
}

impl MemoryState {
    fn stamp(&mut self, key: &RecordKey, body: &str) -> Version {
        self.generation += 1;
        compute_etag(key, body, &self.generation.to_le_bytes())
    }
}

/// Process-local document store. Documents are kept in their serialized form
/// so reads exercise the same codec as a remote store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.docs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a document body without any version check. For seeding
    /// malformed documents in tests.
    pub async fn put_raw(&self, key: RecordKey, body: impl Into<String>) -> Version {
        let body = body.into();
        let mut state = self.state.write().await;
        let etag = state.stamp(&key, &body);
        state.docs.insert(
            key,
            Slot {
                body,
                etag: etag.clone(),
            },
        );
        etag
    }
}

#[async_trait::async_trait]
impl DocumentStore for InMemoryStore {
    async fn read(&self, key: &RecordKey) -> Result<Option<Versioned<QueuedRecord>>, StoreError> {
        let state = self.state.read().await;
        match state.docs.get(key) {
            Some(slot) => Ok(Some(Versioned {
                value: decode(&key.to_string(), &slot.body)?,
                version: slot.etag.clone(),
            })),
            None => Ok(None),
        }
    }

    async fn conditional_replace(
        &self,
        record: &QueuedRecord,
        expected: &Version,
    ) -> Result<CasOutcome, StoreError> {
        let body = encode(record)?;
        let mut state = self.state.write().await;
        match state.docs.get(&record.key) {
            None => return Ok(CasOutcome::NotFound),
            Some(slot) if slot.etag != *expected => return Ok(CasOutcome::Conflict),
            Some(_) => {}
        }
        let etag = state.stamp(&record.key, &body);
        state.docs.insert(
            record.key.clone(),
            Slot {
                body,
                etag: etag.clone(),
            },
        );
        Ok(CasOutcome::Replaced(etag))
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        Ok(self.state.write().await.docs.remove(key).is_some())
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ScanItem>, StoreError> {
        let state = self.state.read().await;
        let limit = filter.limit.unwrap_or(usize::MAX);
        let items = state
            .docs
            .iter()
            .filter(|(key, _)| {
                filter
                    .partition
                    .as_deref()
                    .map_or(true, |p| key.partition_key() == p)
            })
            .map(|(key, slot)| {
                decode(&key.to_string(), &slot.body).map(|value| Versioned {
                    value,
                    version: slot.etag.clone(),
                })
            })
            // Corrupt documents pass through so the caller can report them
            .filter(|item| match item {
                Ok(v) => filter.matches(&v.value),
                Err(_) => true,
            })
            .take(limit)
            .collect();
        Ok(items)
    }

    async fn insert(&self, record: &QueuedRecord) -> Result<Version, StoreError> {
        let body = encode(record)?;
        let mut state = self.state.write().await;
        if state.docs.contains_key(&record.key) {
            return Err(StoreError::AlreadyExists(record.key.to_string()));
        }
        let etag = state.stamp(&record.key, &body);
        state.docs.insert(
            record.key.clone(),
            Slot {
                body,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }
}
