#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use review_queue::{
    CasOutcome, CheckoutConfig, DocumentStore, InMemoryStore, ManualClock, NoBlobs, QueueSelector,
    QueuedRecord, RecordKey, RecordingSink, ScanFilter, StoreError, StoredPayload, UnixTimeMs,
    Version, Versioned,
};
use review_queue::store::ScanItem;

pub const TTL: Duration = Duration::from_secs(600);

pub fn make_now() -> UnixTimeMs {
    UnixTimeMs(1_700_000_000_000)
}

pub fn key(rk: &str) -> RecordKey {
    RecordKey::new("active", rk).unwrap()
}

pub fn record(rk: &str) -> QueuedRecord {
    QueuedRecord::new(
        key(rk),
        StoredPayload::Inline(format!(r#"{{"IdCorreo":"{rk}","Asunto":"Consulta"}}"#)),
    )
    .with_record_id(rk)
}

pub async fn seed<S: DocumentStore>(store: &S, keys: &[&str]) {
    for rk in keys {
        store.insert(&record(rk)).await.unwrap();
    }
}

pub fn selector<S: DocumentStore>(
    store: Arc<S>,
    clock: Arc<ManualClock>,
    config: CheckoutConfig,
) -> QueueSelector<S> {
    QueueSelector::new(
        store,
        clock,
        Arc::new(NoBlobs),
        Arc::new(RecordingSink::new()),
        config,
    )
    .unwrap()
}

/// Store wrapper with switchable failures.
pub struct FailableStore<S: DocumentStore> {
    pub inner: S,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
    fail_scans: AtomicBool,
}

impl<S: DocumentStore> FailableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            fail_scans: AtomicBool::new(false),
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_scans(&self, fail: bool) {
        self.fail_scans.store(fail, Ordering::SeqCst);
    }

    fn injected(flag: &AtomicBool) -> Result<(), StoreError> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("Injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: DocumentStore> DocumentStore for FailableStore<S> {
    async fn read(&self, key: &RecordKey) -> Result<Option<Versioned<QueuedRecord>>, StoreError> {
        Self::injected(&self.fail_reads)?;
        self.inner.read(key).await
    }

    async fn conditional_replace(
        &self,
        record: &QueuedRecord,
        expected: &Version,
    ) -> Result<CasOutcome, StoreError> {
        Self::injected(&self.fail_writes)?;
        self.inner.conditional_replace(record, expected).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        Self::injected(&self.fail_deletes)?;
        self.inner.delete(key).await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ScanItem>, StoreError> {
        Self::injected(&self.fail_scans)?;
        self.inner.scan(filter).await
    }

    async fn insert(&self, record: &QueuedRecord) -> Result<Version, StoreError> {
        Self::injected(&self.fail_writes)?;
        self.inner.insert(record).await
    }
}

/// Every read costs `step` of virtual time; used to run out selection
/// budgets without sleeping.
pub struct SlowStore {
    pub inner: InMemoryStore,
    clock: Arc<ManualClock>,
    step: Duration,
    pub reads: AtomicU32,
}

impl SlowStore {
    pub fn new(clock: Arc<ManualClock>, step: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            clock,
            step,
            reads: AtomicU32::new(0),
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for SlowStore {
    async fn read(&self, key: &RecordKey) -> Result<Option<Versioned<QueuedRecord>>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.clock.advance(self.step);
        self.inner.read(key).await
    }

    async fn conditional_replace(
        &self,
        record: &QueuedRecord,
        expected: &Version,
    ) -> Result<CasOutcome, StoreError> {
        self.inner.conditional_replace(record, expected).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ScanItem>, StoreError> {
        self.inner.scan(filter).await
    }

    async fn insert(&self, record: &QueuedRecord) -> Result<Version, StoreError> {
        self.inner.insert(record).await
    }
}

/// Every read waits `delay` on the tokio timer. Pair with paused time.
pub struct StallingStore {
    pub inner: InMemoryStore,
    delay: Duration,
}

impl StallingStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: InMemoryStore::new(),
            delay,
        }
    }
}

#[async_trait::async_trait]
impl DocumentStore for StallingStore {
    async fn read(&self, key: &RecordKey) -> Result<Option<Versioned<QueuedRecord>>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.read(key).await
    }

    async fn conditional_replace(
        &self,
        record: &QueuedRecord,
        expected: &Version,
    ) -> Result<CasOutcome, StoreError> {
        self.inner.conditional_replace(record, expected).await
    }

    async fn delete(&self, key: &RecordKey) -> Result<bool, StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<Vec<ScanItem>, StoreError> {
        self.inner.scan(filter).await
    }

    async fn insert(&self, record: &QueuedRecord) -> Result<Version, StoreError> {
        self.inner.insert(record).await
    }
}
