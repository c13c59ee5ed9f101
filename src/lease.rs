//! Lease manager.
//!
//! Acquire, validate, refresh, release and sweep the lease columns of single
//! records. The store's conditional replace is the only synchronization
//! primitive: every mutation is read, decide, then replace-if-unchanged, with
//! one re-read and retry when another writer got in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::clock::Clock;
use crate::config::CheckoutConfig;
use crate::model::{LeaseFields, LeaseToken, Owner, QueuedRecord, RecordKey, UnixTimeMs};
use crate::store::{bounded, CasOutcome, DocumentStore, ScanFilter, StoreError};

/// Extra read-modify-write rounds after a version conflict. Contention beyond
/// that means another session is actively working the record.
pub const CONFLICT_RETRY_LIMIT: u32 = 1;

const MIN_TTL: Duration = Duration::from_secs(1);

fn clamp_ttl(ttl: Duration) -> Duration {
    ttl.max(MIN_TTL)
}

/// A lease successfully taken or extended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub key: RecordKey,
    pub owner: Owner,
    pub token: LeaseToken,
    pub expires_at: UnixTimeMs,
}

// ============================================================================
// Metrics
// ============================================================================

#[derive(Debug, Default)]
pub struct LeaseMetrics {
    pub acquired: AtomicU64,
    pub contended: AtomicU64,
    pub conflicts: AtomicU64,
    pub refreshed: AtomicU64,
    pub released: AtomicU64,
    pub swept: AtomicU64,
    pub lost: AtomicU64,
    pub store_errors: AtomicU64,
}

impl LeaseMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> LeaseMetricsSnapshot {
        LeaseMetricsSnapshot {
            acquired: self.acquired.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            refreshed: self.refreshed.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            swept: self.swept.load(Ordering::Relaxed),
            lost: self.lost.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseMetricsSnapshot {
    pub acquired: u64,
    pub contended: u64,
    pub conflicts: u64,
    pub refreshed: u64,
    pub released: u64,
    pub swept: u64,
    pub lost: u64,
    pub store_errors: u64,
}

// ============================================================================
// Lease Manager
// ============================================================================

pub struct LeaseManager<S: DocumentStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    scan_limit: usize,
    metrics: Arc<LeaseMetrics>,
}

impl<S: DocumentStore> LeaseManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, config: &CheckoutConfig) -> Self {
        Self {
            store,
            clock,
            call_timeout: config.store_call_timeout(),
            scan_limit: config.scan_limit,
            metrics: Arc::new(LeaseMetrics::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn metrics(&self) -> &LeaseMetrics {
        &self.metrics
    }

    pub(crate) fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub(crate) fn note_lost(&self) {
        LeaseMetrics::bump(&self.metrics.lost);
    }

    fn track<T>(&self, result: Result<T, StoreError>) -> Result<T, StoreError> {
        if result.is_err() {
            LeaseMetrics::bump(&self.metrics.store_errors);
        }
        result
    }

    /// Read-decide-replace with [`CONFLICT_RETRY_LIMIT`] retries.
    ///
    /// `decide` sees the freshly read record and the current time. Returning
    /// `None` abandons the mutation; returning `Some` writes the modified
    /// record. A missing record, a refusal or exhausted retries all yield
    /// `Ok(None)`.
    async fn mutate<T, F>(&self, key: &RecordKey, mut decide: F) -> Result<Option<T>, StoreError>
    where
        F: FnMut(&mut QueuedRecord, UnixTimeMs) -> Option<T> + Send,
        T: Send,
    {
        for attempt in 0..=CONFLICT_RETRY_LIMIT {
            let read = bounded("read", self.call_timeout, self.store.read(key)).await;
            let Some(current) = self.track(read)? else {
                return Ok(None);
            };

            let mut record = current.value;
            let Some(result) = decide(&mut record, self.clock.now()) else {
                return Ok(None);
            };

            let replaced = bounded(
                "replace",
                self.call_timeout,
                self.store.conditional_replace(&record, &current.version),
            )
            .await;
            match self.track(replaced)? {
                CasOutcome::Replaced(_) => return Ok(Some(result)),
                CasOutcome::NotFound => return Ok(None),
                CasOutcome::Conflict => {
                    LeaseMetrics::bump(&self.metrics.conflicts);
                    debug!(attempt, "Version conflict on {}", key);
                }
            }
        }
        Ok(None)
    }

    /// Take the lease on a free record. `None` when the record is missing,
    /// held by someone else, or still contended after the retry.
    #[instrument(skip_all, fields(key = %key, owner = %owner))]
    pub async fn try_acquire(
        &self,
        key: &RecordKey,
        owner: &Owner,
        ttl: Duration,
    ) -> Result<Option<Lease>, StoreError> {
        let ttl = clamp_ttl(ttl);
        let token = LeaseToken::generate();
        let outcome = self
            .mutate(key, |record, now| {
                if !record.lease.is_free(now) {
                    return None;
                }
                record.lease = LeaseFields::grant(owner, &token, now, ttl);
                record.lease.expires_at
            })
            .await?;

        match outcome {
            Some(expires_at) => {
                LeaseMetrics::bump(&self.metrics.acquired);
                info!("Lease acquired until {}", expires_at.to_rfc3339());
                Ok(Some(Lease {
                    key: key.clone(),
                    owner: owner.clone(),
                    token,
                    expires_at,
                }))
            }
            None => {
                LeaseMetrics::bump(&self.metrics.contended);
                debug!("Record not acquirable");
                Ok(None)
            }
        }
    }

    /// True iff the pair holds the lease and it has not yet expired.
    #[instrument(skip_all, fields(key = %key, owner = %owner))]
    pub async fn validate(
        &self,
        key: &RecordKey,
        owner: &Owner,
        token: &LeaseToken,
    ) -> Result<bool, StoreError> {
        let read = bounded("read", self.call_timeout, self.store.read(key)).await;
        let valid = self
            .track(read)?
            .is_some_and(|current| current.value.lease.is_valid_for(owner, token, self.clock.now()));
        if !valid {
            LeaseMetrics::bump(&self.metrics.lost);
            debug!("Lease no longer valid");
        }
        Ok(valid)
    }

    /// Extend a live lease. The expiry never moves backwards.
    #[instrument(skip_all, fields(key = %key, owner = %owner))]
    pub async fn refresh(
        &self,
        key: &RecordKey,
        owner: &Owner,
        token: &LeaseToken,
        ttl: Duration,
    ) -> Result<Option<UnixTimeMs>, StoreError> {
        let ttl = clamp_ttl(ttl);
        let outcome = self
            .mutate(key, |record, now| {
                if !record.lease.is_valid_for(owner, token, now) {
                    return None;
                }
                let extended = now.saturating_add(ttl);
                let expires_at = record.lease.expires_at.map_or(extended, |cur| cur.max(extended));
                record.lease.expires_at = Some(expires_at);
                Some(expires_at)
            })
            .await?;

        match outcome {
            Some(expires_at) => {
                LeaseMetrics::bump(&self.metrics.refreshed);
                debug!("Lease extended until {}", expires_at.to_rfc3339());
            }
            None => {
                LeaseMetrics::bump(&self.metrics.lost);
                warn!("Refresh refused, lease lost");
            }
        }
        Ok(outcome)
    }

    /// Clear the lease if the pair still holds it. Expired-but-unswept leases
    /// can still be released by their holder.
    #[instrument(skip_all, fields(key = %key, owner = %owner))]
    pub async fn release(
        &self,
        key: &RecordKey,
        owner: &Owner,
        token: &LeaseToken,
    ) -> Result<bool, StoreError> {
        let released = self
            .mutate(key, |record, _now| {
                if !record.lease.is_held_by(owner, token) {
                    return None;
                }
                record.lease.clear();
                Some(())
            })
            .await?
            .is_some();

        if released {
            LeaseMetrics::bump(&self.metrics.released);
            info!("Lease released");
        }
        Ok(released)
    }

    /// Clear every lapsed lease in `partition`. Conflicts and per-record
    /// failures are skipped; only a failed scan is an error.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, partition: &str) -> Result<usize, StoreError> {
        let filter = ScanFilter::partition(partition)
            .leased_only()
            .limit(self.scan_limit);
        let scanned = bounded("scan", self.call_timeout, self.store.scan(&filter)).await;
        let items = self.track(scanned)?;

        let now = self.clock.now();
        let mut cleared = 0;
        for item in items {
            let record = match item {
                Ok(versioned) => versioned.value,
                Err(e) => {
                    warn!("Skipping unreadable document during sweep: {}", e);
                    continue;
                }
            };
            if !record.lease.is_leased() || !record.lease.is_free(now) {
                continue;
            }

            let swept = self
                .mutate(&record.key, |current, now| {
                    if !current.lease.is_leased() || !current.lease.is_free(now) {
                        return None;
                    }
                    current.lease.clear();
                    Some(())
                })
                .await;
            match swept {
                Ok(Some(())) => cleared += 1,
                Ok(None) => debug!("Skipped sweep of {}", record.key),
                Err(e) => warn!("Sweep of {} failed: {}", record.key, e),
            }
        }

        if cleared > 0 {
            self.metrics.swept.fetch_add(cleared as u64, Ordering::Relaxed);
            info!("Swept {} expired leases", cleared);
        }
        Ok(cleared)
    }
}
