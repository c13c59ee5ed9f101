//! Queue selector and per-session lease state.
//!
//! A [`SessionLease`] is plain data owned by one reviewer session: what it
//! holds and which candidates it has yet to try. [`QueueSelector`] runs the
//! operations over it, turning "give me a record" into a record exclusively
//! leased to the session.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::CheckoutConfig;
use crate::error::{CheckoutError, SelectionStop};
use crate::heartbeat::{self, HeartbeatResponse};
use crate::lease::LeaseManager;
use crate::model::{LeaseToken, Owner, RecordKey, UnixTimeMs};
use crate::outcome::{Outcome, OutcomeRecord, OutcomeSink};
use crate::payload::{load_payload, BlobReader, Payload};
use crate::store::{bounded, DocumentStore, ScanFilter, StoreError};

// ============================================================================
// Session State
// ============================================================================

/// A record the session holds a lease on, with its payload loaded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldRecord {
    pub key: RecordKey,
    pub token: LeaseToken,
    pub expires_at: UnixTimeMs,
    pub record_id: String,
    pub payload: Payload,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    /// Trying to lease this candidate. Only observed if a selection was
    /// cancelled midway; treated as idle by the next call.
    Selecting(RecordKey),
    Holding(HeldRecord),
}

#[derive(Debug, Default)]
pub struct SessionLease {
    state: SessionState,
    candidates: Vec<RecordKey>,
    loaded: bool,
    // Outcome already written for the held record; only the delete is pending
    outcome_written: bool,
}

impl SessionLease {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn held(&self) -> Option<&HeldRecord> {
        match &self.state {
            SessionState::Holding(held) => Some(held),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[RecordKey] {
        &self.candidates
    }

    /// Records this session still expects to see, counting the held one.
    pub fn pending_count(&self) -> usize {
        self.candidates.len() + usize::from(self.held().is_some())
    }

    /// Forget the held record without touching the store. Its lease runs out
    /// on its own.
    pub fn abandon(&mut self) {
        if let SessionState::Holding(held) = &self.state {
            debug!("Abandoning {}", held.key);
        }
        self.state = SessionState::Idle;
        self.outcome_written = false;
    }

    fn hold(&mut self, held: HeldRecord) {
        self.candidates.retain(|k| *k != held.key);
        self.state = SessionState::Holding(held);
        self.outcome_written = false;
    }
}

/// Bookkeeping for one `next_record` call.
struct SelectionRun {
    started: UnixTimeMs,
    attempts: u32,
    reloads: u32,
    store_failures: u32,
    last_store_error: Option<StoreError>,
}

impl SelectionRun {
    fn new(started: UnixTimeMs) -> Self {
        Self {
            started,
            attempts: 0,
            reloads: 0,
            store_failures: 0,
            last_store_error: None,
        }
    }

    /// Every attempt failing on the store is an outage, not contention.
    fn give_up(
        &mut self,
        session: &mut SessionLease,
        elapsed_ms: u64,
        cause: SelectionStop,
    ) -> CheckoutError {
        session.state = SessionState::Idle;
        if self.attempts > 0 && self.store_failures == self.attempts {
            if let Some(e) = self.last_store_error.take() {
                warn!(attempts = self.attempts, "Selection failed on store errors: {}", e);
                return CheckoutError::Store(e);
            }
        }
        warn!(
            attempts = self.attempts,
            elapsed_ms,
            "Selection gave up: {}",
            cause.as_str()
        );
        CheckoutError::SelectionTimeout {
            attempts: self.attempts,
            elapsed_ms,
            cause,
        }
    }
}

// ============================================================================
// Queue Selector
// ============================================================================

pub struct QueueSelector<S: DocumentStore> {
    leases: LeaseManager<S>,
    blobs: Arc<dyn BlobReader>,
    outcomes: Arc<dyn OutcomeSink>,
    config: CheckoutConfig,
}

impl<S: DocumentStore> QueueSelector<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        blobs: Arc<dyn BlobReader>,
        outcomes: Arc<dyn OutcomeSink>,
        config: CheckoutConfig,
    ) -> Result<Self, CheckoutError> {
        config.validate()?;
        Ok(Self {
            leases: LeaseManager::new(store, clock, &config),
            blobs,
            outcomes,
            config,
        })
    }

    pub fn leases(&self) -> &LeaseManager<S> {
        &self.leases
    }

    pub fn config(&self) -> &CheckoutConfig {
        &self.config
    }

    fn now(&self) -> UnixTimeMs {
        self.leases.clock().now()
    }

    /// Refill the candidate queue with a shuffled scan of the partition.
    /// Free records are preferred; when none look free every key is queued,
    /// since the scan may be stale. Returns the number of candidates.
    async fn populate(&self, session: &mut SessionLease) -> Result<usize, CheckoutError> {
        let filter = ScanFilter::partition(&self.config.partition).limit(self.config.scan_limit);
        let items = bounded(
            "scan",
            self.leases.call_timeout(),
            self.leases.store().scan(&filter),
        )
        .await?;

        let now = self.now();
        let mut free = Vec::new();
        let mut all = Vec::new();
        for item in items {
            match item {
                Ok(versioned) => {
                    let record = versioned.value;
                    if record.lease.is_free(now) {
                        free.push(record.key.clone());
                    }
                    all.push(record.key);
                }
                Err(e) => warn!("Skipping unreadable document: {}", e),
            }
        }

        let mut keys = if free.is_empty() { all } else { free };
        keys.shuffle(&mut rand::thread_rng());
        debug!("Loaded {} candidates", keys.len());
        session.candidates = keys;
        session.loaded = true;
        Ok(session.candidates.len())
    }

    /// Lease a candidate and load its payload. A candidate that is taken,
    /// gone, or whose payload cannot be loaded yields `Ok(None)`; only a
    /// failed acquisition call is an error.
    async fn claim(&self, key: &RecordKey, owner: &Owner) -> Result<Option<HeldRecord>, StoreError> {
        let Some(lease) = self
            .leases
            .try_acquire(key, owner, self.config.lease_ttl())
            .await?
        else {
            return Ok(None);
        };

        match self.fetch_payload(key).await {
            Ok((record_id, payload)) => Ok(Some(HeldRecord {
                key: lease.key,
                token: lease.token,
                expires_at: lease.expires_at,
                record_id,
                payload,
            })),
            Err(e) => {
                warn!("Payload for {} unavailable, releasing: {}", key, e);
                if let Err(e) = self.leases.release(key, owner, &lease.token).await {
                    warn!("Release of {} failed: {}", key, e);
                }
                Ok(None)
            }
        }
    }

    async fn fetch_payload(&self, key: &RecordKey) -> Result<(String, Payload), CheckoutError> {
        let read = bounded(
            "read",
            self.leases.call_timeout(),
            self.leases.store().read(key),
        )
        .await?;
        let Some(current) = read else {
            return Err(CheckoutError::Payload {
                key: key.clone(),
                reason: "record deleted".into(),
            });
        };
        let payload = load_payload(&current.value, self.blobs.as_ref()).await?;
        Ok((current.value.record_id, payload))
    }

    /// Hand the session a record it holds exclusively.
    ///
    /// `Ok(None)` means the partition is genuinely empty. Running out of
    /// attempts, time or candidates while records exist is a
    /// [`CheckoutError::SelectionTimeout`].
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn next_record(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
    ) -> Result<Option<HeldRecord>, CheckoutError> {
        if let SessionState::Holding(held) = &session.state {
            if held.expires_at > self.now() {
                return Ok(Some(held.clone()));
            }
            warn!("Held lease on {} has expired, selecting again", held.key);
            self.leases.note_lost();
        }
        // A cancelled selection leaves `Selecting` behind; start over from idle
        session.abandon();

        let mut run = SelectionRun::new(self.now());
        let budget = self.config.selection_timeout();
        let outcome = tokio::time::timeout(budget, self.select(session, owner, &mut run)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                // Cut mid-call; a lease taken by the dropped call lapses on its own
                let elapsed_ms = self
                    .now()
                    .millis_since(run.started)
                    .max(self.config.selection_timeout_ms);
                Err(run.give_up(session, elapsed_ms, SelectionStop::DeadlineExceeded))
            }
        }
    }

    /// The candidate loop behind [`QueueSelector::next_record`]. Runs inside
    /// the selection budget; the clock check at the top of each round also
    /// ends selections against a virtual clock.
    async fn select(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
        run: &mut SelectionRun,
    ) -> Result<Option<HeldRecord>, CheckoutError> {
        if !session.loaded && self.populate(session).await? == 0 {
            return Ok(None);
        }

        let budget = self.config.selection_timeout();
        loop {
            let elapsed_ms = self.now().millis_since(run.started);
            if Duration::from_millis(elapsed_ms) > budget {
                return Err(run.give_up(session, elapsed_ms, SelectionStop::DeadlineExceeded));
            }

            let Some(candidate) = session.candidates.pop() else {
                if run.reloads >= self.config.max_reloads_per_selection {
                    return Err(run.give_up(
                        session,
                        elapsed_ms,
                        SelectionStop::AllCandidatesContended,
                    ));
                }
                run.reloads += 1;
                if let Err(e) = self.leases.sweep_expired(&self.config.partition).await {
                    warn!("Sweep before reload failed: {}", e);
                }
                if self.populate(session).await? == 0 {
                    session.state = SessionState::Idle;
                    return Ok(None);
                }
                continue;
            };

            if run.attempts >= self.config.max_selection_attempts {
                session.candidates.push(candidate);
                return Err(run.give_up(session, elapsed_ms, SelectionStop::AttemptsExhausted));
            }
            run.attempts += 1;

            session.state = SessionState::Selecting(candidate.clone());
            match self.claim(&candidate, owner).await {
                Ok(Some(held)) => {
                    info!(attempts = run.attempts, "Holding {}", held.key);
                    session.hold(held.clone());
                    return Ok(Some(held));
                }
                Ok(None) => debug!("Candidate {} not available", candidate),
                Err(e) => {
                    warn!("Store error acquiring {}: {}", candidate, e);
                    run.store_failures += 1;
                    run.last_store_error = Some(e);
                }
            }
        }
    }

    /// Switch the session to a named record, releasing whatever it held.
    /// `Ok(None)` when that record cannot be leased right now.
    #[instrument(skip_all, fields(owner = %owner, key = %key))]
    pub async fn select_specific(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
        key: &RecordKey,
    ) -> Result<Option<HeldRecord>, CheckoutError> {
        if let Some(held) = session.held() {
            if held.key == *key && held.expires_at > self.now() {
                return Ok(Some(held.clone()));
            }
        }

        if let Err(e) = self.release_current(session, owner).await {
            warn!("Could not release previous record: {}", e);
            session.abandon();
        }

        let Some(lease) = self
            .leases
            .try_acquire(key, owner, self.config.lease_ttl())
            .await?
        else {
            return Ok(None);
        };

        match self.fetch_payload(key).await {
            Ok((record_id, payload)) => {
                let held = HeldRecord {
                    key: lease.key,
                    token: lease.token,
                    expires_at: lease.expires_at,
                    record_id,
                    payload,
                };
                info!("Holding {}", held.key);
                session.hold(held.clone());
                Ok(Some(held))
            }
            Err(e) => {
                if let Err(release_err) = self.leases.release(key, owner, &lease.token).await {
                    warn!("Release of {} failed: {}", key, release_err);
                }
                Err(e)
            }
        }
    }

    /// Record the outcome for the held record and delete it.
    ///
    /// The lease is checked first; a lost lease drops the record from the
    /// session and fails with [`CheckoutError::LeaseLost`]. If the outcome
    /// write or the delete fails the session keeps holding so the caller can
    /// retry. A retry after a failed delete neither writes the outcome again
    /// nor re-checks the lease, so it still deletes after the lease lapsed.
    #[instrument(skip_all, fields(owner = %owner, outcome = outcome.kind()))]
    pub async fn resolve(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
        outcome: Outcome,
    ) -> Result<RecordKey, CheckoutError> {
        let Some(held) = session.held().cloned() else {
            return Err(CheckoutError::NotHolding);
        };

        // Once the outcome is written the record is finished whatever its lease
        // says; only the delete is left, and it must not go back to the pool.
        if !session.outcome_written
            && !self.leases.validate(&held.key, owner, &held.token).await?
        {
            warn!("Lease on {} lost before resolution", held.key);
            session.abandon();
            return Err(CheckoutError::LeaseLost { key: held.key });
        }

        if !session.outcome_written {
            let record = OutcomeRecord {
                key: held.key.clone(),
                record_id: held.record_id.clone(),
                owner: owner.as_str().to_string(),
                outcome,
                payload: held.payload.clone(),
                resolved_at: self.now(),
            };
            if let Err(e) = self.outcomes.write(&record).await {
                error!("Failed to write outcome for {}: {}", held.key, e);
                return Err(CheckoutError::Outcome {
                    key: held.key,
                    reason: e.to_string(),
                });
            }
            session.outcome_written = true;
        }

        let deleted = bounded(
            "delete",
            self.leases.call_timeout(),
            self.leases.store().delete(&held.key),
        )
        .await;
        match deleted {
            Ok(existed) => {
                if !existed {
                    debug!("{} was already gone", held.key);
                }
                info!("Resolved {}", held.key);
                session.abandon();
                Ok(held.key)
            }
            Err(e) => {
                error!("Failed to delete {}: {}", held.key, e);
                Err(e.into())
            }
        }
    }

    /// Give the held record back to the queue. Returns whether a lease was
    /// actually cleared in the store.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn release_current(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
    ) -> Result<bool, CheckoutError> {
        let Some(held) = session.held() else {
            return Ok(false);
        };
        let released = self.leases.release(&held.key, owner, &held.token).await?;
        session.abandon();
        Ok(released)
    }

    /// Check the held lease against the store, dropping the record if it
    /// was lost.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn ensure_current_valid(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
    ) -> Result<bool, CheckoutError> {
        let Some(held) = session.held() else {
            return Ok(false);
        };
        let valid = self.leases.validate(&held.key, owner, &held.token).await?;
        if !valid {
            warn!("Lease on {} lost", held.key);
            session.abandon();
        }
        Ok(valid)
    }

    /// Extend the held lease. A lost lease drops the record from the session.
    #[instrument(skip_all, fields(owner = %owner))]
    pub async fn heartbeat(
        &self,
        session: &mut SessionLease,
        owner: &Owner,
    ) -> Result<HeartbeatResponse, CheckoutError> {
        let held = session.held().map(|h| (h.key.clone(), h.token.clone()));
        let response = heartbeat::heartbeat(
            &self.leases,
            held.as_ref().map(|(k, t)| (k, t)),
            owner,
            self.config.lease_ttl(),
        )
        .await?;

        match &response {
            HeartbeatResponse::Extended { expires_at, .. } => {
                if let SessionState::Holding(held) = &mut session.state {
                    held.expires_at = *expires_at;
                }
            }
            HeartbeatResponse::LeaseLost { .. } => session.abandon(),
            HeartbeatResponse::NothingHeld => {}
        }
        Ok(response)
    }

    pub fn pending_count(&self, session: &SessionLease) -> usize {
        session.pending_count()
    }
}
