//! Checkout and lease handling for a shared human-review queue.
//!
//! Reviewer sessions pull pending records from a document store one at a
//! time. Each record handed out carries a time-bounded lease written into the
//! record itself with the store's conditional replace, so sessions in any
//! number of processes never work the same record at once, and a record
//! whose reviewer disappears becomes available again once its lease lapses.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod clock;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod ingest;
pub mod lease;
pub mod model;
pub mod outcome;
pub mod payload;
pub mod registry;
pub mod selector;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CheckoutConfig;
pub use error::{CheckoutError, SelectionStop};
pub use heartbeat::HeartbeatResponse;
pub use ingest::Ingestor;
pub use lease::{Lease, LeaseManager, LeaseMetrics, LeaseMetricsSnapshot, CONFLICT_RETRY_LIMIT};
pub use model::{
    BlobRef, LeaseFields, LeaseToken, Owner, QueuedRecord, RecordKey, StoredPayload, UnixTimeMs,
    Version, Versioned,
};
pub use outcome::{Outcome, OutcomeRecord, OutcomeSink, RecordingSink};
pub use payload::{BlobReader, InMemoryBlobs, NoBlobs, Payload};
pub use registry::{SessionHandle, SessionId, SessionRegistry};
pub use selector::{HeldRecord, QueueSelector, SessionLease, SessionState};
#[cfg(not(target_arch = "wasm32"))]
pub use store::SqliteStore;
pub use store::{CasOutcome, DocumentStore, InMemoryStore, ScanFilter, StoreError};
