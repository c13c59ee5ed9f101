use thiserror::Error;

use crate::model::RecordKey;
use crate::store::StoreError;

/// Why a selection gave up before handing out a record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SelectionStop {
    /// Acquisition attempt counter hit `max_selection_attempts`.
    AttemptsExhausted,
    /// Wall-clock budget `selection_timeout_ms` ran out.
    DeadlineExceeded,
    /// Every candidate was held by someone else, even after a sweep and reload.
    AllCandidatesContended,
}

impl SelectionStop {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionStop::AttemptsExhausted => "attempts_exhausted",
            SelectionStop::DeadlineExceeded => "deadline_exceeded",
            SelectionStop::AllCandidatesContended => "all_candidates_contended",
        }
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("lease lost on {key}")]
    LeaseLost { key: RecordKey },

    #[error("session holds no record")]
    NotHolding,

    #[error(
        "no record currently available after {attempts} attempts in {elapsed_ms}ms ({})",
        cause.as_str()
    )]
    SelectionTimeout {
        attempts: u32,
        elapsed_ms: u64,
        cause: SelectionStop,
    },

    #[error("outcome write failed for {key}: {reason}")]
    Outcome { key: RecordKey, reason: String },

    #[error("payload unavailable for {key}: {reason}")]
    Payload { key: RecordKey, reason: String },

    #[error("invalid owner: {0}")]
    InvalidOwner(String),

    #[error("validation error: {0}")]
    Validation(String),
}

impl CheckoutError {
    /// Whether asking again shortly can succeed without user intervention.
    pub fn is_retryable(&self) -> bool {
        match self {
            CheckoutError::Store(e) => e.is_transient(),
            CheckoutError::SelectionTimeout { .. } | CheckoutError::Outcome { .. } => true,
            CheckoutError::LeaseLost { .. }
            | CheckoutError::NotHolding
            | CheckoutError::Payload { .. }
            | CheckoutError::InvalidOwner(_)
            | CheckoutError::Validation(_) => false,
        }
    }

    pub fn http_status_hint(&self) -> u16 {
        match self {
            CheckoutError::Store(_) => 503,
            CheckoutError::LeaseLost { .. } => 409,
            CheckoutError::NotHolding => 204,
            CheckoutError::SelectionTimeout { .. } => 503,
            CheckoutError::Outcome { .. } => 502,
            CheckoutError::Payload { .. } => 404,
            CheckoutError::InvalidOwner(_) | CheckoutError::Validation(_) => 400,
        }
    }
}
