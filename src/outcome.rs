use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::CheckoutError;
use crate::model::{RecordKey, UnixTimeMs};
use crate::payload::Payload;
use crate::store::StoreError;

/// How a reviewer finished with a record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Reviewed { status: String, notes: String },
    /// Skipped without a verdict. Still terminal for the record.
    Discarded,
}

impl Outcome {
    pub fn reviewed(status: impl Into<String>, notes: impl Into<String>) -> Result<Self, CheckoutError> {
        let status = status.into().trim().to_string();
        if status.is_empty() {
            return Err(CheckoutError::Validation(
                "a review needs a final status".into(),
            ));
        }
        Ok(Outcome::Reviewed {
            status,
            notes: notes.into().trim().to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Reviewed { .. } => "reviewed",
            Outcome::Discarded => "discarded",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutcomeRecord {
    pub key: RecordKey,
    pub record_id: String,
    pub owner: String,
    pub outcome: Outcome,
    pub payload: Payload,
    pub resolved_at: UnixTimeMs,
}

/// Destination for resolution results, written before the record is deleted.
#[async_trait::async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn write(&self, record: &OutcomeRecord) -> Result<(), StoreError>;
}

/// Keeps every outcome in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<OutcomeRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<OutcomeRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl OutcomeSink for RecordingSink {
    async fn write(&self, record: &OutcomeRecord) -> Result<(), StoreError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}
