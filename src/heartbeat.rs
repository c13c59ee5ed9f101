//! Heartbeat contract: a client holding a record periodically asks for its
//! lease to be extended.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::{info, instrument};

use crate::lease::LeaseManager;
use crate::model::{LeaseToken, Owner, RecordKey, UnixTimeMs};
use crate::store::{DocumentStore, StoreError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeartbeatResponse {
    Extended {
        key: RecordKey,
        expires_at: UnixTimeMs,
    },
    /// The lease expired or was taken. The client must stop working the record.
    LeaseLost { key: RecordKey },
    NothingHeld,
}

impl HeartbeatResponse {
    pub fn status_code(&self) -> u16 {
        match self {
            HeartbeatResponse::Extended { .. } => 200,
            HeartbeatResponse::LeaseLost { .. } => 409,
            HeartbeatResponse::NothingHeld => 204,
        }
    }

    pub fn body(&self) -> Option<Value> {
        match self {
            HeartbeatResponse::Extended { expires_at, .. } => Some(json!({
                "lease_expires_at": expires_at.to_rfc3339(),
                "lease_until_ms": expires_at.0,
            })),
            HeartbeatResponse::LeaseLost { .. } | HeartbeatResponse::NothingHeld => None,
        }
    }
}

/// Refresh the lease a client claims to hold. Works from the client's echoed
/// key and token alone, without any session state.
#[instrument(skip_all, fields(owner = %owner))]
pub async fn heartbeat<S: DocumentStore>(
    leases: &LeaseManager<S>,
    held: Option<(&RecordKey, &LeaseToken)>,
    owner: &Owner,
    ttl: Duration,
) -> Result<HeartbeatResponse, StoreError> {
    let Some((key, token)) = held else {
        return Ok(HeartbeatResponse::NothingHeld);
    };
    match leases.refresh(key, owner, token, ttl).await? {
        Some(expires_at) => Ok(HeartbeatResponse::Extended {
            key: key.clone(),
            expires_at,
        }),
        None => {
            info!("Heartbeat for {} found the lease gone", key);
            Ok(HeartbeatResponse::LeaseLost { key: key.clone() })
        }
    }
}
