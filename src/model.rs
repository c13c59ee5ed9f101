use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::CheckoutError;

/// Unix timestamp in milliseconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_millis() as u64))
    }

    pub fn millis_since(self, earlier: UnixTimeMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    /// ISO-8601 UTC with millisecond precision, e.g. `2025-12-18T12:00:00.000Z`.
    pub fn to_rfc3339(self) -> String {
        let millis = i64::try_from(self.0).unwrap_or(i64::MAX);
        match Utc.timestamp_millis_opt(millis).single() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => String::new(),
        }
    }

    /// Lenient ISO-8601 parse. Accepts `Z` or numeric offsets; a timestamp
    /// without zone is read as UTC. Empty or unparseable input yields `None`.
    pub fn parse_rfc3339(value: &str) -> Option<Self> {
        let v = value.trim();
        if v.is_empty() {
            return None;
        }
        let dt = match DateTime::parse_from_rfc3339(v) {
            Ok(dt) => dt.with_timezone(&Utc),
            Err(_) => {
                let naive = NaiveDateTime::parse_from_str(v, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
                Utc.from_utc_datetime(&naive)
            }
        };
        u64::try_from(dt.timestamp_millis()).ok().map(Self)
    }
}

/// Stable identity of one queued item. Never reused after deletion.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    partition_key: String,
    row_key: String,
}

impl RecordKey {
    const MAX_LENGTH: usize = 255;

    pub fn new(
        partition_key: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Result<Self, CheckoutError> {
        let partition_key = partition_key.into().trim().to_string();
        let row_key = row_key.into().trim().to_string();
        Self::validate_part("partition key", &partition_key)?;
        Self::validate_part("row key", &row_key)?;
        Ok(Self {
            partition_key,
            row_key,
        })
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn row_key(&self) -> &str {
        &self.row_key
    }

    fn validate_part(what: &str, value: &str) -> Result<(), CheckoutError> {
        if value.is_empty() {
            return Err(CheckoutError::Validation(format!("{what} cannot be empty")));
        }
        if value.len() > Self::MAX_LENGTH {
            return Err(CheckoutError::Validation(format!(
                "{what} exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        // Same characters the document APIs refuse in ids
        if value
            .chars()
            .any(|c| c.is_control() || matches!(c, '/' | '\\' | '?' | '#'))
        {
            return Err(CheckoutError::Validation(format!(
                "{what} contains invalid characters"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.partition_key, self.row_key)
    }
}

/// Reviewer identity as recorded in `leaseOwner`. Never blank.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Owner(String);

impl Owner {
    const MAX_LENGTH: usize = 128;

    pub fn new(owner: impl Into<String>) -> Result<Self, CheckoutError> {
        let owner = owner.into().trim().to_string();
        if owner.is_empty() {
            return Err(CheckoutError::InvalidOwner("owner cannot be blank".into()));
        }
        if owner.len() > Self::MAX_LENGTH {
            return Err(CheckoutError::InvalidOwner(format!(
                "owner exceeds {} characters",
                Self::MAX_LENGTH
            )));
        }
        if owner.chars().any(char::is_control) {
            return Err(CheckoutError::InvalidOwner(
                "owner contains control characters".into(),
            ));
        }
        Ok(Self(owner))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque random value proving which acquisition a holder belongs to.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Wraps a token echoed back by a client. Blank input is not a token.
    pub fn from_client(token: impl Into<String>) -> Option<Self> {
        let token = token.into().trim().to_string();
        (!token.is_empty()).then_some(Self(token))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Tokens are bearer secrets for the lease; keep them out of logs.
impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(6).collect();
        write!(f, "LeaseToken({prefix}…)")
    }
}

/// Lease columns of a queued record. All empty when unleased.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseFields {
    pub owner: String,
    pub token: String,
    pub acquired_at: Option<UnixTimeMs>,
    pub expires_at: Option<UnixTimeMs>,
}

impl LeaseFields {
    /// Free iff nobody owns it or the lease has run out. A missing or
    /// unreadable expiry with an owner set counts as run out.
    pub fn is_free(&self, now: UnixTimeMs) -> bool {
        if self.owner.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(until) => until <= now,
            None => true,
        }
    }

    pub fn is_leased(&self) -> bool {
        !self.owner.is_empty()
    }

    pub fn is_held_by(&self, owner: &Owner, token: &LeaseToken) -> bool {
        !self.owner.is_empty() && self.owner == owner.as_str() && self.token == token.as_str()
    }

    /// Held by the pair and strictly unexpired.
    pub fn is_valid_for(&self, owner: &Owner, token: &LeaseToken, now: UnixTimeMs) -> bool {
        self.is_held_by(owner, token) && self.expires_at.is_some_and(|until| until > now)
    }

    pub fn grant(owner: &Owner, token: &LeaseToken, now: UnixTimeMs, ttl: Duration) -> Self {
        Self {
            owner: owner.as_str().to_string(),
            token: token.as_str().to_string(),
            acquired_at: Some(now),
            expires_at: Some(now.saturating_add(ttl)),
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Pointer to a payload kept outside the record because it was too large.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub uri: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoredPayload {
    /// UTF-8 JSON object, kept verbatim as written by ingestion.
    Inline(String),
    Blob(BlobRef),
}

/// One pending item. Its existence in the store is its pending status.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedRecord {
    pub key: RecordKey,
    pub record_id: String,
    /// `createdAt` exactly as the loader wrote it.
    pub created_at: String,
    pub payload: StoredPayload,
    pub lease: LeaseFields,
    /// Document columns this crate does not interpret. Written back untouched.
    pub extra: Map<String, Value>,
}

impl QueuedRecord {
    pub fn new(key: RecordKey, payload: StoredPayload) -> Self {
        Self {
            key,
            record_id: String::new(),
            created_at: String::new(),
            payload,
            lease: LeaseFields::default(),
            extra: Map::new(),
        }
    }

    pub fn with_record_id(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = record_id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: UnixTimeMs) -> Self {
        self.created_at = created_at.to_rfc3339();
        self
    }

    pub fn created_at_ms(&self) -> Option<UnixTimeMs> {
        UnixTimeMs::parse_rfc3339(&self.created_at)
    }
}

/// Opaque store version tag (an ETag). Only ever compared, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version(String);

impl Version {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: u64) -> UnixTimeMs {
        UnixTimeMs(ms)
    }

    #[test]
    fn rfc3339_formats_utc_with_millis() {
        // 2025-12-18T12:00:00Z
        let ts = t(1_766_059_200_000);
        assert_eq!(ts.to_rfc3339(), "2025-12-18T12:00:00.000Z");
        assert_eq!(UnixTimeMs::parse_rfc3339(&ts.to_rfc3339()), Some(ts));
    }

    #[test]
    fn rfc3339_parse_is_lenient() {
        let expected = Some(t(1_766_059_200_000));
        assert_eq!(UnixTimeMs::parse_rfc3339("2025-12-18T12:00:00+00:00"), expected);
        assert_eq!(UnixTimeMs::parse_rfc3339("2025-12-18T13:00:00+01:00"), expected);
        assert_eq!(UnixTimeMs::parse_rfc3339(" 2025-12-18T12:00:00 "), expected);
        assert_eq!(UnixTimeMs::parse_rfc3339(""), None);
        assert_eq!(UnixTimeMs::parse_rfc3339("yesterday"), None);
    }

    #[test]
    fn record_key_validation() {
        assert!(RecordKey::new("active", "rk1").is_ok());
        assert!(RecordKey::new("", "rk1").is_err());
        assert!(RecordKey::new("active", "   ").is_err());
        assert!(RecordKey::new("active", "a/b").is_err());
        assert!(RecordKey::new("active", "x".repeat(256)).is_err());
        assert_eq!(RecordKey::new(" active ", "rk1").unwrap().partition_key(), "active");
    }

    #[test]
    fn owner_rejects_blank() {
        assert!(Owner::new("alice").is_ok());
        assert!(Owner::new("").is_err());
        assert!(Owner::new("  \t ").is_err());
        assert_eq!(Owner::new("  bob ").unwrap().as_str(), "bob");
    }

    #[test]
    fn lease_token_debug_is_redacted() {
        let token = LeaseToken::generate();
        let debug = format!("{token:?}");
        assert!(!debug.contains(token.as_str()));
        assert_eq!(token.as_str().len(), 32);
        assert!(LeaseToken::from_client("  ").is_none());
    }

    #[test]
    fn free_ness_follows_owner_and_expiry() {
        let alice = Owner::new("alice").unwrap();
        let token = LeaseToken::generate();
        let now = t(1_000_000);

        assert!(LeaseFields::default().is_free(now));

        let lease = LeaseFields::grant(&alice, &token, now, Duration::from_secs(600));
        assert!(!lease.is_free(now));
        assert!(!lease.is_free(t(now.0 + 599_999)));
        assert!(lease.is_free(t(now.0 + 600_000)));

        let dangling = LeaseFields {
            owner: "alice".into(),
            ..LeaseFields::default()
        };
        assert!(dangling.is_free(now));
    }

    #[test]
    fn validity_requires_pair_and_strict_future() {
        let alice = Owner::new("alice").unwrap();
        let token = LeaseToken::generate();
        let other = LeaseToken::generate();
        let now = t(5_000);
        let lease = LeaseFields::grant(&alice, &token, now, Duration::from_secs(1));

        assert!(lease.is_valid_for(&alice, &token, now));
        assert!(!lease.is_valid_for(&alice, &other, now));
        assert!(!lease.is_valid_for(&Owner::new("bob").unwrap(), &token, now));
        assert!(!lease.is_valid_for(&alice, &token, t(6_000)));
    }
}
