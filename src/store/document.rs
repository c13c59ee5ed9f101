use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::model::{BlobRef, LeaseFields, QueuedRecord, RecordKey, StoredPayload, UnixTimeMs};

use super::StoreError;

/// Wire shape of one queued record. Timestamps are ISO-8601 UTC strings and
/// every lease column is the empty string while unleased. Columns written by
/// the loader that are not modelled here land in `extra` and are written back
/// as they were.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDocument {
    pub id: String,
    pub partition_key: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub record_id: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub created_at: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub payload_json: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_blob: Option<String>,
    #[serde(default, deserialize_with = "string_or_null")]
    pub lease_owner: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub lease_token: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub lease_expires_at: String,
    #[serde(default, deserialize_with = "string_or_null")]
    pub lease_acquired_at: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn string_or_null<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn format_ts(ts: Option<UnixTimeMs>) -> String {
    ts.map(UnixTimeMs::to_rfc3339).unwrap_or_default()
}

impl From<&QueuedRecord> for RecordDocument {
    fn from(record: &QueuedRecord) -> Self {
        let (payload_json, payload_blob) = match &record.payload {
            StoredPayload::Inline(json) => (json.clone(), None),
            StoredPayload::Blob(blob) => (String::new(), Some(blob.uri.clone())),
        };
        Self {
            id: record.key.row_key().to_string(),
            partition_key: record.key.partition_key().to_string(),
            record_id: record.record_id.clone(),
            created_at: record.created_at.clone(),
            payload_json,
            payload_blob,
            lease_owner: record.lease.owner.clone(),
            lease_token: record.lease.token.clone(),
            lease_expires_at: format_ts(record.lease.expires_at),
            lease_acquired_at: format_ts(record.lease.acquired_at),
            extra: record.extra.clone(),
        }
    }
}

impl TryFrom<RecordDocument> for QueuedRecord {
    type Error = StoreError;

    fn try_from(doc: RecordDocument) -> Result<Self, Self::Error> {
        let key = RecordKey::new(&doc.partition_key, &doc.id).map_err(|e| StoreError::Corrupted {
            key: format!("{}/{}", doc.partition_key, doc.id),
            reason: e.to_string(),
        })?;

        let payload = match doc.payload_blob.filter(|uri| !uri.trim().is_empty()) {
            Some(uri) => StoredPayload::Blob(BlobRef { uri }),
            None => StoredPayload::Inline(doc.payload_json),
        };

        Ok(Self {
            key,
            record_id: doc.record_id,
            created_at: doc.created_at,
            payload,
            lease: LeaseFields {
                owner: doc.lease_owner.trim().to_string(),
                token: doc.lease_token.trim().to_string(),
                acquired_at: UnixTimeMs::parse_rfc3339(&doc.lease_acquired_at),
                expires_at: UnixTimeMs::parse_rfc3339(&doc.lease_expires_at),
            },
            extra: doc.extra,
        })
    }
}

pub(crate) fn encode(record: &QueuedRecord) -> Result<String, StoreError> {
    serde_json::to_string(&RecordDocument::from(record))
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode(key_hint: &str, body: &str) -> Result<QueuedRecord, StoreError> {
    let doc: RecordDocument = serde_json::from_str(body).map_err(|e| StoreError::Corrupted {
        key: key_hint.to_string(),
        reason: e.to_string(),
    })?;
    QueuedRecord::try_from(doc)
}
