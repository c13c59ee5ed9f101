use std::collections::{BTreeMap, HashMap};

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::CheckoutError;
use crate::model::{BlobRef, QueuedRecord, StoredPayload};
use crate::store::StoreError;

/// Field name to display value, as shown to a reviewer.
pub type Payload = BTreeMap<String, String>;

/// Reads oversized payloads stored outside the record.
#[async_trait::async_trait]
pub trait BlobReader: Send + Sync {
    async fn read_text(&self, blob: &BlobRef) -> Result<String, StoreError>;
}

/// Reader for deployments without blob storage. Every lookup fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBlobs;

#[async_trait::async_trait]
impl BlobReader for NoBlobs {
    async fn read_text(&self, blob: &BlobRef) -> Result<String, StoreError> {
        Err(StoreError::Unavailable(format!(
            "no blob storage configured for {}",
            blob.uri
        )))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryBlobs {
    blobs: RwLock<HashMap<String, String>>,
}

impl InMemoryBlobs {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, uri: impl Into<String>, text: impl Into<String>) {
        self.blobs.write().await.insert(uri.into(), text.into());
    }
}

#[async_trait::async_trait]
impl BlobReader for InMemoryBlobs {
    async fn read_text(&self, blob: &BlobRef) -> Result<String, StoreError> {
        self.blobs
            .read()
            .await
            .get(&blob.uri)
            .cloned()
            .ok_or_else(|| StoreError::Unavailable(format!("blob {} not found", blob.uri)))
    }
}

/// Lenient decode of a stored JSON object.
///
/// Anything that is not a JSON object decodes to an empty map. `null` values
/// become empty strings; other non-string values keep their JSON text.
pub fn decode_payload(text: &str) -> Payload {
    let text = text.trim();
    if text.is_empty() {
        return Payload::new();
    }
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(fields)) => fields
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    Value::Null => String::new(),
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, v)
            })
            .collect(),
        Ok(_) => Payload::new(),
        Err(e) => {
            warn!("Payload is not valid JSON: {}", e);
            Payload::new()
        }
    }
}

/// Resolve a record's payload, following its blob pointer if it has one.
pub async fn load_payload<B>(record: &QueuedRecord, blobs: &B) -> Result<Payload, CheckoutError>
where
    B: BlobReader + ?Sized,
{
    match &record.payload {
        StoredPayload::Inline(json) => Ok(decode_payload(json)),
        StoredPayload::Blob(blob) => {
            let text = blobs
                .read_text(blob)
                .await
                .map_err(|e| CheckoutError::Payload {
                    key: record.key.clone(),
                    reason: e.to_string(),
                })?;
            Ok(decode_payload(&text))
        }
    }
}
