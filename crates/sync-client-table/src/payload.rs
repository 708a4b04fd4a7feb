//! Plaintext shape carried inside an encrypted blob, in both directions:
//! the primary key, the row's last-modified timestamp, and either its
//! column data or `None` for a tombstone. The server never sees any of
//! this — it only stores and orders opaque ciphertext by `blobId`/`dataId`
//! — so the key and timestamp that `should_store`/`store_data` need travel
//! inside the payload rather than in the wire message's clear fields.
//!
//! `rusqlite::types::Value`'s `Blob` variant has no native JSON
//! representation, so it round-trips through base64 under a `__blob` tag
//! instead of losing its type.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use sync_client_watcher::Value;

#[derive(Debug, Clone)]
pub struct RowEnvelope {
    pub key: Value,
    pub modified: DateTime<Utc>,
    pub data: Option<HashMap<String, Value>>,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct WireEnvelope {
    key: serde_json::Value,
    modified: String,
    data: Option<HashMap<String, serde_json::Value>>,
}

pub fn encode(envelope: &RowEnvelope) -> serde_json::Result<Vec<u8>> {
    let wire = WireEnvelope {
        key: to_json(&envelope.key),
        modified: envelope.modified.to_rfc3339(),
        data: envelope.data.as_ref().map(|columns| columns.iter().map(|(k, v)| (k.clone(), to_json(v))).collect()),
    };
    serde_json::to_vec(&wire)
}

#[derive(thiserror::Error, Debug)]
pub enum PayloadError {
    #[error("malformed payload json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed payload timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

pub fn decode(bytes: &[u8]) -> Result<RowEnvelope, PayloadError> {
    let wire: WireEnvelope = serde_json::from_slice(bytes)?;
    let modified = DateTime::parse_from_rfc3339(&wire.modified)?.with_timezone(&Utc);
    Ok(RowEnvelope {
        key: from_json(&wire.key),
        modified,
        data: wire.data.map(|columns| columns.into_iter().map(|(k, v)| (k, from_json(&v))).collect()),
    })
}

fn to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(n) => serde_json::Value::from(*n),
        Value::Real(f) => serde_json::Value::from(*f),
        Value::Text(s) => serde_json::Value::from(s.clone()),
        Value::Blob(bytes) => {
            let mut tagged = serde_json::Map::new();
            tagged.insert("__blob".to_string(), serde_json::Value::from(BASE64.encode(bytes)));
            serde_json::Value::Object(tagged)
        }
    }
}

fn from_json(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(if *b { 1 } else { 0 }),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Real(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Object(map) => match map.get("__blob").and_then(|v| v.as_str()) {
            Some(encoded) => Value::Blob(BASE64.decode(encoded).unwrap_or_default()),
            None => Value::Null,
        },
        serde_json::Value::Array(_) => Value::Null,
    }
}

/// Stable opaque identifier for the `Change`/`DeviceChange` wire messages'
/// `dataId` field: the server keys its blob store by this, so repeated
/// edits to the same row must hash to the same id instead of minting a
/// fresh one per upload.
pub fn data_id(table: &str, key: &Value) -> Vec<u8> {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(table.as_bytes());
    hasher.update([0u8]);
    match key {
        Value::Null => hasher.update([0u8]),
        Value::Integer(n) => hasher.update(n.to_le_bytes()),
        Value::Real(f) => hasher.update(f.to_le_bytes()),
        Value::Text(s) => hasher.update(s.as_bytes()),
        Value::Blob(b) => hasher.update(b),
    }
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_with_blob_round_trips() {
        let mut row = HashMap::new();
        row.insert("id".to_string(), Value::Integer(7));
        row.insert("name".to_string(), Value::Text("Ada".to_string()));
        row.insert("avatar".to_string(), Value::Blob(vec![1, 2, 3, 255]));
        let envelope = RowEnvelope { key: Value::Integer(7), modified: Utc::now(), data: Some(row.clone()) };

        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.key, Value::Integer(7));
        assert_eq!(decoded.data, Some(row));
    }

    #[test]
    fn tombstone_round_trips_with_no_data() {
        let envelope = RowEnvelope { key: Value::Integer(3), modified: Utc::now(), data: None };
        let encoded = encode(&envelope).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded.key, Value::Integer(3));
        assert_eq!(decoded.data, None);
    }

    #[test]
    fn data_id_is_stable_for_the_same_key() {
        let a = data_id("contacts", &Value::Integer(1));
        let b = data_id("contacts", &Value::Integer(1));
        let c = data_id("contacts", &Value::Integer(2));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
