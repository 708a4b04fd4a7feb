//! Deterministic payload hashing for the `should_store` tie-break.
//!
//! When a downloaded row and the local row were last touched at the exact
//! same millisecond, the original watcher this one generalizes always lets
//! the remote row win, which is non-deterministic under concurrent writers
//! racing on the same clock tick. Hashing the whitelisted column values and
//! requiring the remote payload to hash strictly greater makes the outcome
//! the same on every device that sees both versions, at the cost of one
//! extra local read in the (rare) tie case.

use rusqlite::types::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// A delete hashes to the all-zero digest, the minimum possible value, so a
/// tombstone never wins a tie against a row that still has data.
pub const TOMBSTONE_HASH: [u8; 32] = [0u8; 32];

pub fn hash_row(data: &HashMap<String, Value>) -> [u8; 32] {
    let mut keys: Vec<&String> = data.keys().collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        match &data[key] {
            Value::Null => hasher.update([0u8]),
            Value::Integer(i) => {
                hasher.update([1u8]);
                hasher.update(i.to_be_bytes());
            }
            Value::Real(f) => {
                hasher.update([2u8]);
                hasher.update(f.to_be_bytes());
            }
            Value::Text(s) => {
                hasher.update([3u8]);
                hasher.update(s.as_bytes());
            }
            Value::Blob(b) => {
                hasher.update([4u8]);
                hasher.update(b);
            }
        }
        hasher.update([0xFFu8]);
    }
    hasher.finalize().into()
}

pub fn hash_payload(data: &Option<HashMap<String, Value>>) -> [u8; 32] {
    match data {
        Some(row) => hash_row(row),
        None => TOMBSTONE_HASH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_contents_hash_identically_regardless_of_insertion_order() {
        let mut a = HashMap::new();
        a.insert("name".to_string(), Value::Text("Ada".to_string()));
        a.insert("age".to_string(), Value::Integer(30));

        let mut b = HashMap::new();
        b.insert("age".to_string(), Value::Integer(30));
        b.insert("name".to_string(), Value::Text("Ada".to_string()));

        assert_eq!(hash_row(&a), hash_row(&b));
    }

    #[test]
    fn different_contents_hash_differently() {
        let mut a = HashMap::new();
        a.insert("age".to_string(), Value::Integer(30));
        let mut b = HashMap::new();
        b.insert("age".to_string(), Value::Integer(31));
        assert_ne!(hash_row(&a), hash_row(&b));
    }

    #[test]
    fn tombstone_hashes_to_the_minimum_value() {
        assert_eq!(hash_payload(&None), TOMBSTONE_HASH);
        let mut row = HashMap::new();
        row.insert("x".to_string(), Value::Integer(0));
        assert_ne!(hash_payload(&Some(row)), TOMBSTONE_HASH);
    }
}
