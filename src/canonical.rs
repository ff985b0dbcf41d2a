//! Canonical JSON encoding for content-addressed IDs.
//!
//! Keys sorted lexicographically, no insignificant whitespace, numbers in
//! their serde_json minimal form, UTF-8. Re-hashing any persisted snapshot,
//! report, alert or leaf must yield the stored ID byte-for-byte.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Recursively rebuild a value with object keys in sorted order.
fn sort_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                out.insert(key.clone(), sort_value(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_value).collect()),
        other => other.clone(),
    }
}

/// Serialize to the canonical form used for hashing.
pub fn canonical_json(value: &Value) -> String {
    sort_value(value).to_string()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 over the canonical JSON of `value`, hex encoded.
pub fn hash_canonical(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}
