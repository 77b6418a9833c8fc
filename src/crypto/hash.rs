//! Hash utilities and canonical content hashing

use crate::error::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Compute SHA-256 hash
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 hash and return as hex string
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Rebuild a JSON value so that every object has its keys in sorted order.
///
/// `serde_json::Map` keeps insertion order when the `preserve_order` feature is
/// enabled anywhere in the dependency graph, so ordering is enforced here
/// instead of relying on the map type.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::with_capacity(sorted.len());
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        },
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Canonical JSON text of a record: sorted field names, no whitespace.
pub fn canonical_json<T: Serialize + ?Sized>(record: &T) -> Result<String> {
    let value = canonicalize(serde_json::to_value(record)?);
    Ok(serde_json::to_string(&value)?)
}

/// Content hash of a record: hex SHA-256 over the UTF-8 canonical JSON.
///
/// Transactions and blocks both hash through this function.
pub fn content_hash<T: Serialize + ?Sized>(record: &T) -> Result<String> {
    Ok(sha256_hex(canonical_json(record)?.as_bytes()))
}
