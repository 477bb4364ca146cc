//! Canonical content hashing for change detection.
//!
//! Mapped payloads are hashed over a canonical rendering (object keys
//! sorted recursively) so that two semantically identical payloads always
//! produce the same digest, regardless of field order at the producer.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of the canonical form of a payload map.
pub fn sync_hash(values: &Map<String, Value>) -> String {
    let mut canonical = String::new();
    write_canonical(&Value::Object(values.clone()), &mut canonical);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 hex digest of an arbitrary string, used for lock key material.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
