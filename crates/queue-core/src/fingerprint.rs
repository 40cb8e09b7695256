//! Content fingerprinting for job inputs.
//!
//! `serde_json::Map` is backed by a `BTreeMap` unless the crate's
//! `preserve_order` feature is enabled (it isn't, here), so re-serializing
//! any `Value` already yields keys in sorted order and numbers in their
//! shortest round-tripping form. Canonicalization is therefore just
//! "serialize it" - no separate key-sort pass needed.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Deterministic hex digest of `input`'s canonical JSON form. Stable across
/// processes and across key-order-equivalent inputs.
pub fn fingerprint(input: &Value) -> String {
    let canonical = canonicalize(input);
    let bytes = serde_json::to_vec(&canonical).expect("Value serialization cannot fail");
    let digest = Sha256::digest(&bytes);
    hex_encode(&digest)
}

/// Recursively normalizes a `Value` so that semantically-equal documents
/// (same keys, different insertion order; `-0.0` vs `0.0`) canonicalize
/// identically. Array order is significant and preserved.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map.iter() {
                out.insert(k.clone(), canonicalize(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                if f == 0.0 {
                    return Value::from(0.0_f64.copysign(1.0));
                }
            }
            value.clone()
        }
        other => other.clone(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn different_values_differ() {
        let a = json!({"a": 1});
        let b = json!({"a": 2});
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn nested_structures_canonicalize() {
        let a = json!({"outer": {"x": 1, "y": [1, 2, 3]}, "z": true});
        let b = json!({"z": true, "outer": {"y": [1, 2, 3], "x": 1}});
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!([1, 2, 3]);
        let b = json!([3, 2, 1]);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn stable_across_repeated_calls() {
        let v = json!({"text": "summarize this", "model": "claude"});
        assert_eq!(fingerprint(&v), fingerprint(&v));
    }

    #[test]
    fn produces_hex_string() {
        let v = json!({"a": 1});
        let fp = fingerprint(&v);
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
