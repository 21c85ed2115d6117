//! Canonical content fingerprinting for stored records
//!
//! Produces a stable SHA-256 over a record's JSON field tree. Object keys are
//! hashed in sorted order, so two records that differ only in field order
//! fingerprint identically; array element order is significant. The volatile
//! server-maintained meta fields (`meta.versionId`, `meta.lastUpdated`) are
//! excluded, so a record compares equal to its own stored form across
//! generation bumps.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Meta fields rewritten by the server on every write; never part of the hash.
const VOLATILE_META_FIELDS: [&str; 2] = ["versionId", "lastUpdated"];

/// Compute the canonical content fingerprint of a record body.
pub fn content_fingerprint(record: &Value) -> String {
    let mut hasher = Sha256::new();
    hash_value(&mut hasher, record, true);
    hex::encode(hasher.finalize())
}

fn hash_value(hasher: &mut Sha256, value: &Value, at_root: bool) {
    match value {
        Value::Null => hasher.update(b"n"),
        Value::Bool(b) => {
            hasher.update(b"b");
            hasher.update(if *b { b"1" } else { b"0" });
        },
        Value::Number(n) => {
            hasher.update(b"#");
            hasher.update(n.to_string().as_bytes());
        },
        Value::String(s) => {
            hasher.update(b"s");
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        },
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                hash_value(hasher, item, false);
            }
            hasher.update(b"]");
        },
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();

            hasher.update(b"{");
            for key in keys {
                if at_root && key == "meta" {
                    hash_meta(hasher, &map[key]);
                    continue;
                }
                hasher.update(b"k");
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                hash_value(hasher, &map[key], false);
            }
            hasher.update(b"}");
        },
    }
}

/// Hash the root-level meta object with its volatile fields removed.
fn hash_meta(hasher: &mut Sha256, meta: &Value) {
    let Value::Object(map) = meta else {
        hash_value(hasher, meta, false);
        return;
    };

    let mut keys: Vec<&String> = map
        .keys()
        .filter(|k| !VOLATILE_META_FIELDS.contains(&k.as_str()))
        .collect();
    keys.sort();

    // An all-volatile meta hashes the same as no meta at all.
    if keys.is_empty() {
        return;
    }

    hasher.update(b"k");
    hasher.update((4u64).to_be_bytes());
    hasher.update(b"meta");
    hasher.update(b"{");
    for key in keys {
        hasher.update(b"k");
        hasher.update((key.len() as u64).to_be_bytes());
        hasher.update(key.as_bytes());
        hash_value(hasher, &map[key], false);
    }
    hasher.update(b"}");
}
