//! Deterministic label-set fingerprint used to name live-chunk directories.
//!
//! Wire algorithm: SHA-256 over the JSON-array encoding of the label map's
//! alternating `[key, value, key, value, ...]` tuple, keys sorted
//! ascending, rendered as lowercase hex. Reordering the input map never
//! changes the fingerprint.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub fn fingerprint(labels: &BTreeMap<String, String>) -> String {
    let mut tuple = Vec::with_capacity(labels.len() * 2);
    for (k, v) in labels {
        tuple.push(k.as_str());
        tuple.push(v.as_str());
    }
    let encoded = serde_json::to_vec(&tuple).expect("string vec always serializes");
    let digest = Sha256::digest(&encoded);
    hex_lower(&digest)
}

fn hex_lower(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}
