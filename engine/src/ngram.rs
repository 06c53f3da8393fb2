//! Binary-fuse8 substring index over rune k-grams of JSON token values.
//!
//! For every record, every JSON leaf (string, number, bool, null) and
//! every object key is lower-cased and sliced into contiguous k-rune
//! windows for `k` in `1..=max_ngram`; every window's XXH64 hash goes
//! into the filter. `Contains(query)` clamps `k = min(rune_count(query),
//! max_ngram)` and requires every k-window hash of the query to be a
//! filter member — false positives are acceptable, false negatives are
//! not, because every longer indexed window implies its shorter
//! sub-windows are indexed too (see build_hashes).

use crate::error::{Error, Result};
use rayon::prelude::*;
use std::collections::HashSet;
use xorf::{BinaryFuse8, Filter};

pub const DEFAULT_MAX_NGRAM: usize = 8;

/// Recursively collects every JSON leaf and object key as a lower-cased
/// string token. A string leaf that itself parses as JSON (a
/// stringified-JSON value embedded in a field) is descended into as
/// well, so its own leaves and keys are indexed too.
pub fn extract_tokens(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Null => out.push("null".to_string()),
        serde_json::Value::Bool(b) => out.push(b.to_string()),
        serde_json::Value::Number(n) => out.push(n.to_string().to_lowercase()),
        serde_json::Value::String(s) => {
            out.push(s.to_lowercase());
            if let Ok(nested) = serde_json::from_str::<serde_json::Value>(s) {
                extract_tokens(&nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                extract_tokens(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                out.push(k.to_lowercase());
                extract_tokens(v, out);
            }
        }
    }
}

/// Every contiguous k-rune window (k in `1..=max_ngram`) of `token`,
/// hashed with XXH64. Indexing every shorter window alongside the full
/// token is what gives `Contains` its zero-false-negative guarantee for
/// queries shorter than `max_ngram`.
fn hash_windows(token: &str, max_ngram: usize, out: &mut HashSet<u64>) {
    let runes: Vec<char> = token.chars().collect();
    if runes.is_empty() {
        return;
    }
    for k in 1..=max_ngram.min(runes.len()) {
        for window in runes.windows(k) {
            let s: String = window.iter().collect();
            out.insert(xxhash_rust::xxh64::xxh64(s.as_bytes(), 0));
        }
    }
}

/// Fan out token hashing across a rayon thread pool (one local set per
/// work item), then fold into a single combined hash set.
fn build_hash_set(tokens: &[String], max_ngram: usize) -> HashSet<u64> {
    tokens
        .par_iter()
        .fold(HashSet::new, |mut acc, token| {
            hash_windows(token, max_ngram, &mut acc);
            acc
        })
        .reduce(HashSet::new, |mut a, b| {
            a.extend(b);
            a
        })
}

/// Builds a serialized binary-fuse8 filter over every token's k-gram
/// hashes. Returns `CorruptIndex` if the key set is too small for the
/// filter construction to succeed (practically: fewer than a handful of
/// distinct hashes) — callers should treat this the same as a missing
/// index sidecar ("no hint"), not a hard failure.
pub fn build_index(tokens: &[String], max_ngram: usize) -> Result<Vec<u8>> {
    let hashes: Vec<u64> = build_hash_set(tokens, max_ngram).into_iter().collect();
    let filter = BinaryFuse8::try_from(hashes.as_slice())
        .map_err(|e| Error::CorruptIndex(format!("binary-fuse8 construction failed: {e}")))?;
    Ok(serialize(&filter))
}

/// `(seed: u64, segment_length: u32, segment_length_mask: u32,
/// segment_count_length: u32, fingerprints: bytes)`, all big-endian. The
/// filter's scalar fields are public specifically to support this kind
/// of custom wire serialization.
fn serialize(filter: &BinaryFuse8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 4 + 4 + 4 + filter.fingerprints.len());
    buf.extend_from_slice(&filter.seed.to_be_bytes());
    buf.extend_from_slice(&filter.segment_length.to_be_bytes());
    buf.extend_from_slice(&filter.segment_length_mask.to_be_bytes());
    buf.extend_from_slice(&filter.segment_count_length.to_be_bytes());
    buf.extend_from_slice(&filter.fingerprints);
    buf
}

fn deserialize(bytes: &[u8]) -> Result<BinaryFuse8> {
    if bytes.len() < 20 {
        return Err(Error::CorruptIndex(format!(
            "index payload too short: {} bytes",
            bytes.len()
        )));
    }
    let seed = u64::from_be_bytes(bytes[0..8].try_into().unwrap());
    let segment_length = u32::from_be_bytes(bytes[8..12].try_into().unwrap());
    let segment_length_mask = u32::from_be_bytes(bytes[12..16].try_into().unwrap());
    let segment_count_length = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
    let fingerprints = bytes[20..].to_vec().into_boxed_slice();
    Ok(BinaryFuse8 {
        seed,
        segment_length,
        segment_length_mask,
        segment_count_length,
        fingerprints,
    })
}

/// Loads a serialized index and tests `query` for (possibly
/// false-positive) membership.
pub fn contains(index_bytes: &[u8], query: &str, max_ngram: usize) -> Result<bool> {
    let filter = deserialize(index_bytes)?;
    let query = query.to_lowercase();
    let runes: Vec<char> = query.chars().collect();
    if runes.is_empty() {
        return Ok(true);
    }
    let k = runes.len().min(max_ngram);
    for window in runes.windows(k) {
        let s: String = window.iter().collect();
        let h = xxhash_rust::xxh64::xxh64(s.as_bytes(), 0);
        if !filter.contains(&h) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens_for(strings: &[&str]) -> Vec<String> {
        strings.iter().map(|s| s.to_lowercase()).collect()
    }

    #[test]
    fn index_roundtrip_membership() {
        let tokens = tokens_for(&["alpha", "beta", "gamma delta", "epsilon-zeta-eta-theta"]);
        let bytes = build_index(&tokens, DEFAULT_MAX_NGRAM).unwrap();
        assert!(contains(&bytes, "alpha", DEFAULT_MAX_NGRAM).unwrap());
        assert!(contains(&bytes, "beta", DEFAULT_MAX_NGRAM).unwrap());
        assert!(contains(&bytes, "gamma", DEFAULT_MAX_NGRAM).unwrap());
    }

    #[test]
    fn short_query_exact_membership_no_false_negative() {
        let tokens = tokens_for(&["needle"]);
        let bytes = build_index(&tokens, DEFAULT_MAX_NGRAM).unwrap();
        for q in ["n", "ne", "nee", "need", "needl", "needle"] {
            assert!(contains(&bytes, q, DEFAULT_MAX_NGRAM).unwrap(), "missed {q}");
        }
    }

    #[test]
    fn case_insensitive() {
        let tokens = tokens_for(&["Alpha"]);
        let bytes = build_index(&tokens, DEFAULT_MAX_NGRAM).unwrap();
        assert!(contains(&bytes, "ALPHA", DEFAULT_MAX_NGRAM).unwrap());
        assert!(contains(&bytes, "alpha", DEFAULT_MAX_NGRAM).unwrap());
    }

    #[test]
    fn extract_tokens_descends_nested_json() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"msg":"Hello","meta":{"count":3,"ok":true,"tag":null}}"#)
                .unwrap();
        let mut out = Vec::new();
        extract_tokens(&v, &mut out);
        assert!(out.contains(&"hello".to_string()));
        assert!(out.contains(&"msg".to_string()));
        assert!(out.contains(&"count".to_string()));
        assert!(out.contains(&"3".to_string()));
        assert!(out.contains(&"true".to_string()));
        assert!(out.contains(&"null".to_string()));
    }

    #[test]
    fn extract_tokens_descends_stringified_json_leaves() {
        let v: serde_json::Value =
            serde_json::from_str(r#"{"payload":"{\"inner\":\"needle\"}"}"#).unwrap();
        let mut out = Vec::new();
        extract_tokens(&v, &mut out);
        assert!(out.contains(&"inner".to_string()));
        assert!(out.contains(&"needle".to_string()));
    }
}
