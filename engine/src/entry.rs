//! The record and read-option types threaded between the writer,
//! compactor, reader and predicate compiler.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub labels: BTreeMap<String, String>,
    pub time_ns: u64,
    pub data: Vec<u8>,
}

impl LogEntry {
    pub fn time_ms(&self) -> u64 {
        crate::chunk::nanos_to_ms(self.time_ns as i128)
    }
}

/// A decoded record whose `data` conformed to (or was sanitized to) the
/// "empty, or starts with `{` and ends with `}`" invariant.
pub fn sanitize_data(data: Vec<u8>) -> Vec<u8> {
    if data.is_empty() {
        return data;
    }
    let starts = data.first() == Some(&b'{');
    let ends = data.last() == Some(&b'}');
    if starts && ends { data } else { Vec::new() }
}

/// Per-sub-chunk metadata available without decoding the body, used by
/// `ReadOptions::summary_func` to prune before opening data at all.
#[derive(Clone, Debug)]
pub struct LogSummary {
    pub labels: BTreeMap<String, String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub count: u64,
}

pub type FilterFn = dyn Fn(&LogEntry) -> bool + Send + Sync;
pub type SummaryFn = dyn Fn(&LogSummary) -> bool + Send + Sync;

/// Serializes delivery of matched entries to a caller-supplied `FnMut`.
/// The parallel scan calls `§4.6` per chunk from whichever worker thread
/// picked it up, so several workers may want to deliver at once; a
/// single mutex around the (almost always cheap) callback gives the
/// required ordering-at-the-chunk-level without forcing the whole read
/// onto one thread.
pub struct ResultSink(Mutex<Box<dyn FnMut(LogEntry) + Send>>);

impl ResultSink {
    pub fn new(f: impl FnMut(LogEntry) + Send + 'static) -> Self {
        ResultSink(Mutex::new(Box::new(f)))
    }

    pub fn deliver(&self, entry: LogEntry) {
        let mut guard = self.0.lock().expect("result sink mutex poisoned");
        (guard)(entry);
    }
}

/// Options threaded through the parallel scan and chunk reader. `labels`
/// is an equality subset checked against header labels; `contains` is a
/// pruning hint only (never a substitute for `filter_func`). Shared
/// read-only across scan workers via `Arc<ReadOptions>`.
pub struct ReadOptions {
    pub labels: BTreeMap<String, String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub contains: Vec<String>,
    /// Must match the `max_ngram` the index sidecars being queried were
    /// built with (`EngineConfig::max_ngram`).
    pub max_ngram: usize,
    pub summary_func: Option<Arc<SummaryFn>>,
    pub filter_func: Option<Arc<FilterFn>>,
    pub result: ResultSink,
}

impl ReadOptions {
    pub fn new(result_func: impl FnMut(LogEntry) + Send + 'static) -> Self {
        ReadOptions {
            labels: BTreeMap::new(),
            start_ms: 0,
            end_ms: 0,
            contains: Vec::new(),
            max_ngram: crate::ngram::DEFAULT_MAX_NGRAM,
            summary_func: None,
            filter_func: None,
            result: ResultSink::new(result_func),
        }
    }

    /// `true` when `entry_start..entry_end` intersects `[start_ms,
    /// end_ms]` (zero bounds are unbounded).
    pub fn time_intersects(&self, entry_start: u64, entry_end: u64) -> bool {
        let lo_ok = self.start_ms == 0 || entry_end >= self.start_ms;
        let hi_ok = self.end_ms == 0 || entry_start <= self.end_ms;
        lo_ok && hi_ok
    }

    pub fn labels_match(&self, candidate: &BTreeMap<String, String>) -> bool {
        self.labels
            .iter()
            .all(|(k, v)| candidate.get(k).is_some_and(|cv| cv == v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_non_json_object_payloads() {
        assert_eq!(sanitize_data(b"not json".to_vec()), Vec::<u8>::new());
        assert_eq!(sanitize_data(b"{\"x\":1}".to_vec()), b"{\"x\":1}".to_vec());
        assert_eq!(sanitize_data(Vec::new()), Vec::<u8>::new());
        assert_eq!(sanitize_data(b"{unterminated".to_vec()), Vec::<u8>::new());
    }

    #[test]
    fn time_intersects_handles_unbounded_zero() {
        let opts = ReadOptions::new(|_| {});
        assert!(opts.time_intersects(10, 20));
        let mut bounded = ReadOptions::new(|_| {});
        bounded.start_ms = 15;
        bounded.end_ms = 25;
        assert!(bounded.time_intersects(10, 20));
        assert!(!bounded.time_intersects(1, 5));
    }

    #[test]
    fn labels_match_is_equality_subset() {
        let mut opts = ReadOptions::new(|_| {});
        opts.labels.insert("app".to_string(), "a".to_string());
        let mut candidate = BTreeMap::new();
        candidate.insert("app".to_string(), "a".to_string());
        candidate.insert("role".to_string(), "r1".to_string());
        assert!(opts.labels_match(&candidate));
        candidate.insert("app".to_string(), "b".to_string());
        assert!(!opts.labels_match(&candidate));
    }
}
