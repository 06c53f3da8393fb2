//! Process-local, in-memory cache of recently observed label keys and
//! values, answering `labels`/`label values` lookups without a storage
//! scan. Not an index: it never affects query correctness, and it is
//! reset on process restart (no on-disk representation).
//!
//! Eviction is FIFO-by-write-pointer, not LRU-by-access: once a key's
//! ring is full, the next unseen value for that key overwrites the
//! oldest slot, and seeing a value already present does not move it.

use std::collections::HashMap;
use std::sync::Mutex;

struct Ring {
    limit: usize,
    values: Vec<String>,
    next: usize,
}

impl Ring {
    fn new(limit: usize) -> Self {
        Ring {
            limit,
            values: Vec::new(),
            next: 0,
        }
    }

    fn add(&mut self, value: &str) {
        if self.values.iter().any(|v| v == value) {
            return;
        }
        if self.values.len() < self.limit {
            self.values.push(value.to_string());
        } else {
            self.values[self.next] = value.to_string();
            self.next = (self.next + 1) % self.limit;
        }
    }
}

pub struct LabelCache {
    limit: usize,
    keys: Mutex<HashMap<String, Ring>>,
}

impl LabelCache {
    pub fn new(limit: usize) -> Self {
        LabelCache {
            limit,
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn add(&self, key: &str, value: &str) {
        let mut keys = self.keys.lock().expect("label cache mutex poisoned");
        keys.entry(key.to_string())
            .or_insert_with(|| Ring::new(self.limit))
            .add(value);
    }

    pub fn add_labels<'a>(&self, labels: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (k, v) in labels {
            self.add(k, v);
        }
    }

    pub fn keys(&self) -> Vec<String> {
        let keys = self.keys.lock().expect("label cache mutex poisoned");
        let mut out: Vec<String> = keys.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn values(&self, key: &str) -> Vec<String> {
        let keys = self.keys.lock().expect("label cache mutex poisoned");
        let mut out = keys.get(key).map(|r| r.values.clone()).unwrap_or_default();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_keys_and_values() {
        let cache = LabelCache::new(4);
        cache.add("app", "a");
        cache.add("app", "b");
        cache.add("role", "r1");
        assert_eq!(cache.keys(), vec!["app".to_string(), "role".to_string()]);
        assert_eq!(cache.values("app"), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn repeated_value_does_not_consume_a_slot() {
        let cache = LabelCache::new(2);
        cache.add("app", "a");
        cache.add("app", "a");
        cache.add("app", "a");
        assert_eq!(cache.values("app"), vec!["a".to_string()]);
    }

    #[test]
    fn fifo_eviction_on_overflow() {
        let cache = LabelCache::new(2);
        cache.add("app", "a");
        cache.add("app", "b");
        cache.add("app", "c"); // ring full at [a, b]; overwrites oldest slot (a)
        let mut values = cache.values("app");
        values.sort();
        assert_eq!(values, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn unknown_key_returns_empty() {
        let cache = LabelCache::new(4);
        assert!(cache.values("nope").is_empty());
    }
}
