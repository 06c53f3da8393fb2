//! `CompactingWriter`: the live writer and the compactor under one
//! mutex (guarding appends and the seal/rename step only, not the full
//! compaction cycle), plus a label-cache feed.

use crate::compactor::{Compactor, CycleSummary};
use crate::config::EngineConfig;
use crate::entry::LogEntry;
use crate::error::Result;
use crate::label_cache::LabelCache;
use crate::live_writer::LiveWriter;
use crate::scan::CancelToken;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct CompactingWriter {
    config: Arc<EngineConfig>,
    live: LiveWriter,
    compactor: Compactor,
    mutex: Mutex<()>,
    label_cache: Arc<LabelCache>,
}

impl CompactingWriter {
    pub fn new(config: Arc<EngineConfig>, label_cache: Arc<LabelCache>) -> Self {
        let live = LiveWriter::new(config.incompact_root());
        let compactor = Compactor::new(Arc::clone(&config));
        CompactingWriter {
            config,
            live,
            compactor,
            mutex: Mutex::new(()),
            label_cache,
        }
    }

    /// Appends `entries`, serialized against any concurrent seal step.
    /// Also feeds every entry's labels into the label cache (§4.10).
    pub fn write(&self, entries: &[LogEntry]) -> Result<()> {
        let _guard = self.mutex.lock().expect("writer mutex poisoned");
        self.live.write(entries)?;
        for e in entries {
            self.label_cache
                .add_labels(e.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        Ok(())
    }

    /// Runs one compaction cycle immediately: seal (under the writer
    /// mutex) then the rest (fuse/sweep/retain/index-rebuild, unlocked).
    /// Used by `background_compact`'s loop body and exposed directly for
    /// the CLI's one-shot `compact` command's non-exclusive use case.
    pub fn run_cycle(&self) -> Result<CycleSummary> {
        let sealed = {
            let _guard = self.mutex.lock().expect("writer mutex poisoned");
            self.compactor.seal_ready_chunks()?
        };
        let mut summary = self.compactor.run_rest()?;
        summary.chunks_sealed = sealed as u64;
        Ok(summary)
    }

    /// Loops `run_cycle` on `compact_interval`, sleeping in short slices
    /// so `cancel` is observed promptly rather than only between whole
    /// intervals.
    pub fn background_compact(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            match self.run_cycle() {
                Ok(summary) => {
                    tracing::info!(
                        chunks_sealed = summary.chunks_sealed,
                        chunks_fused = summary.chunks_fused,
                        bytes_written = summary.bytes_written,
                        segments_retired = summary.segments_retired,
                        "compaction cycle complete"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "compaction cycle aborted");
                    return Err(e);
                }
            }
            if !sleep_cancellable(self.config.compact_interval(), cancel) {
                return Ok(());
            }
        }
    }
}

/// Sleeps in short slices, returning `false` as soon as `cancel` fires
/// (including immediately, if it was already set) so a caller can stop
/// promptly instead of blocking for a whole interval.
fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> bool {
    const SLICE: Duration = Duration::from_millis(50);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if cancel.is_cancelled() {
            return false;
        }
        let step = remaining.min(SLICE);
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn cfg(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_root: root.to_path_buf(),
            chunk_min_age_secs: 0,
            chunk_max_age_secs: 0,
            chunk_min_size_bytes: 0,
            chunk_max_size_bytes: 0,
            ..EngineConfig::default()
        }
    }

    fn entry(app: &str, time_ns: u64, data: &[u8]) -> LogEntry {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        LogEntry {
            labels,
            time_ns,
            data: data.to_vec(),
        }
    }

    #[test]
    fn write_feeds_label_cache() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(cfg(dir.path()));
        let cache = Arc::new(LabelCache::new(config.label_cache_limit));
        let writer = CompactingWriter::new(config, Arc::clone(&cache));
        writer.write(&[entry("a", 1_000_000_000, br#"{"x":1}"#)]).unwrap();
        assert_eq!(cache.keys(), vec!["app".to_string()]);
        assert_eq!(cache.values("app"), vec!["a".to_string()]);
    }

    #[test]
    fn run_cycle_seals_and_fuses() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(cfg(dir.path()));
        let cache = Arc::new(LabelCache::new(config.label_cache_limit));
        let writer = CompactingWriter::new(Arc::clone(&config), cache);
        writer
            .write(&[
                entry("a", 1_000_000_000, br#"{"x":1}"#),
                entry("a", 2_000_000_000, br#"{"x":2}"#),
            ])
            .unwrap();
        let summary = writer.run_cycle().unwrap();
        assert_eq!(summary.chunks_sealed, 1);
        assert_eq!(summary.chunks_fused, 1);
    }

    #[test]
    fn background_compact_stops_immediately_on_pre_cancelled_token() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(cfg(dir.path()));
        let cache = Arc::new(LabelCache::new(config.label_cache_limit));
        let writer = CompactingWriter::new(config, cache);
        let cancel = CancelToken::new();
        cancel.cancel();
        writer.background_compact(&cancel).unwrap();
    }
}
