//! `CompactingReader`: the only reader the external surface sees,
//! wrapping the parallel scan behind `ReaderOptions`.

use crate::config::EngineConfig;
use crate::entry::ReadOptions;
use crate::error::Result;
use crate::scan::{self, CancelToken, ScanOptions, ScanRoots};
use std::sync::Arc;

#[derive(Clone, Copy, Debug)]
pub struct ReaderOptions {
    pub reader_count: usize,
    pub reverse: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        ReaderOptions {
            reader_count: 100,
            reverse: false,
        }
    }
}

impl ReaderOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        ReaderOptions {
            reader_count: config.reader_count,
            reverse: config.reverse,
        }
    }
}

pub struct CompactingReader {
    roots: ScanRoots,
    options: ReaderOptions,
}

impl CompactingReader {
    pub fn new(config: &EngineConfig, options: ReaderOptions) -> Self {
        CompactingReader {
            roots: ScanRoots {
                compact_root: config.compact_root(),
                incompact_root: config.incompact_root(),
            },
            options,
        }
    }

    /// Runs the parallel scan against `opts`, returning `Cancelled` if
    /// the scan was stopped mid-flight (partial results were already
    /// delivered through `opts.result` by then) or any hard chunk error
    /// that wasn't degraded silently.
    pub fn read(&self, opts: ReadOptions, cancel: CancelToken) -> Result<()> {
        let scan_opts = ScanOptions {
            reader_count: self.options.reader_count,
            reverse: self.options.reverse,
        };
        scan::scan(&self.roots, &scan_opts, Arc::new(opts), cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogEntry;
    use crate::live_writer::LiveWriter;
    use crate::error::Error;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    fn cfg(root: &std::path::Path) -> EngineConfig {
        EngineConfig {
            data_root: root.to_path_buf(),
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
    fn reads_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let config = cfg(dir.path());
        let writer = LiveWriter::new(config.incompact_root());
        writer
            .write(&[entry("a", 1_000_000_000, br#"{"x":1}"#)])
            .unwrap();

        let reader = CompactingReader::new(&config, ReaderOptions::default());
        let collected = Arc::new(Mutex::new(Vec::new()));
        let collected2 = Arc::clone(&collected);
        let opts = ReadOptions::new(move |e| collected2.lock().unwrap().push(e));
        reader.read(opts, CancelToken::new()).unwrap();
        assert_eq!(collected.lock().unwrap().len(), 1);
    }

    #[test]
    fn cancel_before_scan_returns_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let config = cfg(dir.path());
        let writer = LiveWriter::new(config.incompact_root());
        writer
            .write(&[entry("a", 1_000_000_000, br#"{"x":1}"#)])
            .unwrap();

        let reader = CompactingReader::new(&config, ReaderOptions::default());
        let opts = ReadOptions::new(|_| {});
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = reader.read(opts, cancel).unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
