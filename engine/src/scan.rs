//! Parallel, cancellable, directionally-ordered fan-out over chunk
//! directories: a fixed worker pool pulls chunk paths off an unbuffered
//! channel and runs `chunk_reader::read_chunk` on each.

use crate::entry::ReadOptions;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct ScanRoots {
    pub compact_root: PathBuf,
    pub incompact_root: PathBuf,
}

#[derive(Clone, Copy)]
pub struct ScanOptions {
    pub reader_count: usize,
    pub reverse: bool,
}

/// Enumerates chunk directories in the order §4.7 prescribes.
///
/// Forward: `{compact}` then `{incompact}`, each sorted lexicographically
/// ascending (ULID order approximates time order). Reverse: `{incompact}`
/// sorted by mtime descending, then `{compact}` sorted lexicographically
/// descending.
fn enumerate_chunks(roots: &ScanRoots, reverse: bool) -> Result<Vec<PathBuf>> {
    let mut compact = list_subdirs(&roots.compact_root)?;
    let mut incompact = list_subdirs(&roots.incompact_root)?;

    if !reverse {
        compact.sort();
        incompact.sort();
        compact.extend(incompact);
        Ok(compact)
    } else {
        incompact.sort_by_key(|p| std::cmp::Reverse(mtime(p)));
        compact.sort();
        compact.reverse();
        let mut out = incompact;
        out.extend(compact);
        Ok(out)
    }
}

fn list_subdirs(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(root) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            out.push(entry.path());
        }
    }
    Ok(out)
}

fn mtime(path: &Path) -> std::time::SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
}

/// Runs the fan-out scan. Results arrive via `opts.result` interleaved
/// across chunks (callers needing a strict merge, e.g. top-N, do it
/// themselves); within one sub-chunk, ordering is preserved. In reverse
/// mode, each chunk's own records are buffered and re-emitted in reverse
/// so that newest-first holds chunk-locally too.
pub fn scan(
    roots: &ScanRoots,
    scan_opts: &ScanOptions,
    read_opts: Arc<ReadOptions>,
    cancel: CancelToken,
) -> Result<()> {
    let chunks = enumerate_chunks(roots, scan_opts.reverse)?;
    let worker_count = scan_opts.reader_count.max(1).min(chunks.len().max(1));
    let (tx, rx) = crossbeam_channel::bounded::<PathBuf>(0);
    let first_err: Arc<std::sync::Mutex<Option<Error>>> = Arc::new(std::sync::Mutex::new(None));

    std::thread::scope(|scope| {
        for _ in 0..worker_count {
            let rx = rx.clone();
            let read_opts = Arc::clone(&read_opts);
            let cancel = cancel.clone();
            let first_err = Arc::clone(&first_err);
            scope.spawn(move || {
                while let Ok(chunk_dir) = rx.recv() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if scan_opts.reverse {
                        if let Err(e) = read_chunk_reversed(&chunk_dir, &read_opts, &cancel) {
                            record_error(&first_err, e, &cancel);
                        }
                    } else if let Err(e) =
                        crate::chunk_reader::read_chunk(&chunk_dir, &read_opts, &cancel)
                    {
                        record_error(&first_err, e, &cancel);
                    }
                }
            });
        }

        for path in chunks {
            if cancel.is_cancelled() {
                break;
            }
            if tx.send(path).is_err() {
                break;
            }
        }
        drop(tx);
    });

    let recorded = match Arc::try_unwrap(first_err) {
        Ok(mutex) => mutex.into_inner().expect("mutex not poisoned"),
        Err(arc) => match &*arc.lock().expect("mutex not poisoned") {
            Some(Error::Cancelled) => Some(Error::Cancelled),
            Some(e) => Some(clone_error(e)),
            None => None,
        },
    };
    match recorded {
        Some(e) => Err(e),
        // Cancellation observed by the producer/workers without any
        // per-chunk error ever being recorded (e.g. `cancel` was already
        // set before the scan started) still surfaces as `Cancelled`.
        None if cancel.is_cancelled() => Err(Error::Cancelled),
        None => Ok(()),
    }
}

fn clone_error(e: &Error) -> Error {
    Error::MalformedFrame(e.to_string())
}

fn record_error(slot: &std::sync::Mutex<Option<Error>>, e: Error, cancel: &CancelToken) {
    if matches!(e, Error::Cancelled) {
        cancel.cancel();
    }
    let mut guard = slot.lock().expect("mutex not poisoned");
    if guard.is_none() {
        *guard = Some(e);
    }
}

/// Buffers one chunk's delivered records and re-emits them in reverse,
/// preserving per-chunk ordering while honoring the scan's newest-first
/// contract.
fn read_chunk_reversed(
    chunk_dir: &Path,
    read_opts: &ReadOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let buffer: Arc<std::sync::Mutex<Vec<crate::entry::LogEntry>>> =
        Arc::new(std::sync::Mutex::new(Vec::new()));
    let buffer2 = Arc::clone(&buffer);
    let buffering_opts = ReadOptions {
        labels: read_opts.labels.clone(),
        start_ms: read_opts.start_ms,
        end_ms: read_opts.end_ms,
        contains: read_opts.contains.clone(),
        max_ngram: read_opts.max_ngram,
        summary_func: read_opts.summary_func.clone(),
        filter_func: read_opts.filter_func.clone(),
        result: crate::entry::ResultSink::new(move |e| buffer2.lock().unwrap().push(e)),
    };
    crate::chunk_reader::read_chunk(chunk_dir, &buffering_opts, cancel)?;
    let mut records = buffer.lock().expect("mutex not poisoned");
    for entry in records.drain(..).rev() {
        read_opts.result.deliver(entry);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{self, Header};
    use crate::live_writer::CHUNK_FILE;
    use std::collections::BTreeMap;

    fn write_live_chunk(dir: &Path, app: &str, records: &[(u64, &[u8])]) {
        std::fs::create_dir_all(dir).unwrap();
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        let mut f = std::fs::File::create(dir.join(CHUNK_FILE)).unwrap();
        chunk::write_header(&mut f, &Header {
            labels,
            ..Header::default()
        })
        .unwrap();
        for (t, d) in records {
            chunk::write_record(&mut f, *t, d).unwrap();
        }
    }

    #[test]
    fn scans_all_live_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let incompact = dir.path().join("incompact");
        write_live_chunk(&incompact.join("fp1"), "a", &[(1, br#"{"x":1}"#)]);
        write_live_chunk(&incompact.join("fp2"), "b", &[(2, br#"{"x":2}"#)]);

        let roots = ScanRoots {
            compact_root: dir.path().join("compact"),
            incompact_root: incompact,
        };
        let collected = Arc::new(std::sync::Mutex::new(Vec::new()));
        let collected2 = Arc::clone(&collected);
        let opts = Arc::new(ReadOptions::new(move |e| {
            collected2.lock().unwrap().push(e);
        }));
        scan(
            &roots,
            &ScanOptions {
                reader_count: 4,
                reverse: false,
            },
            opts,
            CancelToken::new(),
        )
        .unwrap();
        assert_eq!(collected.lock().unwrap().len(), 2);
    }

    #[test]
    fn empty_roots_scan_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let roots = ScanRoots {
            compact_root: dir.path().join("compact"),
            incompact_root: dir.path().join("incompact"),
        };
        let opts = Arc::new(ReadOptions::new(|_| {}));
        scan(
            &roots,
            &ScanOptions {
                reader_count: 4,
                reverse: false,
            },
            opts,
            CancelToken::new(),
        )
        .unwrap();
    }
}
