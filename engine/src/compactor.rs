//! Background compaction: seals ready/urgent live chunks, fuses sealed
//! chunks into compressed, indexed segments, sweeps empty live-chunk
//! directories and expired segments, and rebuilds at most one segment's
//! ngram index per cycle.

use crate::chunk::{self, Header};
use crate::codec::{self, Compressor};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::live_writer::{CHUNK_FILE, SEALED_SUFFIX};
use crate::ngram;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub const HEADER_SIDECAR: &str = "header.loghouse";
pub const INDEX_SIDECAR: &str = "index.loghouse";

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleSummary {
    pub chunks_sealed: u64,
    pub chunks_fused: u64,
    pub bytes_written: u64,
    pub segments_retired: u64,
    pub dirs_swept: u64,
    pub index_rebuilt: bool,
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Classification {
    NotReady = 0,
    Ready = 1,
    Urgent = 2,
}

pub struct Compactor {
    config: Arc<EngineConfig>,
}

impl Compactor {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        Compactor { config }
    }

    /// Runs a full cycle: seal, then the rest (§4.5 steps 1-4). Used by
    /// the one-shot CLI `compact` command, where there is no concurrent
    /// writer to exclude. `CompactingWriter::background_compact` instead
    /// calls `seal_ready_chunks` and `run_rest` separately so the writer
    /// mutex is only held across the (fast) seal/rename step.
    pub fn run_cycle(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        summary.chunks_sealed = self.seal_ready_chunks()? as u64;
        let rest = self.run_rest()?;
        summary.chunks_fused = rest.chunks_fused;
        summary.bytes_written = rest.bytes_written;
        summary.dirs_swept = rest.dirs_swept;
        summary.segments_retired = rest.segments_retired;
        summary.index_rebuilt = rest.index_rebuilt;
        Ok(summary)
    }

    /// Fuse, sweep, retain and (maybe) rebuild one index — everything in
    /// §4.5 except the sealing rename, which needs the writer mutex.
    pub fn run_rest(&self) -> Result<CycleSummary> {
        let mut summary = CycleSummary::default();
        let (fused, bytes) = self.fuse_sealed_chunks()?;
        summary.chunks_fused = fused;
        summary.bytes_written = bytes;
        summary.dirs_swept = self.empty_dir_sweep()?;
        summary.segments_retired = self.retention_sweep()?;
        summary.index_rebuilt = self.rebuild_one_index()?;
        Ok(summary)
    }

    fn incompact_root(&self) -> PathBuf {
        self.config.incompact_root()
    }

    fn compact_root(&self) -> PathBuf {
        self.config.compact_root()
    }

    fn classify(&self, size: u64, age: std::time::Duration) -> Classification {
        if size >= self.config.chunk_max_size_bytes || age >= self.config.chunk_max_age() {
            Classification::Urgent
        } else if size >= self.config.chunk_min_size_bytes || age >= self.config.chunk_min_age() {
            Classification::Ready
        } else {
            Classification::NotReady
        }
    }

    /// The "swap" step: renames every ready-or-urgent live chunk to
    /// `.tmp`, but only when at least one urgent chunk exists anywhere.
    /// Urgent chunks are renamed first. Returns the number sealed.
    pub fn seal_ready_chunks(&self) -> Result<usize> {
        let root = self.incompact_root();
        let mut candidates: Vec<(PathBuf, Classification)> = Vec::new();
        for dir in list_subdirs(&root)? {
            let chunk_path = dir.join(CHUNK_FILE);
            let meta = match fs::metadata(&chunk_path) {
                Ok(m) => m,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let age = meta
                .modified()
                .ok()
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            let class = self.classify(meta.len(), age);
            if class != Classification::NotReady {
                candidates.push((chunk_path, class));
            }
        }

        if !candidates.iter().any(|(_, c)| *c == Classification::Urgent) {
            return Ok(0);
        }

        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        let mut sealed = 0;
        for (path, _) in candidates {
            let sealed_path = path
                .parent()
                .expect("chunk path always has a parent dir")
                .join(format!("{CHUNK_FILE}{SEALED_SUFFIX}"));
            match fs::rename(&path, &sealed_path) {
                Ok(()) => sealed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(sealed)
    }

    /// Reads every `chunk.loghouse.tmp` under `{incompact}`, sorts its
    /// records by time, compresses the body, and appends it to the
    /// currently-open segment (minting a new one past
    /// `max_segment_size_bytes`). Returns `(chunks_fused, bytes_written)`.
    fn fuse_sealed_chunks(&self) -> Result<(u64, u64)> {
        let sealed_paths = self.list_sealed_chunks()?;
        if sealed_paths.is_empty() {
            return Ok((0, 0));
        }

        let (mut segment_dir, mut bytes_total) = self.pick_or_create_segment()?;
        let mut fused = 0u64;
        let mut bytes_written = 0u64;

        for sealed_path in sealed_paths {
            let (labels, mut records) = read_live_chunk(&sealed_path)?;
            if records.is_empty() {
                fs::remove_file(&sealed_path)?;
                continue;
            }
            records.sort_by_key(|r| r.time_ms);

            let mut raw = Vec::new();
            for r in &records {
                chunk::write_record(&mut raw, r.time_ms, &r.data)?;
            }
            let mut compressed = Vec::new();
            codec::zstdc::ZstdCompressor.compress(&mut raw.as_slice(), &mut compressed, 3)?;

            if bytes_total > 0
                && bytes_total + compressed.len() as u64 > self.config.max_segment_size_bytes
            {
                let (dir, total) = self.mint_segment()?;
                segment_dir = dir;
                bytes_total = total;
            }

            let body_path = segment_dir.join(CHUNK_FILE);
            let offset_start = fs::metadata(&body_path).map(|m| m.len()).unwrap_or(0);
            let mut body = OpenOptions::new()
                .append(true)
                .create(true)
                .open(&body_path)?;
            body.write_all(&compressed)?;

            let header = Header {
                offset_start,
                size: compressed.len() as u64,
                labels,
                start_ms: records.first().map(|r| r.time_ms).unwrap_or(0),
                end_ms: records.last().map(|r| r.time_ms).unwrap_or(0),
                compression: chunk::COMPRESSION_TAG.to_string(),
                count: records.len() as u64,
                index: None,
            };
            let mut header_sidecar = OpenOptions::new()
                .append(true)
                .create(true)
                .open(segment_dir.join(HEADER_SIDECAR))?;
            chunk::write_header(&mut header_sidecar, &header)?;

            bytes_total += compressed.len() as u64;
            bytes_written += compressed.len() as u64;
            fused += 1;

            fs::remove_file(&sealed_path)?;
            tracing::debug!(?sealed_path, segment = ?segment_dir, "fused sealed chunk into segment");
        }
        Ok((fused, bytes_written))
    }

    fn list_sealed_chunks(&self) -> Result<Vec<PathBuf>> {
        let root = self.incompact_root();
        let mut out = Vec::new();
        for dir in list_subdirs(&root)? {
            let sealed = dir.join(format!("{CHUNK_FILE}{SEALED_SUFFIX}"));
            if sealed.exists() {
                out.push(sealed);
            }
        }
        out.sort();
        Ok(out)
    }

    fn pick_or_create_segment(&self) -> Result<(PathBuf, u64)> {
        let root = self.compact_root();
        let mut segments = list_subdirs(&root)?;
        segments.sort();
        if let Some(last) = segments.last() {
            let body_len = fs::metadata(last.join(CHUNK_FILE)).map(|m| m.len()).unwrap_or(0);
            if body_len < self.config.max_segment_size_bytes {
                return Ok((last.clone(), body_len));
            }
        }
        self.mint_segment()
    }

    fn mint_segment(&self) -> Result<(PathBuf, u64)> {
        let root = self.compact_root();
        fs::create_dir_all(&root)?;
        let id = ulid::Ulid::new().to_string();
        let dir = root.join(id);
        fs::create_dir_all(&dir)?;
        Ok((dir, 0))
    }

    /// Removes `{fingerprint}/` directories under `{incompact}` that hold
    /// no unread data: either genuinely empty, or holding only a
    /// zero-record `chunk.loghouse` header, and older than
    /// `empty_dir_age`.
    fn empty_dir_sweep(&self) -> Result<u64> {
        let root = self.incompact_root();
        let mut swept = 0u64;
        for dir in list_subdirs(&root)? {
            let entries: Vec<_> = fs::read_dir(&dir)?.collect::<std::io::Result<_>>()?;
            let age = fs::metadata(&dir)
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| SystemTime::now().duration_since(t).ok())
                .unwrap_or_default();
            if age < self.config.empty_dir_age() {
                continue;
            }
            let removable = if entries.is_empty() {
                true
            } else if entries.len() == 1 && entries[0].file_name() == CHUNK_FILE {
                has_zero_records(&entries[0].path())?
            } else {
                false
            };
            if removable {
                fs::remove_dir_all(&dir)?;
                swept += 1;
            }
        }
        Ok(swept)
    }

    /// Removes whole segment directories whose ULID-encoded creation time
    /// is older than `retention`.
    fn retention_sweep(&self) -> Result<u64> {
        let root = self.compact_root();
        let mut retired = 0u64;
        let retention = self.config.retention();
        for dir in list_subdirs(&root)? {
            let Some(name) = dir.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Ok(id) = ulid::Ulid::from_string(name) else {
                continue;
            };
            let created = id.datetime();
            let age = SystemTime::now()
                .duration_since(created)
                .unwrap_or_default();
            if age >= retention {
                fs::remove_dir_all(&dir)?;
                retired += 1;
            }
        }
        Ok(retired)
    }

    /// Rebuilds at most one segment's `index.loghouse`, chosen as the
    /// first segment whose header count and index count disagree.
    fn rebuild_one_index(&self) -> Result<bool> {
        let root = self.compact_root();
        for dir in list_subdirs(&root)? {
            let headers = read_all_headers(&dir.join(HEADER_SIDECAR))?;
            let index_count = count_index_entries(&dir.join(INDEX_SIDECAR));
            if headers.len() == index_count {
                continue;
            }
            self.rebuild_segment_index(&dir, &headers)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn rebuild_segment_index(&self, segment_dir: &Path, headers: &[Header]) -> Result<()> {
        let index_path = segment_dir.join(INDEX_SIDECAR);
        let _ = fs::remove_file(&index_path);
        let body_path = segment_dir.join(CHUNK_FILE);
        let mut body = fs::File::open(&body_path)?;
        let mut index_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&index_path)?;

        for header in headers {
            let mut tokens = Vec::new();
            read_sub_chunk_tokens(&mut body, header, &mut tokens)?;
            match ngram::build_index(&tokens, self.config.max_ngram) {
                Ok(bytes) => crate::tlv::write_frame(&mut index_file, chunk::TYPE_INDEX, &bytes)?,
                Err(e) => {
                    tracing::warn!(error = %e, ?segment_dir, "skipping index entry for sub-chunk");
                    crate::tlv::write_frame(&mut index_file, chunk::TYPE_INDEX, &[])?;
                }
            }
        }
        tracing::debug!(?segment_dir, "rebuilt segment index");
        Ok(())
    }
}

fn list_subdirs(root: &Path) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(root) {
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

fn has_zero_records(chunk_path: &Path) -> Result<bool> {
    let mut f = fs::File::open(chunk_path)?;
    if chunk::read_header(&mut f)?.is_none() {
        return Ok(true);
    }
    Ok(chunk::read_record(&mut f)?.is_none())
}

/// Tolerates a crash-truncated tail (§4.4): a `MalformedFrame` from a
/// partial final record is swallowed, keeping every record decoded
/// before the truncation rather than aborting the whole fuse step.
fn read_live_chunk(path: &Path) -> Result<(std::collections::BTreeMap<String, String>, Vec<chunk::Record>)> {
    let mut f = fs::File::open(path)?;
    let header = chunk::read_header(&mut f)?.unwrap_or_default();
    let mut records = Vec::new();
    chunk::decode_records(&mut f, |r| records.push(r))
        .map(|_| ())
        .or_else(|e| if matches!(e, Error::MalformedFrame(_)) { Ok(()) } else { Err(e) })?;
    Ok((header.labels, records))
}

fn read_all_headers(path: &Path) -> Result<Vec<Header>> {
    let mut f = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    while let Some(h) = chunk::read_header(&mut f)? {
        out.push(h);
    }
    Ok(out)
}

fn count_index_entries(path: &Path) -> usize {
    let mut f = match fs::File::open(path) {
        Ok(f) => f,
        Err(_) => return 0,
    };
    let mut count = 0;
    while let Ok(Some((typ, mut v))) = crate::tlv::read_frame(&mut f) {
        if typ == chunk::TYPE_INDEX {
            let _ = v.skip();
            count += 1;
        } else {
            break;
        }
    }
    count
}

fn read_sub_chunk_tokens(body: &mut fs::File, header: &Header, out: &mut Vec<String>) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    body.seek(SeekFrom::Start(header.offset_start))?;
    let mut bounded = body.take(header.size);
    let mut decompressed = Vec::new();
    chunk::decompress_body(&header.compression, &mut bounded, 0, &mut decompressed)?;
    let mut cur = std::io::Cursor::new(decompressed);
    chunk::decode_records(&mut cur, |r| {
        if let Ok(v) = serde_json::from_slice::<serde_json::Value>(&r.data) {
            ngram::extract_tokens(&v, out);
        }
    })
    .map(|_| ())
    .or_else(|e| if matches!(e, Error::MalformedFrame(_)) { Ok(()) } else { Err(e) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogEntry;
    use crate::live_writer::LiveWriter;
    use std::collections::BTreeMap;

    fn cfg(root: &Path) -> EngineConfig {
        EngineConfig {
            data_root: root.to_path_buf(),
            chunk_min_age_secs: 0,
            chunk_max_age_secs: 0,
            chunk_min_size_bytes: 0,
            chunk_max_size_bytes: 0,
            empty_dir_age_secs: 0,
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
    fn seals_and_fuses_urgent_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(cfg(dir.path()));
        let writer = LiveWriter::new(config.incompact_root());
        writer
            .write(&[
                entry("a", 1_000_000_000, br#"{"x":1}"#),
                entry("a", 2_000_000_000, br#"{"x":2}"#),
            ])
            .unwrap();

        let compactor = Compactor::new(Arc::clone(&config));
        let summary = compactor.run_cycle().unwrap();
        assert_eq!(summary.chunks_sealed, 1);
        assert_eq!(summary.chunks_fused, 1);
        assert!(summary.bytes_written > 0);

        let segments = list_subdirs(&config.compact_root()).unwrap();
        assert_eq!(segments.len(), 1);
        let headers = read_all_headers(&segments[0].join(HEADER_SIDECAR)).unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].count, 2);
        assert_eq!(headers[0].start_ms, 1000);
        assert_eq!(headers[0].end_ms, 2000);
    }

    #[test]
    fn no_urgent_chunk_means_no_sealing() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig {
            data_root: dir.path().to_path_buf(),
            ..EngineConfig::default()
        });
        let writer = LiveWriter::new(config.incompact_root());
        writer.write(&[entry("a", 1_000_000_000, br#"{"x":1}"#)]).unwrap();

        let compactor = Compactor::new(config);
        let summary = compactor.run_cycle().unwrap();
        assert_eq!(summary.chunks_sealed, 0);
        assert_eq!(summary.chunks_fused, 0);
    }

    #[test]
    fn rerunning_cycle_with_no_new_writes_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(cfg(dir.path()));
        let writer = LiveWriter::new(config.incompact_root());
        writer.write(&[entry("a", 1_000_000_000, br#"{"x":1}"#)]).unwrap();
        let compactor = Compactor::new(Arc::clone(&config));
        compactor.run_cycle().unwrap();
        let second = compactor.run_cycle().unwrap();
        assert_eq!(second.chunks_sealed, 0);
        assert_eq!(second.chunks_fused, 0);
    }

    #[test]
    fn index_rebuild_adds_one_entry_per_header() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(cfg(dir.path()));
        let writer = LiveWriter::new(config.incompact_root());
        writer
            .write(&[entry("a", 1_000_000_000, br#"{"msg":"alpha"}"#)])
            .unwrap();
        let compactor = Compactor::new(Arc::clone(&config));
        let summary = compactor.run_cycle().unwrap();
        assert!(summary.index_rebuilt);

        let segments = list_subdirs(&config.compact_root()).unwrap();
        let index_count = count_index_entries(&segments[0].join(INDEX_SIDECAR));
        assert_eq!(index_count, 1);
    }
}
