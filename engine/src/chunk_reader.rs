//! Per-chunk read path: header pruning, optional index pruning, then
//! sectioned streaming decode with per-record filtering and delivery.
//!
//! A "chunk" here is a directory: either a live chunk
//! (`{incompact}/{fingerprint}/`, just `chunk.loghouse`) or a compacted
//! segment (`{compact}/{segment-ulid}/`, `chunk.loghouse` +
//! `header.loghouse` + optional `index.loghouse`).

use crate::chunk::{self, Header};
use crate::entry::{LogEntry, LogSummary, ReadOptions};
use crate::error::{Error, Result};
use crate::live_writer::CHUNK_FILE;
use crate::ngram;
use crate::scan::CancelToken;
use crate::tlv;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;

pub const HEADER_FILE: &str = "header.loghouse";
pub const INDEX_FILE: &str = "index.loghouse";

struct SubChunk {
    header: Header,
    /// Absolute byte offset of this sub-chunk's body within
    /// `chunk.loghouse`. Equal to `header.offset_start` for compacted
    /// segments, but for live chunks `header.offset_start` is always the
    /// wire-mandated `0` even though the body actually starts right
    /// after the leading `HEADER` frame — so this is tracked separately
    /// rather than read off the header.
    body_offset: u64,
}

/// Reads one chunk directory against `opts`, delivering matching entries
/// through `opts.result`. Returns `Cancelled` if `cancel` fires between
/// records. Safe to call concurrently for different chunks against the
/// same `opts` — delivery is serialized inside `ResultSink`.
pub fn read_chunk(chunk_dir: &Path, opts: &ReadOptions, cancel: &CancelToken) -> Result<()> {
    let header_path = chunk_dir.join(HEADER_FILE);
    let body_path = chunk_dir.join(CHUNK_FILE);

    let sub_chunks = match File::open(&header_path) {
        Ok(mut f) => read_compacted_headers(&mut f, opts)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => read_live_header(&body_path, opts)?,
        Err(e) => return Err(e.into()),
    };

    let sub_chunks = prune_by_index(chunk_dir, sub_chunks, opts)?;

    let mut body = File::open(&body_path)?;
    for sub in sub_chunks {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(summary_func) = &opts.summary_func {
            let summary = LogSummary {
                labels: sub.header.labels.clone(),
                start_ms: sub.header.start_ms,
                end_ms: sub.header.end_ms,
                count: sub.header.count,
            };
            if !summary_func(&summary) {
                continue;
            }
        }
        read_sub_chunk_body(&mut body, &sub.header, sub.body_offset, opts, cancel)?;
    }
    Ok(())
}

fn read_compacted_headers(f: &mut File, opts: &ReadOptions) -> Result<Vec<SubChunk>> {
    let mut out = Vec::new();
    while let Some(header) = chunk::read_header(f)? {
        if !opts.labels_match(&header.labels) {
            continue;
        }
        if !opts.time_intersects(header.start_ms, header.end_ms) {
            continue;
        }
        let body_offset = header.offset_start;
        out.push(SubChunk { header, body_offset });
    }
    Ok(out)
}

/// A live chunk has exactly one header, at the start of `chunk.loghouse`
/// itself, with `offset_start = 0, size = 0` (reader scans to EOF). Only
/// label equality prunes here — a live chunk's header carries no
/// meaningful time range yet.
fn read_live_header(body_path: &Path, opts: &ReadOptions) -> Result<Vec<SubChunk>> {
    let mut f = match File::open(body_path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let header = match chunk::read_header(&mut f)? {
        Some(h) => h,
        None => return Ok(Vec::new()),
    };
    if !opts.labels_match(&header.labels) {
        return Ok(Vec::new());
    }
    // The body starts right after the header frame we just consumed,
    // not at literal offset 0 (which is where the header itself lives).
    let body_offset = f.stream_position()?;
    Ok(vec![SubChunk { header, body_offset }])
}

/// Drops sub-chunks whose index provably lacks every `contains` string.
/// `index.loghouse` holds one raw `INDEX` TLV per sub-chunk, aligned
/// 1-to-1 with the surviving header list built above. Any sidecar
/// trouble (missing file, short read, corrupt entry) degrades to "no
/// hint" for the rest of the file rather than failing the read.
fn prune_by_index(
    chunk_dir: &Path,
    sub_chunks: Vec<SubChunk>,
    opts: &ReadOptions,
) -> Result<Vec<SubChunk>> {
    if opts.contains.is_empty() {
        return Ok(sub_chunks);
    }
    let index_path = chunk_dir.join(INDEX_FILE);
    let mut f = match File::open(&index_path) {
        Ok(f) => f,
        Err(_) => return Ok(sub_chunks), // no index sidecar: no hint, keep everything
    };

    let mut kept = Vec::with_capacity(sub_chunks.len());
    let mut index_exhausted = false;
    for sub in sub_chunks {
        if index_exhausted {
            kept.push(sub);
            continue;
        }
        let frame = match tlv::read_frame(&mut f) {
            Ok(Some((crate::chunk::TYPE_INDEX, mut v))) => v.read_to_end().ok(),
            _ => None,
        };
        let index_bytes = match frame {
            Some(b) => b,
            None => {
                index_exhausted = true;
                kept.push(sub);
                continue;
            }
        };
        let passes = opts
            .contains
            .iter()
            .all(|needle| ngram::contains(&index_bytes, needle, opts.max_ngram).unwrap_or(true));
        if passes {
            kept.push(sub);
        }
    }
    Ok(kept)
}

fn read_sub_chunk_body(
    body: &mut File,
    header: &Header,
    body_offset: u64,
    opts: &ReadOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let mut section_reader = section_reader(body, header, body_offset)?;
    let mut decompressed = Vec::new();
    // `section_reader` is already bounded to the sub-chunk's byte range;
    // pass `size = 0` ("unbounded") so `decompress_body` reads it to its
    // own EOF rather than double-bounding.
    chunk::decompress_body(&header.compression, &mut section_reader, 0, &mut decompressed)?;

    let mut cur = std::io::Cursor::new(decompressed);
    loop {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let record = match chunk::read_record(&mut cur) {
            Ok(Some(r)) => r,
            Ok(None) => break,
            Err(_) => break, // truncated tail: decode up to the last complete frame
        };
        let entry = LogEntry {
            labels: header.labels.clone(),
            time_ns: record.time_ms * 1_000_000,
            data: crate::entry::sanitize_data(record.data),
        };
        if !opts.labels_match(&entry.labels) {
            continue;
        }
        if !opts.time_intersects(entry.time_ms(), entry.time_ms()) {
            continue;
        }
        if let Some(filter_func) = &opts.filter_func {
            if !filter_func(&entry) {
                continue;
            }
        }
        opts.result.deliver(entry);
    }
    Ok(())
}

/// A length-bounded view over the sub-chunk's body bytes, seeked to
/// `body_offset` (the real file position — `header.offset_start` itself
/// is only meaningful for compacted segments; live chunks always carry
/// `0` there even though their body starts after the header frame).
/// Reads to EOF when `size == 0`, the live-chunk convention.
fn section_reader(body: &mut File, header: &Header, body_offset: u64) -> Result<impl Read + '_> {
    use std::io::SeekFrom;
    body.seek(SeekFrom::Start(body_offset))?;
    if header.size == 0 {
        Ok(body.take(u64::MAX))
    } else {
        Ok(body.take(header.size))
    }
}

/// Tests `contains` against a raw index payload, used by the compactor's
/// "which sub-chunk did the query skip" instrumentation in tests.
pub fn index_contains(index_bytes: &[u8], query: &str, max_ngram: usize) -> Result<bool> {
    ngram::contains(index_bytes, query, max_ngram)
}
