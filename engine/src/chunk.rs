//! The chunk binary format: a `HEADER` TLV of nested sub-TLVs followed by
//! zero or more `(TIME, STRING)` data frames, optionally compressed.
//!
//! Wire time precision is milliseconds; callers hold nanoseconds and must
//! round towards zero on write (`nanos_to_ms`).

use crate::codec;
use crate::error::{Error, Result};
use crate::tlv::{self, ValueReader};
use std::collections::BTreeMap;
use std::io::{Read, Write};

pub const TYPE_STRING: u64 = 0;
pub const TYPE_HEADER: u64 = 1;
pub const TYPE_OFFSET_START: u64 = 2;
pub const TYPE_SIZE: u64 = 3;
pub const TYPE_LABELS: u64 = 4;
pub const TYPE_START: u64 = 5;
pub const TYPE_END: u64 = 6;
pub const TYPE_COMPRESSION: u64 = 7;
pub const TYPE_COUNT: u64 = 8;
pub const TYPE_INDEX: u64 = 9;
pub const TYPE_TIME: u64 = 10;

/// Wire tag for the compressed body; the bytes behind it are
/// zstd-framed (see `codec`), not the format the tag name suggests.
pub const COMPRESSION_TAG: &str = "s2";
pub const COMPRESSION_NONE: &str = "";

pub fn nanos_to_ms(nanos: i128) -> u64 {
    (nanos / 1_000_000) as u64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub offset_start: u64,
    pub size: u64,
    pub labels: BTreeMap<String, String>,
    pub start_ms: u64,
    pub end_ms: u64,
    pub compression: String,
    pub count: u64,
    pub index: Option<Vec<u8>>,
}

impl Default for Header {
    fn default() -> Self {
        Header {
            offset_start: 0,
            size: 0,
            labels: BTreeMap::new(),
            start_ms: 0,
            end_ms: 0,
            compression: String::new(),
            count: 0,
            index: None,
        }
    }
}

fn write_u64_tlv(w: &mut impl Write, typ: u64, v: u64) -> Result<()> {
    tlv::write_frame(w, typ, &v.to_be_bytes())
}

fn write_string_tlv(w: &mut impl Write, typ: u64, s: &str) -> Result<()> {
    tlv::write_frame(w, typ, s.as_bytes())
}

/// Encodes the `HEADER` sub-TLV sequence (the value bytes, not the outer
/// frame) for `h`.
pub fn encode_header_value(h: &Header) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    write_u64_tlv(&mut buf, TYPE_OFFSET_START, h.offset_start)?;
    write_u64_tlv(&mut buf, TYPE_SIZE, h.size)?;
    if !h.labels.is_empty() {
        let mut labels_buf = Vec::new();
        for (k, v) in &h.labels {
            write_string_tlv(&mut labels_buf, TYPE_STRING, k)?;
            write_string_tlv(&mut labels_buf, TYPE_STRING, v)?;
        }
        tlv::write_frame(&mut buf, TYPE_LABELS, &labels_buf)?;
    }
    write_u64_tlv(&mut buf, TYPE_START, h.start_ms)?;
    write_u64_tlv(&mut buf, TYPE_END, h.end_ms)?;
    if !h.compression.is_empty() {
        write_string_tlv(&mut buf, TYPE_COMPRESSION, &h.compression)?;
    }
    write_u64_tlv(&mut buf, TYPE_COUNT, h.count)?;
    if let Some(idx) = &h.index {
        tlv::write_frame(&mut buf, TYPE_INDEX, idx)?;
    }
    Ok(buf)
}

/// Writes a full `HEADER` frame (outer type + length + the value above).
pub fn write_header(w: &mut impl Write, h: &Header) -> Result<()> {
    let value = encode_header_value(h)?;
    tlv::write_frame(w, TYPE_HEADER, &value)
}

fn read_u64_value(v: &mut ValueReader<impl Read>) -> Result<u64> {
    let bytes = v.read_to_end()?;
    if bytes.len() != 8 {
        return Err(Error::MalformedFrame(format!(
            "expected 8-byte u64 field, got {} bytes",
            bytes.len()
        )));
    }
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes);
    Ok(u64::from_be_bytes(arr))
}

fn read_string_value(v: &mut ValueReader<impl Read>) -> Result<String> {
    let bytes = v.read_to_end()?;
    String::from_utf8(bytes).map_err(|e| Error::MalformedFrame(format!("non-utf8 string: {e}")))
}

/// Decodes a `HEADER` TLV's already-unwrapped value bytes. Unknown
/// sub-TLVs are a hard error — the codec is strict.
pub fn decode_header_value(value: &[u8]) -> Result<Header> {
    let mut h = Header::default();
    let mut cur = std::io::Cursor::new(value);
    while let Some((typ, mut v)) = tlv::read_frame(&mut cur)? {
        match typ {
            TYPE_OFFSET_START => h.offset_start = read_u64_value(&mut v)?,
            TYPE_SIZE => h.size = read_u64_value(&mut v)?,
            TYPE_LABELS => {
                let bytes = v.read_to_end()?;
                h.labels = decode_labels(&bytes)?;
            }
            TYPE_START => h.start_ms = read_u64_value(&mut v)?,
            TYPE_END => h.end_ms = read_u64_value(&mut v)?,
            TYPE_COMPRESSION => {
                let tag = read_string_value(&mut v)?;
                if tag != COMPRESSION_TAG && !tag.is_empty() {
                    return Err(Error::UnexpectedField(format!(
                        "unrecognized compression tag {tag:?}"
                    )));
                }
                h.compression = tag;
            }
            TYPE_COUNT => h.count = read_u64_value(&mut v)?,
            TYPE_INDEX => h.index = Some(v.read_to_end()?),
            other => {
                return Err(Error::UnexpectedField(format!(
                    "unknown header sub-TLV type {other}"
                )));
            }
        }
    }
    Ok(h)
}

fn decode_labels(value: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let mut cur = std::io::Cursor::new(value);
    loop {
        let key = match tlv::read_frame(&mut cur)? {
            None => break,
            Some((TYPE_STRING, mut v)) => read_string_value(&mut v)?,
            Some((other, _)) => {
                return Err(Error::UnexpectedField(format!(
                    "expected STRING in LABELS, got type {other}"
                )));
            }
        };
        let val = match tlv::read_frame(&mut cur)? {
            None => {
                return Err(Error::MalformedFrame(
                    "LABELS has an odd number of entries".into(),
                ));
            }
            Some((TYPE_STRING, mut v)) => read_string_value(&mut v)?,
            Some((other, _)) => {
                return Err(Error::UnexpectedField(format!(
                    "expected STRING in LABELS, got type {other}"
                )));
            }
        };
        out.insert(key, val);
    }
    Ok(out)
}

/// Reads the leading `HEADER` frame from `r`. Used both for live chunks
/// (header at offset 0 of `chunk.loghouse`) and for each entry of a
/// `header.loghouse` sidecar.
pub fn read_header(r: &mut impl Read) -> Result<Option<Header>> {
    match tlv::read_frame(r)? {
        None => Ok(None),
        Some((TYPE_HEADER, mut v)) => {
            let bytes = v.read_to_end()?;
            Ok(Some(decode_header_value(&bytes)?))
        }
        Some((other, _)) => Err(Error::UnexpectedField(format!(
            "expected HEADER frame, got type {other}"
        ))),
    }
}

/// One decoded record: on-disk millisecond time and raw JSON payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub time_ms: u64,
    pub data: Vec<u8>,
}

pub fn write_record(w: &mut impl Write, time_ms: u64, data: &[u8]) -> Result<()> {
    tlv::write_frame(w, TYPE_TIME, &time_ms.to_be_bytes())?;
    tlv::write_frame(w, TYPE_STRING, data)?;
    Ok(())
}

/// Reads one `(TIME, STRING)` record pair. `Ok(None)` at a clean
/// end-of-stream between records — including a live chunk's truncated
/// tail, which a caller reaches via the underlying reader hitting EOF
/// exactly at a frame boundary.
pub fn read_record(r: &mut impl Read) -> Result<Option<Record>> {
    let time_ms = match tlv::read_frame(r)? {
        None => return Ok(None),
        Some((TYPE_TIME, mut v)) => read_u64_value(&mut v)?,
        Some((other, _)) => {
            return Err(Error::UnexpectedField(format!(
                "expected TIME frame, got type {other}"
            )));
        }
    };
    let data = match tlv::read_frame(r)? {
        None => {
            return Err(Error::MalformedFrame(
                "truncated record: TIME with no STRING".into(),
            ));
        }
        Some((TYPE_STRING, mut v)) => v.read_to_end()?,
        Some((other, _)) => {
            return Err(Error::UnexpectedField(format!(
                "expected STRING frame, got type {other}"
            )));
        }
    };
    Ok(Some(Record { time_ms, data }))
}

/// Streams every record out of a (decompressed) data body, stopping
/// cleanly at EOF and tolerating a truncated final frame per §4.4's
/// crash-tolerance contract: a record whose TIME half arrived but whose
/// STRING half did not is surfaced as `MalformedFrame`, which callers
/// dealing with live-chunk tails should treat as "stop here, keep what
/// decoded so far" rather than a hard failure.
pub fn decode_records(r: &mut impl Read, mut on_record: impl FnMut(Record)) -> Result<u64> {
    let mut count = 0u64;
    loop {
        match read_record(r) {
            Ok(Some(rec)) => {
                on_record(rec);
                count += 1;
            }
            Ok(None) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}

/// Decompresses `src` (bounded to `size` bytes, or unbounded for `size ==
/// 0` meaning "to EOF", per the live-chunk convention) according to
/// `compression`, writing the raw TLV record stream to `dst`.
pub fn decompress_body(
    compression: &str,
    src: &mut impl Read,
    size: u64,
    dst: &mut impl Write,
) -> Result<u64> {
    let compressor = match compression {
        COMPRESSION_NONE => &codec::store::Store as &dyn codec::Compressor,
        COMPRESSION_TAG => &codec::zstdc::ZstdCompressor as &dyn codec::Compressor,
        other => return Err(Error::Compression(format!("unknown compression tag {other:?}"))),
    };
    if size == 0 {
        compressor.decompress(src, dst)
    } else {
        let mut bounded = std::io::Read::take(src, size);
        compressor.decompress(&mut bounded, dst)
    }
}
