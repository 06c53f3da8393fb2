//! Appends batches of entries to per-label-fingerprint live chunk files
//! under `{incompact}/{fingerprint}/chunk.loghouse`.
//!
//! The header is written once, exclusively, on the first append to a
//! fingerprint; `AlreadyExists` on that exclusive create is benign (a
//! concurrent writer or a prior process run got there first). All
//! subsequent appends write only data frames.

use crate::chunk::{self, Header};
use crate::entry::LogEntry;
use crate::error::Result;
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const CHUNK_FILE: &str = "chunk.loghouse";
pub const SEALED_SUFFIX: &str = ".tmp";

pub struct LiveWriter {
    incompact_root: PathBuf,
}

impl LiveWriter {
    pub fn new(incompact_root: impl Into<PathBuf>) -> Self {
        LiveWriter {
            incompact_root: incompact_root.into(),
        }
    }

    pub fn chunk_dir(&self, fingerprint: &str) -> PathBuf {
        self.incompact_root.join(fingerprint)
    }

    pub fn chunk_path(&self, fingerprint: &str) -> PathBuf {
        self.chunk_dir(fingerprint).join(CHUNK_FILE)
    }

    /// Groups `entries` by label fingerprint and appends each group, in
    /// input order, to its live chunk.
    pub fn write(&self, entries: &[LogEntry]) -> Result<()> {
        let mut groups: BTreeMap<String, Vec<&LogEntry>> = BTreeMap::new();
        for e in entries {
            let fp = crate::fingerprint::fingerprint(&e.labels);
            groups.entry(fp).or_default().push(e);
        }
        for (fingerprint, group) in groups {
            self.write_group(&fingerprint, &group)?;
        }
        Ok(())
    }

    fn write_group(&self, fingerprint: &str, group: &[&LogEntry]) -> Result<()> {
        let dir = self.chunk_dir(fingerprint);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(CHUNK_FILE);
        self.ensure_header(&path, &group[0].labels)?;

        let mut f = OpenOptions::new().append(true).open(&path)?;
        for entry in group {
            chunk::write_record(&mut f, entry.time_ms(), &entry.data)?;
        }
        Ok(())
    }

    fn ensure_header(&self, path: &Path, labels: &BTreeMap<String, String>) -> Result<()> {
        let created = OpenOptions::new().write(true).create_new(true).open(path);
        match created {
            Ok(mut f) => {
                let header = Header {
                    labels: labels.clone(),
                    ..Header::default()
                };
                chunk::write_header(&mut f, &header)?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn entry(app: &str, role: &str, time_ns: u64, data: &[u8]) -> LogEntry {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), app.to_string());
        labels.insert("role".to_string(), role.to_string());
        LogEntry {
            labels,
            time_ns,
            data: data.to_vec(),
        }
    }

    #[test]
    fn groups_by_fingerprint_and_appends_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LiveWriter::new(dir.path());
        let entries = vec![
            entry("a", "r1", 1_000_000_000, br#"{"x":1}"#),
            entry("a", "r2", 2_000_000_000, br#"{"x":2}"#),
            entry("a", "r1", 3_000_000_000, br#"{"x":3}"#),
        ];
        writer.write(&entries).unwrap();

        let fp_r1 = crate::fingerprint::fingerprint(&entries[0].labels);
        let path = writer.chunk_path(&fp_r1);
        let mut f = std::fs::File::open(&path).unwrap();
        let header = chunk::read_header(&mut f).unwrap().unwrap();
        assert_eq!(header.labels.get("role").unwrap(), "r1");

        let mut records = Vec::new();
        chunk::decode_records(&mut f, |r| records.push(r)).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time_ms, 1000);
        assert_eq!(records[1].time_ms, 3000);
    }

    #[test]
    fn second_write_to_same_fingerprint_does_not_rewrite_header() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LiveWriter::new(dir.path());
        writer
            .write(&[entry("a", "r1", 1_000_000_000, br#"{"x":1}"#)])
            .unwrap();
        writer
            .write(&[entry("a", "r1", 2_000_000_000, br#"{"x":2}"#)])
            .unwrap();

        let fp = crate::fingerprint::fingerprint(&entry("a", "r1", 0, b"").labels);
        let mut f = std::fs::File::open(writer.chunk_path(&fp)).unwrap();
        chunk::read_header(&mut f).unwrap().unwrap();
        let mut records = Vec::new();
        chunk::decode_records(&mut f, |r| records.push(r)).unwrap();
        assert_eq!(records.len(), 2);
    }
}
