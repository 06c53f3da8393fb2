//! Engine tuning knobs: compaction thresholds, scan concurrency, and the
//! data root. Loadable from a TOML file or built from the production
//! defaults below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub data_root: PathBuf,
    pub reader_count: usize,
    pub reverse: bool,
    pub max_ngram: usize,
    pub compact_interval_secs: u64,
    pub chunk_min_age_secs: u64,
    pub chunk_max_age_secs: u64,
    pub chunk_min_size_bytes: u64,
    pub chunk_max_size_bytes: u64,
    pub max_segment_size_bytes: u64,
    pub retention_secs: u64,
    pub empty_dir_age_secs: u64,
    pub label_cache_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            data_root: PathBuf::from("/var/lib/loghouse"),
            reader_count: 100,
            reverse: false,
            max_ngram: crate::ngram::DEFAULT_MAX_NGRAM,
            compact_interval_secs: 60,
            chunk_min_age_secs: 2 * 3600,
            chunk_max_age_secs: 8 * 3600,
            chunk_min_size_bytes: 20 * 1024 * 1024,
            chunk_max_size_bytes: 80 * 1024 * 1024,
            max_segment_size_bytes: 80 * 1024 * 1024,
            retention_secs: 31 * 24 * 3600,
            empty_dir_age_secs: 60,
            label_cache_limit: 32,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| Error::UnexpectedField(format!("invalid config at {path:?}: {e}")))
    }

    /// Reads the config path from `LOGHOUSE_CONFIG`, falling back to
    /// `EngineConfig::default()` when unset or unreadable.
    pub fn from_env_or_default() -> Self {
        match std::env::var_os("LOGHOUSE_CONFIG") {
            Some(path) => match Self::load(Path::new(&path)) {
                Ok(cfg) => cfg,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to load LOGHOUSE_CONFIG, using defaults");
                    Self::default()
                }
            },
            None => Self::default(),
        }
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_secs(self.compact_interval_secs)
    }

    pub fn chunk_min_age(&self) -> Duration {
        Duration::from_secs(self.chunk_min_age_secs)
    }

    pub fn chunk_max_age(&self) -> Duration {
        Duration::from_secs(self.chunk_max_age_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn empty_dir_age(&self) -> Duration {
        Duration::from_secs(self.empty_dir_age_secs)
    }

    pub fn incompact_root(&self) -> PathBuf {
        self.data_root.join("incompact")
    }

    pub fn compact_root(&self) -> PathBuf {
        self.data_root.join("compact")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_production_thresholds() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.chunk_min_age_secs, 7200);
        assert_eq!(cfg.chunk_max_age_secs, 28800);
        assert_eq!(cfg.chunk_min_size_bytes, 20 * 1024 * 1024);
        assert_eq!(cfg.retention_secs, 2_678_400);
        assert_eq!(cfg.reader_count, 100);
    }

    #[test]
    fn loads_partial_toml_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loghouse.toml");
        std::fs::write(&path, "data_root = \"/tmp/loghouse-test\"\nreader_count = 8\n").unwrap();
        let cfg = EngineConfig::load(&path).unwrap();
        assert_eq!(cfg.data_root, PathBuf::from("/tmp/loghouse-test"));
        assert_eq!(cfg.reader_count, 8);
        assert_eq!(cfg.chunk_min_age_secs, 7200); // untouched field keeps its default
    }

    #[test]
    fn malformed_toml_is_a_descriptive_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loghouse.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let err = EngineConfig::load(&path).unwrap_err();
        assert!(matches!(err, Error::UnexpectedField(_)));
    }
}
