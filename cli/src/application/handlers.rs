use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;

use loghouse_core::error::{Error, Result};
use loghouse_core::{CancelToken, CompactingReader, CompactingWriter, Compactor};
use loghouse_core::{EngineConfig, LabelCache, LogEntry, ReadOptions, ReaderOptions};

fn config_for(data_root: PathBuf) -> EngineConfig {
    EngineConfig {
        data_root,
        ..EngineConfig::from_env_or_default()
    }
}

/// One line of `write`'s input file. `data` is kept as a raw JSON slice so
/// the bytes stored match what the caller sent (modulo re-serialization of
/// the outer object), rather than round-tripping through a parsed `Value`.
#[derive(serde::Deserialize)]
struct WireEntry<'a> {
    #[serde(default)]
    labels: BTreeMap<String, String>,
    time_ns: u64,
    #[serde(borrow)]
    data: &'a serde_json::value::RawValue,
}

pub fn handle_write(data_root: PathBuf, input: PathBuf) -> Result<()> {
    let config = Arc::new(config_for(data_root));
    let cache = Arc::new(LabelCache::new(config.label_cache_limit));
    let writer = CompactingWriter::new(Arc::clone(&config), cache);

    let file = std::fs::File::open(&input)?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let wire: WireEntry = serde_json::from_str(&line)
            .map_err(|e| Error::MalformedFrame(format!("{}: {e}", input.display())))?;
        entries.push(LogEntry {
            labels: wire.labels,
            time_ns: wire.time_ns,
            data: wire.data.get().as_bytes().to_vec(),
        });
    }

    let count = entries.len();
    writer.write(&entries)?;
    tracing::info!(count, data_root = %config.data_root.display(), "wrote entries");
    eprintln!(
        "write: appended {count} entries to {}",
        config.data_root.display()
    );
    Ok(())
}

pub fn handle_query(
    data_root: PathBuf,
    label: Vec<String>,
    start: Option<u64>,
    end: Option<u64>,
    contains: Vec<String>,
    reverse: bool,
) -> Result<()> {
    let config = config_for(data_root);

    let mut labels = BTreeMap::new();
    for kv in &label {
        let (k, v) = kv
            .split_once('=')
            .ok_or_else(|| Error::UnexpectedField(format!("--label expects key=value, got {kv:?}")))?;
        labels.insert(k.to_string(), v.to_string());
    }

    let mut opts = ReadOptions::new(|entry: LogEntry| {
        let data = if entry.data.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&entry.data).unwrap_or(serde_json::Value::Null)
        };
        let line = serde_json::json!({
            "labels": entry.labels,
            "time_ns": entry.time_ns,
            "data": data,
        });
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "{line}");
    });
    opts.labels = labels;
    opts.start_ms = start.unwrap_or(0);
    opts.end_ms = end.unwrap_or(0);
    opts.contains = contains;

    let reader_options = ReaderOptions {
        reverse,
        ..ReaderOptions::from_config(&config)
    };
    let reader = CompactingReader::new(&config, reader_options);
    reader.read(opts, CancelToken::new())
}

pub fn handle_compact(data_root: PathBuf) -> Result<()> {
    let config = Arc::new(config_for(data_root));
    let compactor = Compactor::new(Arc::clone(&config));
    let summary = compactor.run_cycle()?;
    tracing::info!(?summary, "compaction cycle complete");
    println!(
        "sealed={} fused={} bytes_written={} segments_retired={} dirs_swept={} index_rebuilt={}",
        summary.chunks_sealed,
        summary.chunks_fused,
        summary.bytes_written,
        summary.segments_retired,
        summary.dirs_swept,
        summary.index_rebuilt,
    );
    Ok(())
}

pub fn handle_labels(data_root: PathBuf) -> Result<()> {
    let config = config_for(data_root);
    let cache = LabelCache::new(config.label_cache_limit);
    eprintln!("labels: the cache is process-local; only entries written by this invocation show up here");
    for key in cache.keys() {
        println!("{key}");
    }
    Ok(())
}

pub fn handle_label_values(data_root: PathBuf, key: String) -> Result<()> {
    let config = config_for(data_root);
    let cache = LabelCache::new(config.label_cache_limit);
    eprintln!("label-values: the cache is process-local; only entries written by this invocation show up here");
    for value in cache.values(&key) {
        println!("{value}");
    }
    Ok(())
}
