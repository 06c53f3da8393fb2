use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about = "loghouse CLI harness (alpha)", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Append newline-delimited JSON records ({"labels":{},"time_ns":N,"data":{}}) to a store
    Write { data_root: PathBuf, input: PathBuf },

    /// Scan a store, optionally pruned by label equality, time range and substring hints
    Query {
        data_root: PathBuf,

        /// Equality filter, may be repeated (key=value)
        #[arg(long = "label", value_name = "KEY=VALUE")]
        label: Vec<String>,

        /// Inclusive lower bound, milliseconds since epoch
        #[arg(long)]
        start: Option<u64>,

        /// Inclusive upper bound, milliseconds since epoch
        #[arg(long)]
        end: Option<u64>,

        /// Substring pruning hint, may be repeated
        #[arg(long = "contains")]
        contains: Vec<String>,

        /// Scan newest-first instead of oldest-first
        #[arg(long)]
        reverse: bool,
    },

    /// Run a single seal/fuse/sweep/retain/index-rebuild cycle
    Compact { data_root: PathBuf },

    /// List label keys observed by writes in this process run
    Labels { data_root: PathBuf },

    /// List values observed for one label key in this process run
    LabelValues { data_root: PathBuf, key: String },
}
