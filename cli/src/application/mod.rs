pub mod handlers;

use crate::presentation::cli::{Cli, Commands};
use clap::Parser;
use loghouse_core::error::Result;

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Write { data_root, input } => handlers::handle_write(data_root, input),
        Commands::Query {
            data_root,
            label,
            start,
            end,
            contains,
            reverse,
        } => handlers::handle_query(data_root, label, start, end, contains, reverse),
        Commands::Compact { data_root } => handlers::handle_compact(data_root),
        Commands::Labels { data_root } => handlers::handle_labels(data_root),
        Commands::LabelValues { data_root, key } => handlers::handle_label_values(data_root, key),
    }
}
