//! Tabload CLI Library
//!
//! Command-line surface for loading delimited files into a database table.
//!
//! ```text
//! tabload load orders.csv sales.orders --chunk-size 500 --best-effort
//! ```
//!
//! Connection settings come from `config.ini` (see [`config`]); load options
//! come from the same file and can be overridden per invocation with flags.

pub mod commands;
pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::Settings;
pub use error::{CliError, Result};

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tabload_ingest::SourceEncoding;

/// Tabload - chunked, transactional CSV loader
#[derive(Parser, Debug)]
#[command(name = "tabload")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file
    #[arg(
        short,
        long,
        env = "TABLOAD_CONFIG",
        default_value = config::DEFAULT_CONFIG_PATH,
        global = true
    )]
    pub config: PathBuf,

    /// Report format on stdout
    #[arg(long, value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub output: OutputFormat,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Load a delimited file into a table
    Load(LoadArgs),
}

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Arguments of `tabload load`
#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Source file (header row required)
    pub file: PathBuf,

    /// Target table, optionally schema-qualified (`schema.table`)
    pub table: String,

    /// Rows per transaction
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Retries per chunk after a transient database failure
    #[arg(long)]
    pub retry_limit: Option<u32>,

    /// Skip failed chunks instead of aborting the load
    #[arg(long)]
    pub best_effort: bool,

    /// Create the table from inferred column types when it does not exist
    #[arg(long)]
    pub create_table: bool,

    /// Accept a source with a header but no data rows
    #[arg(long)]
    pub allow_empty: bool,

    /// Field delimiter (single character, or comma/semicolon/tab/pipe)
    #[arg(long, value_parser = config::parse_delimiter)]
    pub delimiter: Option<char>,

    /// Source encoding (utf-8 or latin-1)
    #[arg(long)]
    pub encoding: Option<SourceEncoding>,
}
