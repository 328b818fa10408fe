//! Error types for the tabload CLI
//!
//! Every failure maps to a taxonomy kind printed on stderr as
//! `"{kind}: {message}"` and to a process exit code.

use tabload_common::LoadError;
use tabload_ingest::LoadAbort;
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, CliError>;

/// Exit code for a load that completed with every chunk committed
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for an aborted load or a failure before loading
pub const EXIT_ABORTED: i32 = 1;
/// Exit code for a best-effort load that skipped one or more chunks
pub const EXIT_PARTIAL: i32 = 2;

#[derive(Error, Debug)]
pub enum CliError {
    /// Failure before the load started (configuration, arguments)
    #[error("{0}")]
    Load(#[from] LoadError),

    /// Load aborted after it started; carries the partial result
    #[error("{0}")]
    Aborted(Box<LoadAbort>),

    /// Report could not be rendered
    #[error("Failed to render report: {0}")]
    Report(#[from] serde_json::Error),
}

impl CliError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Load(LoadError::configuration(msg))
    }

    /// Taxonomy kind shown on stderr
    pub fn kind(&self) -> &'static str {
        match self {
            CliError::Load(e) => e.kind(),
            CliError::Aborted(abort) => abort.error.kind(),
            CliError::Report(_) => "OutputError",
        }
    }

    pub fn message(&self) -> String {
        match self {
            CliError::Load(e) => e.message(),
            CliError::Aborted(abort) => abort.error.message(),
            CliError::Report(e) => e.to_string(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        EXIT_ABORTED
    }
}

impl From<LoadAbort> for CliError {
    fn from(abort: LoadAbort) -> Self {
        Self::Aborted(Box::new(abort))
    }
}
