//! Error taxonomy for tabload
//!
//! Every failure a load can report falls into one of three kinds:
//!
//! - [`LoadError::Configuration`]: the connection descriptor or load options
//!   are missing or malformed. Never retried.
//! - [`LoadError::Validation`]: the source file is structurally unsound,
//!   either before streaming starts or for a single chunk mid-stream.
//! - [`LoadError::Database`]: connection, transaction or constraint failures,
//!   sub-classified by [`DatabaseErrorKind`] into transient and permanent.
//!
//! A fourth variant, [`LoadError::Cancelled`], records a caller-initiated
//! abort observed between chunks.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for load operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Top-level load error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Load cancelled by caller")]
    Cancelled,
}

impl LoadError {
    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Taxonomy name reported on the command surface
    pub fn kind(&self) -> &'static str {
        match self {
            LoadError::Configuration(_) => "ConfigurationError",
            LoadError::Validation(_) => "ValidationError",
            LoadError::Database(_) => "DatabaseError",
            LoadError::Cancelled => "Cancelled",
        }
    }

    /// Message without the kind prefix, for `"{kind}: {message}"` output
    pub fn message(&self) -> String {
        match self {
            LoadError::Configuration(msg) => msg.clone(),
            LoadError::Validation(e) => e.to_string(),
            LoadError::Database(e) => e.to_string(),
            LoadError::Cancelled => "load cancelled by caller".to_string(),
        }
    }

    /// Database sub-kind, if this is a database failure
    pub fn database_kind(&self) -> Option<DatabaseErrorKind> {
        match self {
            LoadError::Database(e) => Some(e.kind),
            _ => None,
        }
    }
}

/// Structural or content problems in the source file
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("File is empty: {0}")]
    Empty(String),

    #[error("Cannot read {path}: {reason}")]
    Unreadable { path: String, reason: String },

    #[error("Header row missing in {0}")]
    MissingHeader(String),

    #[error("Source contains no data rows: {0}")]
    NoDataRows(String),

    #[error("Headers '{first}' and '{second}' both normalize to column '{normalized}'")]
    ColumnCollision {
        first: String,
        second: String,
        normalized: String,
    },

    #[error("Line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: u64,
        expected: usize,
        found: usize,
    },

    #[error("Line {line}: {reason}")]
    Encoding { line: u64, reason: String },

    #[error("Malformed source: {0}")]
    Malformed(String),
}

/// Database failure sub-kind
///
/// Retained on every [`DatabaseError`] so the loader can decide between
/// retrying and skipping a chunk, and so logs carry the classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseErrorKind {
    /// Handshake with the server failed (unreachable host, refused, TLS)
    ConnectionFailed,
    /// An established connection dropped mid-operation
    ConnectionLost,
    /// Statement, acquire or handshake timeout
    Timeout,
    /// Deadlock or serialization failure
    Deadlock,
    /// Rejected credentials
    Authentication,
    /// Unique, foreign key, not-null or check constraint violation
    ConstraintViolation,
    /// Missing table or column, or other catalog mismatch
    SchemaMismatch,
    /// Value could not be converted to the column type
    DataType,
    /// Commit was sent but never acknowledged; the rows may be stored
    CommitUnknown,
    /// Anything not classified above
    Other,
}

impl DatabaseErrorKind {
    /// Whether a retry with the same data can reasonably succeed
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            DatabaseErrorKind::Timeout | DatabaseErrorKind::Deadlock | DatabaseErrorKind::ConnectionLost
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseErrorKind::ConnectionFailed => "connection_failed",
            DatabaseErrorKind::ConnectionLost => "connection_lost",
            DatabaseErrorKind::Timeout => "timeout",
            DatabaseErrorKind::Deadlock => "deadlock",
            DatabaseErrorKind::Authentication => "authentication",
            DatabaseErrorKind::ConstraintViolation => "constraint_violation",
            DatabaseErrorKind::SchemaMismatch => "schema_mismatch",
            DatabaseErrorKind::DataType => "data_type",
            DatabaseErrorKind::CommitUnknown => "commit_unknown",
            DatabaseErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for DatabaseErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified database failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub message: String,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Timeout, message)
    }

    pub fn schema_mismatch(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::SchemaMismatch, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}
