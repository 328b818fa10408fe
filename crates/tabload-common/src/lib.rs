//! Tabload Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error taxonomy and logging setup for the tabload workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the three-way failure taxonomy every load reports
//!   (configuration, validation, database) plus cancellation
//! - **Logging**: tracing subscriber configuration for the binaries
//!
//! # Example
//!
//! ```no_run
//! use tabload_common::{LoadError, ValidationError};
//!
//! fn check(path: &str) -> Result<(), LoadError> {
//!     if !std::path::Path::new(path).exists() {
//!         return Err(ValidationError::NotFound(path.to_string()).into());
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{DatabaseError, DatabaseErrorKind, LoadError, Result, ValidationError};
