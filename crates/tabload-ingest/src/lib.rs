//! Tabload Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Chunked, transactional loading of delimited text files into a database
//! table.
//!
//! # Pipeline
//!
//! - **Validator**: structural check of the source before any database work
//! - **Normalizer**: raw headers to unique, database-safe column names
//! - **Type inference**: per-column types from the validator's sample
//! - **ChunkReader**: pull-based iterator of bounded row batches
//! - **ConnectionManager**: session lifecycle and scoped transactions
//! - **ChunkLoader**: drives the above, one transaction per chunk
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use tabload_ingest::{ChunkLoader, ConnectionDescriptor, LoadOptions, PgConnector};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let descriptor = ConnectionDescriptor::new("localhost", 5432, "warehouse", "loader", "secret");
//!     let options = LoadOptions::default().with_chunk_size(500);
//!
//!     let loader = ChunkLoader::new(PgConnector);
//!     let result = loader
//!         .load(&descriptor, Path::new("orders.csv"), "sales.orders", &options)
//!         .await?;
//!     println!("{} rows loaded", result.total_rows_committed);
//!     Ok(())
//! }
//! ```

pub mod chunk_reader;
pub mod connection;
pub mod infer;
pub mod loader;
pub mod normalize;
pub mod source;
pub mod table;
pub mod validator;

// Re-export commonly used types
pub use chunk_reader::{Chunk, ChunkReadError, ChunkReader};
pub use connection::{
    ConnectionDescriptor, ConnectionHandle, ConnectionManager, Connector, PgConnector, PgSession,
    Session, SslMode,
};
pub use infer::ColumnType;
pub use loader::{
    ChunkFailure, ChunkLoader, FailurePolicy, LoadAbort, LoadOptions, LoadResult, LoadState,
};
pub use normalize::{normalize, ColumnMapping, ColumnSpec};
pub use source::{Row, SourceDescriptor, SourceEncoding, SourceOptions};
pub use table::{TableName, TableTarget, TargetColumn};
pub use validator::{ValidatedSource, Validator};
