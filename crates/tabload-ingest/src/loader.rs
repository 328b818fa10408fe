//! Chunked load orchestration
//!
//! A load walks `INIT -> VALIDATED -> STREAMING -> {COMPLETED | ABORTED}`:
//!
//! 1. Options, table name and connection descriptor are checked, the source
//!    is validated, headers are normalized and column types inferred. Any
//!    failure here aborts before the database is contacted.
//! 2. A connection handle is opened and the target table prepared.
//! 3. Chunks are pulled one at a time and each is inserted in its own
//!    transaction. Transient failures are retried with the same rows;
//!    permanent failures are never retried.
//! 4. The handle is closed on every exit path.
//!
//! Chunks commit in source order and each one is all-or-nothing, so
//! `total_rows_committed` is always the sum of the committed chunks.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use tabload_common::{DatabaseError, DatabaseErrorKind, LoadError};

use crate::chunk_reader::{Chunk, ChunkReader};
use crate::connection::{
    ConnectionDescriptor, ConnectionHandle, ConnectionManager, Connector, Session,
};
use crate::infer::infer_column_types;
use crate::normalize::{normalize, ColumnMapping, ColumnSpec};
use crate::source::{SourceDescriptor, SourceOptions};
use crate::table::{TableName, TableTarget};
use crate::validator::Validator;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Upper bound on the backoff doubling
const MAX_BACKOFF_SHIFT: u32 = 6;

/// What to do when a chunk fails for good
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abort the load; chunks already committed stay committed
    #[default]
    FailFast,
    /// Skip the chunk, record it, and keep streaming
    BestEffort,
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fail-fast" | "fail_fast" => Ok(FailurePolicy::FailFast),
            "best-effort" | "best_effort" => Ok(FailurePolicy::BestEffort),
            other => Err(format!(
                "invalid chunk failure policy '{}' (expected fail-fast or best-effort)",
                other
            )),
        }
    }
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Per-load options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Rows per transaction
    pub chunk_size: usize,
    /// Extra attempts per chunk after a transient failure
    pub retry_limit: u32,
    pub on_chunk_failure: FailurePolicy,
    pub create_table_if_missing: bool,
    /// Delay before the first retry; doubles on each further retry
    pub retry_backoff: Duration,
    pub source: SourceOptions,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            retry_limit: DEFAULT_RETRY_LIMIT,
            on_chunk_failure: FailurePolicy::default(),
            create_table_if_missing: false,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            source: SourceOptions::default(),
        }
    }
}

impl LoadOptions {
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_retry_limit(mut self, retry_limit: u32) -> Self {
        self.retry_limit = retry_limit;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_chunk_failure = policy;
        self
    }

    pub fn with_create_table_if_missing(mut self, create: bool) -> Self {
        self.create_table_if_missing = create;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_allow_empty(mut self, allow_empty: bool) -> Self {
        self.source.allow_empty = allow_empty;
        self
    }

    pub fn with_source_options(mut self, source: SourceOptions) -> Self {
        self.source = source;
        self
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.chunk_size == 0 {
            return Err(LoadError::configuration("chunk_size must be at least 1"));
        }
        if self.source.sample_rows == 0 {
            return Err(LoadError::configuration("sample_rows must be at least 1"));
        }
        if let Some(delimiter) = self.source.delimiter {
            if !delimiter.is_ascii() || matches!(delimiter, '"' | '\n' | '\r') {
                return Err(LoadError::configuration(format!(
                    "unsupported delimiter {:?}",
                    delimiter
                )));
            }
        }
        Ok(())
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.retry_backoff.saturating_mul(1 << shift)
    }
}

/// Load lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadState {
    Init,
    Validated,
    Streaming,
    Completed,
    Aborted,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadState::Init => "INIT",
            LoadState::Validated => "VALIDATED",
            LoadState::Streaming => "STREAMING",
            LoadState::Completed => "COMPLETED",
            LoadState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// A chunk that was not committed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkFailure {
    pub chunk_index: usize,
    /// Source records in the chunk
    pub rows: usize,
    /// Transactions attempted; zero when the reader rejected the chunk
    pub attempts: u32,
    pub error_kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_kind: Option<DatabaseErrorKind>,
    pub reason: String,
}

/// Running and final account of a load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadResult {
    pub table_name: String,
    pub source: Option<SourceDescriptor>,
    pub columns: Vec<ColumnSpec>,
    pub state: LoadState,
    pub total_rows_committed: u64,
    pub chunks_attempted: usize,
    pub chunks_committed: usize,
    pub chunks_failed: usize,
    pub failures: Vec<ChunkFailure>,
}

impl LoadResult {
    fn new(table_name: &str) -> Self {
        Self {
            table_name: table_name.trim().to_string(),
            source: None,
            columns: Vec::new(),
            state: LoadState::Init,
            total_rows_committed: 0,
            chunks_attempted: 0,
            chunks_committed: 0,
            chunks_failed: 0,
            failures: Vec::new(),
        }
    }

    /// Completed with every chunk committed
    pub fn is_complete_success(&self) -> bool {
        self.state == LoadState::Completed && self.chunks_failed == 0
    }

    fn record_failure(&mut self, failure: ChunkFailure) {
        self.chunks_failed += 1;
        self.failures.push(failure);
    }
}

/// An aborted load: the error plus everything committed before it
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct LoadAbort {
    #[source]
    pub error: LoadError,
    pub result: LoadResult,
}

impl LoadAbort {
    fn new(error: LoadError, mut result: LoadResult) -> Self {
        result.state = LoadState::Aborted;
        Self { error, result }
    }
}

/// Everything the streaming phase needs from validation
struct PreparedLoad {
    table: TableName,
    source: SourceDescriptor,
    mapping: Arc<ColumnMapping>,
}

struct ChunkOutcome {
    attempts: u32,
    result: Result<u64, DatabaseError>,
}

/// Drives a load from source file to committed chunks
pub struct ChunkLoader<C> {
    manager: ConnectionManager<C>,
    cancel: CancellationToken,
}

impl<C: Connector> ChunkLoader<C> {
    pub fn new(connector: C) -> Self {
        Self {
            manager: ConnectionManager::new(connector),
            cancel: CancellationToken::new(),
        }
    }

    /// Observe `token` between chunks
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Load `source` into `table`
    ///
    /// On abort the returned [`LoadAbort`] still carries the partial
    /// [`LoadResult`], including rows already committed.
    pub async fn load(
        &self,
        descriptor: &ConnectionDescriptor,
        source: &Path,
        table: &str,
        options: &LoadOptions,
    ) -> Result<LoadResult, LoadAbort> {
        let span = info_span!("load", table = %table.trim(), path = %source.display());
        self.run(descriptor, source, table, options)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        descriptor: &ConnectionDescriptor,
        source: &Path,
        table: &str,
        options: &LoadOptions,
    ) -> Result<LoadResult, LoadAbort> {
        let mut result = LoadResult::new(table);

        let prepared = match prepare(descriptor, source, table, options) {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Load aborted before streaming");
                return Err(LoadAbort::new(e, result));
            }
        };
        result.source = Some(prepared.source.clone());
        result.columns = prepared.mapping.columns().to_vec();
        result.state = LoadState::Validated;
        info!(
            columns = prepared.mapping.len(),
            delimiter = ?prepared.source.delimiter,
            encoding = %prepared.source.encoding,
            "Source validated"
        );

        if self.cancel.is_cancelled() {
            warn!("Load cancelled before connecting");
            return Err(LoadAbort::new(LoadError::Cancelled, result));
        }

        let mut handle = match self.manager.open(descriptor).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Failed to open database connection");
                return Err(LoadAbort::new(e, result));
            }
        };
        result.state = LoadState::Streaming;

        let streamed = self
            .stream(&mut handle, &prepared, options, &mut result)
            .await;
        if let Err(e) = handle.close().await {
            warn!(error = %e, "Failed to close database connection cleanly");
        }

        match streamed {
            Ok(()) => {
                result.state = LoadState::Completed;
                info!(
                    rows = result.total_rows_committed,
                    chunks_committed = result.chunks_committed,
                    chunks_failed = result.chunks_failed,
                    state = %result.state,
                    "Load finished"
                );
                Ok(result)
            }
            Err(e) => {
                error!(
                    kind = e.kind(),
                    error = %e,
                    rows = result.total_rows_committed,
                    "Load aborted"
                );
                Err(LoadAbort::new(e, result))
            }
        }
    }

    async fn stream(
        &self,
        handle: &mut ConnectionHandle<C::Session>,
        prepared: &PreparedLoad,
        options: &LoadOptions,
        result: &mut LoadResult,
    ) -> Result<(), LoadError> {
        let table = prepared.table.clone();
        let mapping = Arc::clone(&prepared.mapping);
        let create = options.create_table_if_missing;
        let target = handle
            .with_transaction(move |session| {
                Box::pin(async move { session.prepare_table(&table, &mapping, create).await })
            })
            .await?;
        let target = Arc::new(target);

        let mut reader =
            ChunkReader::open(&prepared.source, prepared.mapping.len(), options.chunk_size)?;

        loop {
            if self.cancel.is_cancelled() {
                warn!(
                    rows = result.total_rows_committed,
                    "Load cancelled between chunks"
                );
                return Err(LoadError::Cancelled);
            }
            let Some(next) = reader.next() else {
                break;
            };
            result.chunks_attempted += 1;

            let chunk = match next {
                Ok(chunk) => Arc::new(chunk),
                Err(rejected) => {
                    let error = LoadError::Validation(rejected.error.clone());
                    error!(
                        chunk = rejected.chunk_index,
                        rows = rejected.rows,
                        error = %rejected.error,
                        "Chunk rejected by reader"
                    );
                    result.record_failure(ChunkFailure {
                        chunk_index: rejected.chunk_index,
                        rows: rejected.rows,
                        attempts: 0,
                        error_kind: error.kind(),
                        database_kind: None,
                        reason: rejected.error.to_string(),
                    });
                    if rejected.fatal || options.on_chunk_failure == FailurePolicy::FailFast {
                        return Err(error);
                    }
                    continue;
                }
            };

            let outcome = self.commit_chunk(handle, &target, &chunk, options).await;
            match outcome.result {
                Ok(rows) => {
                    result.total_rows_committed += rows;
                    result.chunks_committed += 1;
                    info!(
                        chunk = chunk.index,
                        rows,
                        attempts = outcome.attempts,
                        total = result.total_rows_committed,
                        "Chunk committed"
                    );
                }
                Err(e) => {
                    error!(
                        chunk = chunk.index,
                        rows = chunk.len(),
                        attempts = outcome.attempts,
                        kind = %e.kind,
                        error = %e.message,
                        "Chunk failed"
                    );
                    result.record_failure(ChunkFailure {
                        chunk_index: chunk.index,
                        rows: chunk.len(),
                        attempts: outcome.attempts,
                        error_kind: "DatabaseError",
                        database_kind: Some(e.kind),
                        reason: e.to_string(),
                    });
                    if options.on_chunk_failure == FailurePolicy::FailFast {
                        return Err(e.into());
                    }
                }
            }
        }

        Ok(())
    }

    /// Insert one chunk, retrying transient failures with the same rows
    async fn commit_chunk(
        &self,
        handle: &mut ConnectionHandle<C::Session>,
        target: &Arc<TableTarget>,
        chunk: &Arc<Chunk>,
        options: &LoadOptions,
    ) -> ChunkOutcome {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let target = Arc::clone(target);
            let batch = Arc::clone(chunk);
            let result = handle
                .with_transaction(move |session| {
                    Box::pin(async move { session.insert_rows(&target, &batch.rows).await })
                })
                .await;

            match result {
                Err(e) if e.is_transient() && attempts <= options.retry_limit => {
                    let delay = options.backoff(attempts);
                    warn!(
                        chunk = chunk.index,
                        attempt = attempts,
                        retry_limit = options.retry_limit,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying chunk"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                result => return ChunkOutcome { attempts, result },
            }
        }
    }
}

/// INIT -> VALIDATED: everything that can fail without a database
fn prepare(
    descriptor: &ConnectionDescriptor,
    source: &Path,
    table: &str,
    options: &LoadOptions,
) -> Result<PreparedLoad, LoadError> {
    options.validate()?;
    let table = TableName::parse(table)?;
    descriptor.validate()?;

    let validated = Validator::new(options.source.clone()).validate(source)?;
    let mapping = normalize(&validated.headers)?;
    let types = infer_column_types(mapping.len(), &validated.sample);
    let mapping = mapping.with_types(&types);

    for column in mapping.iter() {
        debug!(
            original = %column.original,
            name = %column.name,
            column_type = column.column_type.sql_type(),
            "Column mapped"
        );
    }

    Ok(PreparedLoad {
        table,
        source: validated.descriptor,
        mapping: Arc::new(mapping),
    })
}
