//! Load pipeline tests against a scripted in-memory session
//!
//! The scripted session records every begin/insert/commit/rollback, keeps
//! committed rows per chunk, and fails inserts on demand so retry and
//! failure-policy behavior can be checked without a database.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabload_common::{DatabaseError, DatabaseErrorKind, LoadError, ValidationError};
use tabload_ingest::{
    ChunkLoader, ColumnMapping, ColumnType, ConnectionDescriptor, Connector, FailurePolicy,
    LoadOptions, LoadState, Row, Session, TableName, TableTarget,
};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Scripted session
// ============================================================================

struct FailureRule {
    kind: DatabaseErrorKind,
    /// Remaining failures; `None` fails forever
    remaining: Option<usize>,
}

#[derive(Default)]
struct Script {
    events: Vec<String>,
    pending: Vec<Row>,
    committed: Vec<Vec<Row>>,
    insert_calls: usize,
    /// Keyed by the first field of the first row in a batch
    failures: HashMap<String, FailureRule>,
    connect_error: Option<DatabaseError>,
    table_exists: bool,
    connects: usize,
    open_sessions: usize,
    cancel_after_commits: Option<(usize, CancellationToken)>,
    /// Commits that store their rows but report a dropped connection
    lost_commit_acks: usize,
}

impl Script {
    fn committed_sizes(&self) -> Vec<usize> {
        self.committed.iter().map(Vec::len).collect()
    }

    fn committed_ids(&self) -> Vec<String> {
        self.committed
            .iter()
            .flatten()
            .map(|row| row[0].clone().unwrap())
            .collect()
    }
}

#[derive(Clone)]
struct Harness {
    script: Arc<Mutex<Script>>,
}

impl Harness {
    fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                table_exists: true,
                ..Script::default()
            })),
        }
    }

    fn fail_chunk_starting_with(&self, id: &str, kind: DatabaseErrorKind, times: Option<usize>) {
        self.script.lock().unwrap().failures.insert(
            id.to_string(),
            FailureRule {
                kind,
                remaining: times,
            },
        );
    }

    fn loader(&self) -> ChunkLoader<ScriptedConnector> {
        ChunkLoader::new(ScriptedConnector {
            script: self.script.clone(),
        })
    }

    fn with<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        f(&mut self.script.lock().unwrap())
    }
}

struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl Connector for ScriptedConnector {
    type Session = ScriptedSession;

    async fn connect(&self, _descriptor: &ConnectionDescriptor) -> Result<ScriptedSession, DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.connects += 1;
        if let Some(err) = script.connect_error.clone() {
            return Err(err);
        }
        script.open_sessions += 1;
        Ok(ScriptedSession {
            script: self.script.clone(),
        })
    }
}

struct ScriptedSession {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl Session for ScriptedSession {
    async fn begin(&mut self) -> Result<(), DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.events.push("begin".into());
        script.pending.clear();
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.events.push("commit".into());
        let rows = std::mem::take(&mut script.pending);
        let stored = !rows.is_empty();
        if stored {
            script.committed.push(rows);
        }
        let commits = script.committed.len();
        if let Some((after, token)) = &script.cancel_after_commits {
            if commits >= *after {
                token.cancel();
            }
        }
        if stored && script.lost_commit_acks > 0 {
            script.lost_commit_acks -= 1;
            return Err(DatabaseError::new(
                DatabaseErrorKind::ConnectionLost,
                "connection reset before COMMIT acknowledgement",
            ));
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.events.push("rollback".into());
        script.pending.clear();
        Ok(())
    }

    async fn prepare_table(
        &mut self,
        table: &TableName,
        mapping: &ColumnMapping,
        create_if_missing: bool,
    ) -> Result<TableTarget, DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.events.push("prepare".into());
        if !script.table_exists {
            if !create_if_missing {
                return Err(DatabaseError::schema_mismatch(format!(
                    "table {} does not exist",
                    table
                )));
            }
            script.events.push("create".into());
            script.table_exists = true;
        }
        Ok(TableTarget::from_mapping(table.clone(), mapping))
    }

    async fn insert_rows(&mut self, _target: &TableTarget, rows: &[Row]) -> Result<u64, DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.insert_calls += 1;
        let key = rows
            .first()
            .and_then(|row| row[0].clone())
            .unwrap_or_default();
        script.events.push(format!("insert:{}", key));

        if let Some(rule) = script.failures.get_mut(&key) {
            let fail = match rule.remaining.as_mut() {
                None => true,
                Some(0) => false,
                Some(n) => {
                    *n -= 1;
                    true
                }
            };
            if fail {
                return Err(DatabaseError::new(rule.kind, format!("scripted failure at {}", key)));
            }
        }

        script.pending.extend(rows.iter().cloned());
        Ok(rows.len() as u64)
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        let mut script = self.script.lock().unwrap();
        script.events.push("close".into());
        script.open_sessions -= 1;
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn source(lines: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "id,name").unwrap();
    for line in lines {
        writeln!(file, "{}", line).unwrap();
    }
    file.flush().unwrap();
    file
}

fn five_rows() -> NamedTempFile {
    source(&["1,a", "2,b", "3,c", "4,d", "5,e"])
}

fn descriptor() -> ConnectionDescriptor {
    ConnectionDescriptor::new("localhost", 5432, "warehouse", "loader", "secret")
}

fn options(chunk_size: usize) -> LoadOptions {
    LoadOptions::default()
        .with_chunk_size(chunk_size)
        .with_retry_backoff(Duration::ZERO)
}

// ============================================================================
// Chunking and ordering
// ============================================================================

#[tokio::test]
async fn test_five_rows_commit_as_two_two_one_in_order() {
    let harness = Harness::new();
    let file = five_rows();

    let result = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap();

    assert_eq!(result.state, LoadState::Completed);
    assert!(result.is_complete_success());
    assert_eq!(result.total_rows_committed, 5);
    assert_eq!(result.chunks_attempted, 3);
    assert_eq!(result.chunks_committed, 3);
    assert_eq!(result.chunks_failed, 0);

    harness.with(|script| {
        assert_eq!(script.committed_sizes(), vec![2, 2, 1]);
        assert_eq!(script.committed_ids(), vec!["1", "2", "3", "4", "5"]);
        assert_eq!(
            script.events,
            vec![
                "begin", "prepare", "commit", "begin", "insert:1", "commit", "begin", "insert:3",
                "commit", "begin", "insert:5", "commit", "close",
            ]
        );
        assert_eq!(script.open_sessions, 0);
    });
}

#[tokio::test]
async fn test_total_equals_sum_of_committed_chunks() {
    let harness = Harness::new();
    let lines: Vec<String> = (1..=23).map(|i| format!("{},n{}", i, i)).collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let file = source(&refs);

    let result = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(4))
        .await
        .unwrap();

    let committed: usize = harness.with(|s| s.committed_sizes().iter().sum());
    assert_eq!(result.total_rows_committed, committed as u64);
    assert_eq!(result.total_rows_committed, 23);
    assert_eq!(result.chunks_attempted, 6);
}

#[tokio::test]
async fn test_result_reports_source_and_inferred_columns() {
    let harness = Harness::new();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "Order ID;Amount;Placed On;Note").unwrap();
    writeln!(file, "1;9.99;2024-03-01;first").unwrap();
    writeln!(file, "2;15;2024-03-02;").unwrap();
    file.flush().unwrap();

    let result = harness
        .loader()
        .load(&descriptor(), file.path(), "sales.orders", &options(10))
        .await
        .unwrap();

    let source = result.source.as_ref().unwrap();
    assert_eq!(source.delimiter, ';');
    assert_eq!(source.row_count, Some(2));

    let columns: Vec<(&str, ColumnType)> = result
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.column_type))
        .collect();
    assert_eq!(
        columns,
        vec![
            ("order_id", ColumnType::Integer),
            ("amount", ColumnType::Numeric),
            ("placed_on", ColumnType::Date),
            ("note", ColumnType::Text),
        ]
    );
    assert_eq!(result.table_name, "sales.orders");
}

// ============================================================================
// Failure policies
// ============================================================================

#[tokio::test]
async fn test_fail_fast_stops_at_permanent_failure() {
    let harness = Harness::new();
    harness.fail_chunk_starting_with("3", DatabaseErrorKind::ConstraintViolation, None);
    let file = five_rows();

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(abort.error.kind(), "DatabaseError");
    assert_eq!(
        abort.error.database_kind(),
        Some(DatabaseErrorKind::ConstraintViolation)
    );
    let result = abort.result;
    assert_eq!(result.state, LoadState::Aborted);
    assert_eq!(result.total_rows_committed, 2);
    assert_eq!(result.chunks_attempted, 2);
    assert_eq!(result.chunks_failed, 1);
    assert_eq!(result.failures[0].chunk_index, 2);

    harness.with(|script| {
        assert_eq!(script.committed_ids(), vec!["1", "2"]);
        assert!(!script.events.contains(&"insert:5".to_string()));
        assert_eq!(script.events.last().map(String::as_str), Some("close"));
        assert_eq!(script.open_sessions, 0);
    });
}

#[tokio::test]
async fn test_best_effort_skips_failed_chunk() {
    let harness = Harness::new();
    harness.fail_chunk_starting_with("3", DatabaseErrorKind::ConstraintViolation, None);
    let file = five_rows();

    let result = harness
        .loader()
        .load(
            &descriptor(),
            file.path(),
            "people",
            &options(2).with_failure_policy(FailurePolicy::BestEffort),
        )
        .await
        .unwrap();

    assert_eq!(result.state, LoadState::Completed);
    assert!(!result.is_complete_success());
    assert_eq!(result.total_rows_committed, 3);
    assert_eq!(result.chunks_attempted, 3);
    assert_eq!(result.chunks_committed, 2);
    assert_eq!(result.chunks_failed, 1);

    let failure = &result.failures[0];
    assert_eq!(failure.chunk_index, 2);
    assert_eq!(failure.rows, 2);
    assert_eq!(failure.attempts, 1);
    assert_eq!(failure.database_kind, Some(DatabaseErrorKind::ConstraintViolation));
    assert!(failure.reason.contains("scripted failure at 3"));

    harness.with(|script| assert_eq!(script.committed_ids(), vec!["1", "2", "5"]));
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test]
async fn test_transient_failure_succeeds_on_second_retry_without_duplicates() {
    let harness = Harness::new();
    harness.fail_chunk_starting_with("3", DatabaseErrorKind::Deadlock, Some(2));
    let file = five_rows();

    let result = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2).with_retry_limit(3))
        .await
        .unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.total_rows_committed, 5);
    assert_eq!(result.chunks_attempted, 3);

    harness.with(|script| {
        assert_eq!(script.committed_ids(), vec!["1", "2", "3", "4", "5"]);
        let chunk_two_attempts = script.events.iter().filter(|e| *e == "insert:3").count();
        assert_eq!(chunk_two_attempts, 3);
        let rollbacks = script.events.iter().filter(|e| *e == "rollback").count();
        assert_eq!(rollbacks, 2);
    });
}

#[tokio::test]
async fn test_transient_failure_exhausts_retry_limit() {
    let harness = Harness::new();
    harness.fail_chunk_starting_with("3", DatabaseErrorKind::Timeout, None);
    let file = five_rows();

    let result = harness
        .loader()
        .load(
            &descriptor(),
            file.path(),
            "people",
            &options(2)
                .with_retry_limit(3)
                .with_failure_policy(FailurePolicy::BestEffort),
        )
        .await
        .unwrap();

    assert_eq!(result.failures.len(), 1);
    assert_eq!(result.failures[0].attempts, 4);
    assert_eq!(result.failures[0].database_kind, Some(DatabaseErrorKind::Timeout));
    assert_eq!(result.total_rows_committed, 3);
    harness.with(|script| assert_eq!(script.insert_calls, 6));
}

#[tokio::test]
async fn test_unacknowledged_commit_is_never_replayed() {
    let harness = Harness::new();
    harness.with(|script| script.lost_commit_acks = 1);
    let file = five_rows();

    let result = harness
        .loader()
        .load(
            &descriptor(),
            file.path(),
            "people",
            &options(2)
                .with_retry_limit(3)
                .with_failure_policy(FailurePolicy::BestEffort),
        )
        .await
        .unwrap();

    assert_eq!(result.state, LoadState::Completed);
    assert!(!result.is_complete_success());
    assert_eq!(result.total_rows_committed, 3);
    assert_eq!(result.chunks_failed, 1);
    assert_eq!(result.failures[0].chunk_index, 1);
    assert_eq!(result.failures[0].attempts, 1);
    assert_eq!(
        result.failures[0].database_kind,
        Some(DatabaseErrorKind::CommitUnknown)
    );
    assert!(result.failures[0].reason.contains("outcome unknown"));

    harness.with(|script| {
        assert_eq!(script.committed_ids(), vec!["1", "2", "3", "4", "5"]);
        let chunk_one_attempts = script.events.iter().filter(|e| *e == "insert:1").count();
        assert_eq!(chunk_one_attempts, 1);
    });
}

#[tokio::test]
async fn test_unacknowledged_commit_aborts_under_fail_fast() {
    let harness = Harness::new();
    harness.with(|script| script.lost_commit_acks = 1);
    let file = five_rows();

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(
        abort.error.database_kind(),
        Some(DatabaseErrorKind::CommitUnknown)
    );
    assert_eq!(abort.result.state, LoadState::Aborted);
    assert_eq!(abort.result.chunks_attempted, 1);
    assert_eq!(abort.result.total_rows_committed, 0);
    harness.with(|script| {
        assert_eq!(script.insert_calls, 1);
        assert_eq!(script.open_sessions, 0);
    });
}

#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let harness = Harness::new();
    harness.fail_chunk_starting_with("1", DatabaseErrorKind::DataType, None);
    let file = five_rows();

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2).with_retry_limit(5))
        .await
        .unwrap_err();

    assert_eq!(abort.result.failures[0].attempts, 1);
    assert_eq!(abort.result.total_rows_committed, 0);
    harness.with(|script| assert_eq!(script.insert_calls, 1));
}

#[tokio::test(start_paused = true)]
async fn test_retry_waits_with_backoff() {
    let harness = Harness::new();
    harness.fail_chunk_starting_with("1", DatabaseErrorKind::Deadlock, Some(2));
    let file = five_rows();

    let started = tokio::time::Instant::now();
    let result = harness
        .loader()
        .load(
            &descriptor(),
            file.path(),
            "people",
            &options(5).with_retry_backoff(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert_eq!(result.total_rows_committed, 5);
    // 100ms before the first retry, 200ms before the second
    assert!(started.elapsed() >= Duration::from_millis(300));
}

// ============================================================================
// Empty sources
// ============================================================================

#[tokio::test]
async fn test_header_only_source_rejected_by_default() {
    let harness = Harness::new();
    let file = source(&[]);

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert!(matches!(
        abort.error,
        LoadError::Validation(ValidationError::NoDataRows(_))
    ));
    assert_eq!(abort.result.state, LoadState::Aborted);
    assert_eq!(abort.result.total_rows_committed, 0);
    harness.with(|script| assert_eq!(script.connects, 0));
}

#[tokio::test]
async fn test_header_only_source_allowed_loads_zero_rows() {
    let harness = Harness::new();
    harness.with(|script| script.table_exists = false);
    let file = source(&[]);

    let result = harness
        .loader()
        .load(
            &descriptor(),
            file.path(),
            "people",
            &options(2)
                .with_allow_empty(true)
                .with_create_table_if_missing(true),
        )
        .await
        .unwrap();

    assert_eq!(result.state, LoadState::Completed);
    assert_eq!(result.total_rows_committed, 0);
    assert_eq!(result.chunks_attempted, 0);
    harness.with(|script| {
        assert!(script.events.contains(&"create".to_string()));
        assert_eq!(script.open_sessions, 0);
    });
}

// ============================================================================
// Connection and configuration failures
// ============================================================================

#[tokio::test]
async fn test_connection_open_failure() {
    let harness = Harness::new();
    harness.with(|script| {
        script.connect_error = Some(DatabaseError::new(
            DatabaseErrorKind::ConnectionFailed,
            "connection refused",
        ))
    });
    let file = five_rows();

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(abort.error.kind(), "DatabaseError");
    assert_eq!(
        abort.error.database_kind(),
        Some(DatabaseErrorKind::ConnectionFailed)
    );
    assert_eq!(abort.result.chunks_attempted, 0);
    assert_eq!(abort.result.total_rows_committed, 0);
    harness.with(|script| {
        assert_eq!(script.connects, 1);
        assert_eq!(script.open_sessions, 0);
    });
}

#[tokio::test]
async fn test_incomplete_descriptor_is_configuration_error() {
    let harness = Harness::new();
    let file = five_rows();
    let mut incomplete = descriptor();
    incomplete.password = String::new();

    let abort = harness
        .loader()
        .load(&incomplete, file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(abort.error.kind(), "ConfigurationError");
    harness.with(|script| assert_eq!(script.connects, 0));
}

#[tokio::test]
async fn test_missing_table_without_create() {
    let harness = Harness::new();
    harness.with(|script| script.table_exists = false);
    let file = five_rows();

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(
        abort.error.database_kind(),
        Some(DatabaseErrorKind::SchemaMismatch)
    );
    assert_eq!(abort.result.chunks_attempted, 0);
    harness.with(|script| assert_eq!(script.open_sessions, 0));
}

// ============================================================================
// Malformed rows
// ============================================================================

#[tokio::test]
async fn test_malformed_row_aborts_under_fail_fast() {
    let harness = Harness::new();
    let file = source(&["1,a", "2,b", "3", "4,d", "5,e"]);

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert!(matches!(
        abort.error,
        LoadError::Validation(ValidationError::FieldCount { line: 4, .. })
    ));
    assert_eq!(abort.result.total_rows_committed, 2);
    assert_eq!(abort.result.chunks_attempted, 2);
    harness.with(|script| assert_eq!(script.committed_ids(), vec!["1", "2"]));
}

#[tokio::test]
async fn test_malformed_row_skips_chunk_under_best_effort() {
    let harness = Harness::new();
    let file = source(&["1,a", "2,b", "3", "4,d", "5,e"]);

    let result = harness
        .loader()
        .load(
            &descriptor(),
            file.path(),
            "people",
            &options(2).with_failure_policy(FailurePolicy::BestEffort),
        )
        .await
        .unwrap();

    assert_eq!(result.total_rows_committed, 3);
    assert_eq!(result.chunks_failed, 1);
    let failure = &result.failures[0];
    assert_eq!(failure.chunk_index, 2);
    assert_eq!(failure.error_kind, "ValidationError");
    assert_eq!(failure.attempts, 0);
    harness.with(|script| assert_eq!(script.committed_ids(), vec!["1", "2", "5"]));
}

#[tokio::test]
async fn test_header_collision_aborts_before_connecting() {
    let harness = Harness::new();
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "Customer Name,customer-name").unwrap();
    writeln!(file, "a,b").unwrap();
    file.flush().unwrap();

    let abort = harness
        .loader()
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert!(matches!(
        abort.error,
        LoadError::Validation(ValidationError::ColumnCollision { .. })
    ));
    harness.with(|script| assert_eq!(script.connects, 0));
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn test_cancelled_before_start() {
    let harness = Harness::new();
    let file = five_rows();
    let token = CancellationToken::new();
    token.cancel();

    let abort = harness
        .loader()
        .with_cancellation(token)
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(abort.error, LoadError::Cancelled);
    assert_eq!(abort.result.total_rows_committed, 0);
    harness.with(|script| assert_eq!(script.connects, 0));
}

#[tokio::test]
async fn test_cancelled_between_chunks_keeps_committed_rows() {
    let harness = Harness::new();
    let token = CancellationToken::new();
    harness.with(|script| script.cancel_after_commits = Some((1, token.clone())));
    let file = five_rows();

    let abort = harness
        .loader()
        .with_cancellation(token)
        .load(&descriptor(), file.path(), "people", &options(2))
        .await
        .unwrap_err();

    assert_eq!(abort.error.kind(), "Cancelled");
    assert_eq!(abort.result.state, LoadState::Aborted);
    assert_eq!(abort.result.total_rows_committed, 2);
    assert_eq!(abort.result.chunks_attempted, 1);
    harness.with(|script| {
        assert_eq!(script.committed_ids(), vec!["1", "2"]);
        assert_eq!(script.open_sessions, 0);
    });
}
