//! PostgreSQL session backed by sqlx
//!
//! The session is a single-connection pool plus at most one open
//! transaction. When the connection drops, the pool opens a fresh one on
//! the next `begin`, which is what lets the loader retry a chunk after a
//! lost connection.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::{debug, info};

use tabload_common::{DatabaseError, DatabaseErrorKind};

use super::{ConnectionDescriptor, Connector, Session, SslMode};
use crate::normalize::ColumnMapping;
use crate::source::Row;
use crate::table::{TableName, TableTarget};

/// PostgreSQL caps bind parameters per statement at 65535
const MAX_BIND_PARAMS: usize = 65_535;

const TABLE_EXISTS_SQL: &str = "SELECT to_regclass($1) IS NOT NULL";

/// Types come without modifiers: an explicit cast to `varchar(n)` silently
/// truncates, while assigning to the column raises 22001
const TABLE_COLUMNS_SQL: &str = r#"
    SELECT a.attname::text, format_type(a.atttypid, NULL)
    FROM pg_attribute a
    WHERE a.attrelid = to_regclass($1)::oid
      AND a.attnum > 0
      AND NOT a.attisdropped
    ORDER BY a.attnum
"#;

/// Opens [`PgSession`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

impl PgConnector {
    pub fn connect_options(descriptor: &ConnectionDescriptor) -> PgConnectOptions {
        let ssl_mode = match descriptor.ssl_mode {
            SslMode::Disable => PgSslMode::Disable,
            SslMode::Prefer => PgSslMode::Prefer,
            SslMode::Require => PgSslMode::Require,
        };

        PgConnectOptions::new()
            .host(&descriptor.host)
            .port(descriptor.port)
            .database(&descriptor.database)
            .username(&descriptor.username)
            .password(&descriptor.password)
            .ssl_mode(ssl_mode)
            .application_name("tabload")
            .options([(
                "statement_timeout",
                format!("{}s", descriptor.statement_timeout_secs),
            )])
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Session = PgSession;

    async fn connect(&self, descriptor: &ConnectionDescriptor) -> Result<PgSession, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(descriptor.connect_timeout())
            .connect_with(Self::connect_options(descriptor))
            .await
            .map_err(|e| classify_connect_error(&e))?;

        // Handshake check
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| classify_connect_error(&e))?;

        info!(
            host = %descriptor.host,
            port = descriptor.port,
            database = %descriptor.database,
            "Connected to PostgreSQL"
        );

        Ok(PgSession { pool, tx: None })
    }
}

/// Live PostgreSQL session
pub struct PgSession {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn transaction(&mut self) -> Result<&mut Transaction<'static, Postgres>, DatabaseError> {
        self.tx
            .as_mut()
            .ok_or_else(|| DatabaseError::new(DatabaseErrorKind::Other, "no open transaction"))
    }
}

#[async_trait]
impl Session for PgSession {
    async fn begin(&mut self) -> Result<(), DatabaseError> {
        if self.tx.is_some() {
            return Err(DatabaseError::new(
                DatabaseErrorKind::Other,
                "transaction already open",
            ));
        }
        let tx = self.pool.begin().await.map_err(|e| classify_sqlx_error(&e))?;
        self.tx = Some(tx);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DatabaseError> {
        match self.tx.take() {
            Some(tx) => tx.commit().await.map_err(|e| classify_sqlx_error(&e)),
            None => Err(DatabaseError::new(
                DatabaseErrorKind::Other,
                "no open transaction",
            )),
        }
    }

    async fn rollback(&mut self) -> Result<(), DatabaseError> {
        match self.tx.take() {
            Some(tx) => tx.rollback().await.map_err(|e| classify_sqlx_error(&e)),
            None => Ok(()),
        }
    }

    async fn prepare_table(
        &mut self,
        table: &TableName,
        mapping: &ColumnMapping,
        create_if_missing: bool,
    ) -> Result<TableTarget, DatabaseError> {
        let regclass = table.quoted();
        let tx = self.transaction()?;

        let exists: bool = sqlx::query_scalar(TABLE_EXISTS_SQL)
            .bind(&regclass)
            .fetch_one(&mut **tx)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

        if !exists {
            if !create_if_missing {
                return Err(DatabaseError::schema_mismatch(format!(
                    "table {} does not exist",
                    table
                )));
            }
            let target = TableTarget::from_mapping(table.clone(), mapping);
            sqlx::query(&target.create_table_sql())
                .execute(&mut **tx)
                .await
                .map_err(|e| classify_sqlx_error(&e))?;
            info!(table = %table, columns = mapping.len(), "Created target table");
        }

        let catalog: Vec<(String, String)> = sqlx::query_as(TABLE_COLUMNS_SQL)
            .bind(&regclass)
            .fetch_all(&mut **tx)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;

        debug!(table = %table, columns = catalog.len(), "Read target table columns");
        TableTarget::resolve(table.clone(), mapping, &catalog)
    }

    async fn insert_rows(
        &mut self,
        target: &TableTarget,
        rows: &[Row],
    ) -> Result<u64, DatabaseError> {
        if rows.is_empty() || target.columns.is_empty() {
            return Ok(0);
        }

        let rows_per_statement = (MAX_BIND_PARAMS / target.columns.len()).max(1);
        let prefix = target.insert_prefix();
        let tx = self.transaction()?;
        let mut inserted = 0;

        for batch in rows.chunks(rows_per_statement) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(&prefix);
            builder.push_values(batch, |mut values, row| {
                for (i, column) in target.columns.iter().enumerate() {
                    // Bound as text; the server converts to the column type
                    let value: Option<String> = row.get(i).cloned().flatten();
                    values
                        .push_bind(value)
                        .push_unseparated(format!("::{}", column.sql_type));
                }
            });

            let result = builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|e| classify_sqlx_error(&e))?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }

    async fn close(&mut self) -> Result<(), DatabaseError> {
        let rollback = self.rollback().await;
        self.pool.close().await;
        rollback
    }
}

/// Classify a failure seen while establishing the connection
///
/// Anything that prevents the handshake is reported as `ConnectionFailed`
/// so it is never retried as a transient chunk failure.
fn classify_connect_error(err: &sqlx::Error) -> DatabaseError {
    let mut classified = classify_sqlx_error(err);
    if matches!(
        classified.kind,
        DatabaseErrorKind::Timeout | DatabaseErrorKind::ConnectionLost | DatabaseErrorKind::Other
    ) {
        classified.kind = DatabaseErrorKind::ConnectionFailed;
    }
    classified
}

/// Map a sqlx error onto the database error taxonomy
pub fn classify_sqlx_error(err: &sqlx::Error) -> DatabaseError {
    let kind = match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(DatabaseErrorKind::Other),
        sqlx::Error::PoolTimedOut => DatabaseErrorKind::Timeout,
        sqlx::Error::Io(_)
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Protocol(_) => DatabaseErrorKind::ConnectionLost,
        sqlx::Error::Tls(_) | sqlx::Error::Configuration(_) => DatabaseErrorKind::ConnectionFailed,
        sqlx::Error::ColumnNotFound(_) => DatabaseErrorKind::SchemaMismatch,
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::TypeNotFound { .. } => DatabaseErrorKind::DataType,
        _ => DatabaseErrorKind::Other,
    };
    DatabaseError::new(kind, err.to_string())
}

/// Map a PostgreSQL SQLSTATE code onto the database error taxonomy
pub fn classify_sqlstate(code: &str) -> DatabaseErrorKind {
    match code {
        "40P01" | "40001" => DatabaseErrorKind::Deadlock,
        "57014" | "55P03" => DatabaseErrorKind::Timeout,
        "57P01" | "57P02" | "57P03" => DatabaseErrorKind::ConnectionLost,
        "42501" => DatabaseErrorKind::Authentication,
        "3D000" | "53300" => DatabaseErrorKind::ConnectionFailed,
        _ => match code.get(..2) {
            Some("08") => DatabaseErrorKind::ConnectionLost,
            Some("23") => DatabaseErrorKind::ConstraintViolation,
            Some("22") => DatabaseErrorKind::DataType,
            Some("42") => DatabaseErrorKind::SchemaMismatch,
            Some("28") => DatabaseErrorKind::Authentication,
            _ => DatabaseErrorKind::Other,
        },
    }
}
