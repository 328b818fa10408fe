//! Database connection lifecycle and scoped transactions
//!
//! [`ConnectionManager::open`] turns a [`ConnectionDescriptor`] into a
//! [`ConnectionHandle`]. The handle exclusively owns one database session
//! and exposes it only through [`ConnectionHandle::with_transaction`], which
//! begins a transaction, runs a body against the session, and commits on
//! success or rolls back on any failure.
//!
//! The [`Session`] and [`Connector`] traits are the seam between the load
//! pipeline and a concrete driver; [`postgres`] provides the sqlx-backed
//! implementation.

pub mod postgres;

pub use postgres::{classify_sqlstate, classify_sqlx_error, PgConnector, PgSession};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use tabload_common::{DatabaseError, DatabaseErrorKind, LoadError};

use crate::normalize::ColumnMapping;
use crate::source::Row;
use crate::table::{TableName, TableTarget};

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_STATEMENT_TIMEOUT_SECS: u64 = 30;

/// TLS negotiation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl std::str::FromStr for SslMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "prefer" => Ok(SslMode::Prefer),
            "require" => Ok(SslMode::Require),
            other => Err(format!("invalid ssl_mode '{}'", other)),
        }
    }
}

/// Resolved connection settings
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub connect_timeout_secs: u64,
    pub statement_timeout_secs: u64,
    pub ssl_mode: SslMode,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_secs", &self.statement_timeout_secs)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

impl ConnectionDescriptor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            statement_timeout_secs: DEFAULT_STATEMENT_TIMEOUT_SECS,
            ssl_mode: SslMode::default(),
        }
    }

    pub fn with_connect_timeout_secs(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    pub fn with_statement_timeout_secs(mut self, secs: u64) -> Self {
        self.statement_timeout_secs = secs;
        self
    }

    pub fn with_ssl_mode(mut self, ssl_mode: SslMode) -> Self {
        self.ssl_mode = ssl_mode;
        self
    }

    /// Reject missing or malformed fields before any network activity
    pub fn validate(&self) -> Result<(), LoadError> {
        let required = [
            ("host", &self.host),
            ("database", &self.database),
            ("username", &self.username),
            ("password", &self.password),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(LoadError::configuration(format!(
                    "connection field '{}' is missing or empty",
                    field
                )));
            }
        }
        if self.port == 0 {
            return Err(LoadError::configuration("connection port must be non-zero"));
        }
        if self.connect_timeout_secs == 0 || self.statement_timeout_secs == 0 {
            return Err(LoadError::configuration("timeouts must be at least one second"));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }
}

/// One live database session
///
/// At most one transaction is open at a time. `rollback` without an open
/// transaction is a no-op.
#[async_trait]
pub trait Session: Send {
    async fn begin(&mut self) -> Result<(), DatabaseError>;

    async fn commit(&mut self) -> Result<(), DatabaseError>;

    async fn rollback(&mut self) -> Result<(), DatabaseError>;

    /// Ensure the target table exists and resolve its columns
    async fn prepare_table(
        &mut self,
        table: &TableName,
        mapping: &ColumnMapping,
        create_if_missing: bool,
    ) -> Result<TableTarget, DatabaseError>;

    /// Insert `rows` inside the open transaction; returns rows written
    async fn insert_rows(
        &mut self,
        target: &TableTarget,
        rows: &[Row],
    ) -> Result<u64, DatabaseError>;

    async fn close(&mut self) -> Result<(), DatabaseError>;
}

/// Opens sessions for a descriptor
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Self::Session, DatabaseError>;
}

/// Opens [`ConnectionHandle`]s through a [`Connector`]
pub struct ConnectionManager<C> {
    connector: C,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Validate `descriptor` and complete the handshake
    ///
    /// Fails with a configuration error before any connection attempt when
    /// the descriptor is incomplete, and with a database error when the
    /// handshake fails or exceeds the connect timeout.
    pub async fn open(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle<C::Session>, LoadError> {
        descriptor.validate()?;

        debug!(
            host = %descriptor.host,
            port = descriptor.port,
            database = %descriptor.database,
            "Opening database connection"
        );

        let connect = self.connector.connect(descriptor);
        let session = match tokio::time::timeout(descriptor.connect_timeout(), connect).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(DatabaseError::new(
                    DatabaseErrorKind::ConnectionFailed,
                    format!(
                        "handshake with {}:{} timed out after {}s",
                        descriptor.host, descriptor.port, descriptor.connect_timeout_secs
                    ),
                )
                .into())
            }
        };

        Ok(ConnectionHandle::new(session, descriptor.statement_timeout()))
    }
}

/// Exclusive owner of one live session
pub struct ConnectionHandle<S: Session> {
    session: Option<S>,
    in_transaction: bool,
    statement_timeout: Duration,
}

impl<S: Session> ConnectionHandle<S> {
    pub fn new(session: S, statement_timeout: Duration) -> Self {
        Self {
            session: Some(session),
            in_transaction: false,
            statement_timeout,
        }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Run `body` inside a transaction
    ///
    /// Commits when `body` returns `Ok`. Rolls back when it returns `Err`,
    /// or when any step exceeds the statement timeout or the commit fails.
    /// A commit that times out or loses its connection is reported as
    /// [`DatabaseErrorKind::CommitUnknown`], never as a transient failure.
    /// If a previous call was dropped mid-transaction, that transaction is
    /// rolled back first.
    pub async fn with_transaction<T, F>(&mut self, body: F) -> Result<T, DatabaseError>
    where
        T: Send,
        F: for<'s> FnOnce(&'s mut S) -> BoxFuture<'s, Result<T, DatabaseError>> + Send,
    {
        self.recover_abandoned().await;

        let limit = self.statement_timeout;
        let session = self.session.as_mut().ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::ConnectionLost, "connection handle is closed")
        })?;

        self.in_transaction = true;
        if let Err(e) = bounded(limit, "begin", session.begin()).await {
            rollback_quietly(session, limit).await;
            self.in_transaction = false;
            return Err(e);
        }

        let result = match bounded(limit, "transaction", body(&mut *session)).await {
            Ok(value) => match bounded(limit, "commit", session.commit()).await {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback_quietly(session, limit).await;
                    Err(unacknowledged_commit(e))
                }
            },
            Err(e) => {
                rollback_quietly(session, limit).await;
                Err(e)
            }
        };

        self.in_transaction = false;
        result
    }

    /// Release the session; safe to call more than once
    pub async fn close(&mut self) -> Result<(), DatabaseError> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if self.in_transaction {
            rollback_quietly(&mut session, self.statement_timeout).await;
            self.in_transaction = false;
        }
        debug!("Closing database connection");
        bounded(self.statement_timeout, "close", session.close()).await
    }

    async fn recover_abandoned(&mut self) {
        if !self.in_transaction {
            return;
        }
        if let Some(session) = self.session.as_mut() {
            warn!("Rolling back transaction abandoned by a cancelled operation");
            rollback_quietly(session, self.statement_timeout).await;
        }
        self.in_transaction = false;
    }
}

impl<S: Session> Drop for ConnectionHandle<S> {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("Connection handle dropped without close");
        }
    }
}

/// Run one database step under `limit`
async fn bounded<T>(
    limit: Duration,
    step: &str,
    op: impl Future<Output = Result<T, DatabaseError>>,
) -> Result<T, DatabaseError> {
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(DatabaseError::timeout(format!(
            "{} exceeded {}s",
            step,
            limit.as_secs()
        ))),
    }
}

async fn rollback_quietly<S: Session>(session: &mut S, limit: Duration) {
    if let Err(e) = bounded(limit, "rollback", session.rollback()).await {
        warn!(error = %e, "Rollback failed");
    }
}

/// The server may have applied a commit whose acknowledgement was lost, so
/// replaying the same rows could store them twice
fn unacknowledged_commit(err: DatabaseError) -> DatabaseError {
    match err.kind {
        DatabaseErrorKind::ConnectionLost | DatabaseErrorKind::Timeout => DatabaseError::new(
            DatabaseErrorKind::CommitUnknown,
            format!("commit outcome unknown, rows may already be stored: {}", err),
        ),
        _ => err,
    }
}
