//! Database capability consumed by the finalizers
//!
//! The coordinator does not ship a PostgreSQL driver. It consumes a
//! connection pool and a deadline-aware local-transaction handle through
//! these traits; adapters over a real pool (or the in-memory mock used by the
//! tests) implement them. The deadline passed to [`PgPool::begin`] is bound
//! to the transaction for its lifetime: when it expires the driver cancels
//! outstanding work and rolls the transaction back server-side, the same
//! contract a context-bound driver transaction gives.

use async_trait::async_trait;
use crosstx_coordinator::Deadline;
use thiserror::Error;

/// Scalar read back from a protocol query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PgValue {
    Int(i64),
    Text(String),
    Null,
}

impl PgValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            PgValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Errors surfaced by the pool and transaction capabilities.
#[derive(Debug, Error)]
pub enum PgError {
    /// The deadline bound to the work expired or the caller was cancelled.
    /// The driver has already abandoned the statement and rolled the
    /// transaction back server-side.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The transaction handle was already committed or rolled back.
    #[error("transaction has already been finished")]
    Closed,

    /// The server rejected the statement.
    #[error("database error: {0}")]
    Database(String),
}

impl PgError {
    /// True when the error reports deadline expiry or cancellation.
    pub fn is_deadline(&self) -> bool {
        matches!(self, PgError::DeadlineExceeded)
    }
}

pub type PgResult<T> = std::result::Result<T, PgError>;

/// Connection pool handle.
///
/// `execute` runs a statement on a fresh pooled connection, outside any
/// transaction the pool has handed out; the two-phase finalizer resolves
/// prepared transactions through it.
#[async_trait]
pub trait PgPool: Clone + Send + Sync + 'static {
    type Tx: PgTx;

    /// Begin a local transaction with `deadline` bound to it.
    async fn begin(&self, deadline: Deadline) -> PgResult<Self::Tx>;

    /// Execute a statement on a pooled connection.
    async fn execute(&self, sql: &str, deadline: Deadline) -> PgResult<u64>;
}

/// An in-progress database-local transaction.
///
/// After `commit` or `rollback` returns the handle is finished; further
/// operations report [`PgError::Closed`].
#[async_trait]
pub trait PgTx: Send {
    /// Execute a statement inside the transaction.
    async fn execute(&mut self, sql: &str) -> PgResult<u64>;

    /// Run a single-row, single-column query inside the transaction.
    async fn query_row(&mut self, sql: &str, params: &[PgValue]) -> PgResult<PgValue>;

    /// Commit the local transaction.
    async fn commit(&mut self) -> PgResult<()>;

    /// Roll the local transaction back.
    async fn rollback(&mut self) -> PgResult<()>;
}
