//! Error types for cross-database transaction coordination
//!
//! Every error raised by a participant after construction carries a
//! [`TxIdentity`] so that operators can correlate a client-side failure with
//! the server-side transaction it belongs to. The identity rendering is a
//! fixed format; log scrapers depend on it.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Boxed error produced by caller-supplied deferred actions and by the
/// database driver capability.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Identity of a participant as the PostgreSQL server sees it.
///
/// `server_tx_id` and `server_conn_id` are `txid_current()` and
/// `pg_backend_pid()` read inside the freshly-begun local transaction;
/// `prepared_id` is set once a two-phase prepare succeeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIdentity {
    /// Caller-supplied participant label.
    pub label: String,
    /// `txid_current()` captured at construction.
    pub server_tx_id: i64,
    /// `pg_backend_pid()` captured at construction.
    pub server_conn_id: i64,
    /// Name of the prepared transaction, once one exists.
    pub prepared_id: Option<Uuid>,
}

impl TxIdentity {
    /// Create an identity for a participant that has not prepared yet.
    pub fn new(label: impl Into<String>, server_tx_id: i64, server_conn_id: i64) -> Self {
        Self {
            label: label.into(),
            server_tx_id,
            server_conn_id,
            prepared_id: None,
        }
    }

    /// The prepared-transaction name rendered the way it appears in SQL,
    /// empty when the participant never prepared.
    pub fn prepared_str(&self) -> String {
        self.prepared_id.map(|id| id.to_string()).unwrap_or_default()
    }
}

impl fmt::Display for TxIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TX: {} PGTXID: {} PGPID: {}",
            self.prepared_str(),
            self.server_tx_id,
            self.server_conn_id
        )
    }
}

/// Errors raised while driving participants through commit or abort.
#[derive(Debug, Error)]
pub enum TxError {
    /// The local transaction could not be begun or its server ids could not
    /// be read. No participant exists after this.
    #[error("participant '{label}' failed to open its local transaction: {source}")]
    Construction {
        label: String,
        #[source]
        source: BoxError,
    },

    /// A caller-registered deferred action failed during finalize.
    #[error("{identity} message: running deferred actions: {source}")]
    Deferred {
        identity: TxIdentity,
        #[source]
        source: BoxError,
    },

    /// The requested transition is not legal for the participant's current
    /// state (commit without finalize, double commit, commit on a
    /// transaction the server no longer reports as in progress).
    #[error("{identity} message: {message}")]
    Protocol {
        identity: TxIdentity,
        message: String,
    },

    /// The database rejected a protocol statement.
    #[error("{identity} message: {context}: {source}")]
    Database {
        identity: TxIdentity,
        context: String,
        #[source]
        source: BoxError,
    },

    /// The caller's deadline expired or its work was cancelled. Never masked
    /// behind a database error.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The manager was driven in a state that does not accept the operation.
    #[error("invalid manager state: {0}")]
    InvalidState(String),

    /// A participant failure wrapped with the label it was registered under.
    #[error("participant '{label}': {source}")]
    Participant {
        label: String,
        #[source]
        source: Box<TxError>,
    },
}

impl TxError {
    /// True when the root cause is the caller's deadline or cancellation.
    /// Useful for automated retry decisions.
    pub fn is_deadline(&self) -> bool {
        match self {
            TxError::DeadlineExceeded => true,
            TxError::Participant { source, .. } => source.is_deadline(),
            _ => false,
        }
    }

    /// The identity of the participant that raised the error, when one
    /// existed at the time of failure.
    pub fn identity(&self) -> Option<&TxIdentity> {
        match self {
            TxError::Deferred { identity, .. }
            | TxError::Protocol { identity, .. }
            | TxError::Database { identity, .. } => Some(identity),
            TxError::Participant { source, .. } => source.identity(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, TxError>;
