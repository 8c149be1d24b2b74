//! Shared participant internals
//!
//! Both finalizer variants begin the same way (open a local transaction,
//! capture the server-side transaction and backend ids inside it) and share
//! the deferred-action registry and the trace/fatal plumbing. The variant
//! modules hold only their protocol behavior.

use crate::pool::{PgError, PgPool, PgTx, PgValue};
use crosstx_coordinator::{BoxError, Deadline, FinalizerState, Result, TxError, TxIdentity};
use std::fmt;

const TXID_CURRENT: &str = "SELECT txid_current()";
const BACKEND_PID: &str = "SELECT pg_backend_pid()";
const TXID_STATUS: &str = "SELECT txid_status($1)";

/// Zero-argument fallible action run at finalize time, before the protocol
/// step, in insertion order.
pub type DeferredAction = Box<dyn FnOnce() -> std::result::Result<(), BoxError> + Send>;

pub(crate) struct FinalizerCore<P: PgPool> {
    pub pool: P,
    pub tx: Option<P::Tx>,
    pub identity: TxIdentity,
    pub deadline: Deadline,
    pub state: FinalizerState,
    pub deferred: Vec<DeferredAction>,
    pub trace_enabled: bool,
}

impl<P: PgPool> FinalizerCore<P> {
    /// Begin the local transaction and capture `txid_current()` and
    /// `pg_backend_pid()` inside it. Any failure is fatal at construction
    /// time: no participant is returned.
    pub async fn open(pool: P, label: &str, deadline: Deadline) -> Result<Self> {
        let construction = |source: BoxError| TxError::Construction {
            label: label.to_string(),
            source,
        };

        let mut tx = pool
            .begin(deadline)
            .await
            .map_err(|e| construction(Box::new(e)))?;
        let server_tx_id = read_id(&mut tx, TXID_CURRENT)
            .await
            .map_err(&construction)?;
        let server_conn_id = read_id(&mut tx, BACKEND_PID).await.map_err(&construction)?;

        Ok(Self {
            pool,
            tx: Some(tx),
            identity: TxIdentity::new(label, server_tx_id, server_conn_id),
            deadline,
            state: FinalizerState::Active,
            deferred: Vec::new(),
            trace_enabled: false,
        })
    }

    /// Borrow the local transaction handle.
    ///
    /// # Panics
    ///
    /// Panics once the handle has been released (committed, rolled back, or
    /// transferred to a prepared transaction); using it then is a programmer
    /// error.
    pub fn tx(&mut self) -> &mut P::Tx {
        match self.tx.as_mut() {
            Some(tx) => tx,
            None => panic!(
                "{} message: local transaction handle is no longer available (state {:?})",
                self.identity, self.state
            ),
        }
    }

    /// Read `txid_status` for this participant's server transaction.
    /// Best-effort: the answer can be stale by the time it is used.
    pub async fn txid_status(&mut self) -> std::result::Result<String, PgError> {
        let server_tx_id = self.identity.server_tx_id;
        let status = self
            .tx()
            .query_row(TXID_STATUS, &[PgValue::Int(server_tx_id)])
            .await?;
        Ok(match status {
            PgValue::Text(s) => s,
            PgValue::Null => "NULL".to_string(),
            PgValue::Int(i) => i.to_string(),
        })
    }

    /// Run the registered deferred actions in insertion order. The first
    /// error stops the sequence and is returned wrapped with identity.
    pub fn run_deferred(&mut self) -> Result<()> {
        for action in std::mem::take(&mut self.deferred) {
            action().map_err(|source| TxError::Deferred {
                identity: self.identity.clone(),
                source,
            })?;
        }
        Ok(())
    }

    pub fn protocol_error(&self, message: impl Into<String>) -> TxError {
        TxError::Protocol {
            identity: self.identity.clone(),
            message: message.into(),
        }
    }

    /// Wrap a driver error with identity. Cancellation is surfaced as the
    /// typed deadline error, never masked behind a database error.
    pub fn database_error(&self, context: &str, source: PgError) -> TxError {
        if source.is_deadline() {
            return TxError::DeadlineExceeded;
        }
        TxError::Database {
            identity: self.identity.clone(),
            context: context.to_string(),
            source: Box::new(source),
        }
    }

    /// Emit a fixed-format trace line when tracing is enabled for this
    /// participant.
    pub fn trace(&self, message: fmt::Arguments<'_>) {
        if !self.trace_enabled {
            return;
        }
        tracing::debug!(
            label = %self.identity.label,
            "{} message: {}",
            self.identity,
            message
        );
    }

    /// Report an unrecoverable cleanup failure with full identity and panic.
    pub fn fatal(&self, context: &str, err: &PgError) -> ! {
        tracing::error!(
            label = %self.identity.label,
            "{} message: {}: {}",
            self.identity,
            context,
            err
        );
        panic!("{} message: {}: {}", self.identity, context, err);
    }
}

async fn read_id<T: PgTx>(tx: &mut T, sql: &str) -> std::result::Result<i64, BoxError> {
    let value = tx
        .query_row(sql, &[])
        .await
        .map_err(|e| Box::new(e) as BoxError)?;
    value
        .as_int()
        .ok_or_else(|| format!("{sql} returned a non-integer value: {value:?}").into())
}
