//! Two-phase finalizer
//!
//! Finalize issues `PREPARE TRANSACTION` with a fresh UUID name, after which
//! PostgreSQL owns the staged changes and the local handle is released.
//! Commit and rollback of the prepared transaction go through the pool on a
//! fresh connection. Once every participant in a transaction has finalized,
//! the changes are durably staged on every server; a crash between commits
//! leaves prepared transactions an operator can resolve with
//! `COMMIT PREPARED` / `ROLLBACK PREPARED` by hand.

use crate::common::{DeferredAction, FinalizerCore};
use crate::pool::{PgError, PgPool, PgTx};
use async_trait::async_trait;
use crosstx_coordinator::{Deadline, Finalizer, FinalizerState, Result, TxIdentity};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Cleanup of a prepared transaction must survive a caller whose deadline is
/// already gone, so `ROLLBACK PREPARED` runs under its own bounded deadline.
const ROLLBACK_PREPARED_TIMEOUT: Duration = Duration::from_secs(3);

/// Participant that stages its transaction with `PREPARE TRANSACTION` and
/// resolves it in a second step.
pub struct TwoPhase<P: PgPool> {
    core: FinalizerCore<P>,
    /// Set once `COMMIT PREPARED` has been attempted. From then on the
    /// outcome is only knowable server-side, so abort must leave the
    /// prepared transaction for an operator instead of rolling it back.
    in_doubt: bool,
}

impl<P: PgPool> TwoPhase<P> {
    /// Begin a local transaction on `pool` and capture the server ids.
    /// Construction failure means no participant exists.
    pub async fn begin(pool: P, label: &str, deadline: Deadline) -> Result<Self> {
        let core = FinalizerCore::open(pool, label, deadline).await?;
        Ok(Self {
            core,
            in_doubt: false,
        })
    }

    /// Borrow the local transaction handle for reads and writes.
    ///
    /// # Panics
    ///
    /// Panics once the transaction has been prepared or rolled back; after
    /// `PREPARE TRANSACTION` the server owns the changes and all further
    /// work goes through the pool under the prepared name.
    pub fn tx(&mut self) -> &mut P::Tx {
        self.core.tx()
    }

    /// Register an action to run at finalize time, before the prepare.
    pub fn defer(&mut self, action: DeferredAction) {
        self.core.trace(format_args!("Defer()"));
        self.core.deferred.push(action);
    }

    /// Toggle per-participant trace output.
    pub fn set_trace(&mut self, enabled: bool) {
        self.core.trace_enabled = enabled;
    }

    /// Identity captured at construction; `prepared_id` is filled in once
    /// finalize succeeds.
    pub fn identity(&self) -> &TxIdentity {
        &self.core.identity
    }

    /// Emit a fixed-format trace line when tracing is enabled.
    pub fn trace(&self, message: fmt::Arguments<'_>) {
        self.core.trace(message);
    }

    /// Name of the prepared transaction, once one exists.
    pub fn prepared_id(&self) -> Option<Uuid> {
        self.core.identity.prepared_id
    }
}

#[async_trait]
impl<P: PgPool> Finalizer for TwoPhase<P> {
    fn state(&self) -> FinalizerState {
        self.core.state
    }

    /// Run deferred actions, then stage the transaction under a fresh UUID
    /// with `PREPARE TRANSACTION`. On success the local handle is released
    /// and the participant is `Finalized`.
    async fn finalize(&mut self) -> Result<()> {
        if self.core.state != FinalizerState::Active {
            return Err(self.core.protocol_error(format!(
                "finalize on a transaction that is {:?}",
                self.core.state
            )));
        }
        self.core.run_deferred()?;

        // The server may have aborted the transaction behind the client;
        // check before staging it.
        let status = match self.core.txid_status().await {
            Ok(status) => status,
            Err(err) => return Err(self.core.database_error("reading txid_status", err)),
        };
        self.core
            .trace(format_args!("transaction status at finalize '{status}'"));
        if status != "in progress" {
            return Err(self.core.protocol_error(format!(
                "prepare on non-committable transaction (txid_status '{status}')"
            )));
        }

        let prepared_id = Uuid::new_v4();
        self.core.identity.prepared_id = Some(prepared_id);
        self.core.trace(format_args!("created prepared-transaction id"));

        let sql = format!("PREPARE TRANSACTION '{prepared_id}'");
        if let Err(err) = self.core.tx().execute(&sql).await {
            self.core.identity.prepared_id = None;
            return Err(self.core.database_error("executing PREPARE TRANSACTION", err));
        }

        // PostgreSQL now owns the staged changes under the prepared name;
        // the local handle must not be reused.
        self.core.tx = None;
        self.core.state = FinalizerState::Finalized;
        self.core.trace(format_args!("transaction prepared"));
        Ok(())
    }

    /// Resolve the prepared transaction with `COMMIT PREPARED` on a pooled
    /// connection. Cancellation is surfaced as the deadline error, never
    /// masked behind a database error.
    async fn commit(&mut self) -> Result<()> {
        if self.core.state.is_terminal() {
            return Err(self.core.protocol_error(format!(
                "commit on a transaction that is {:?}",
                self.core.state
            )));
        }
        let Some(prepared_id) = self.core.identity.prepared_id else {
            return Err(self.core.protocol_error("commit on non-finalized transaction"));
        };

        let sql = format!("COMMIT PREPARED '{prepared_id}'");
        self.in_doubt = true;
        let deadline = self.core.deadline;
        match deadline.bound(self.core.pool.execute(&sql, deadline)).await {
            Err(cancelled) => return Err(cancelled),
            Ok(Err(err)) => {
                self.core.trace(format_args!("COMMIT PREPARED error: {err}"));
                if err.is_deadline() {
                    return Err(crosstx_coordinator::TxError::DeadlineExceeded);
                }
                return Err(self.core.database_error("failed to commit prepared", err));
            }
            Ok(Ok(_)) => {}
        }
        self.core.state = FinalizerState::Committed;
        self.core.trace(format_args!("transaction committed"));
        Ok(())
    }

    /// Release whatever this participant still holds:
    ///
    /// - still active: roll back the local transaction ("already finished"
    ///   from the driver is not an error);
    /// - prepared, commit never attempted: `ROLLBACK PREPARED` on the pool
    ///   under an independent deadline, so a cancelled caller still releases
    ///   the server-side prepared transaction;
    /// - prepared, commit attempted and failed: the outcome is in doubt and
    ///   the prepared transaction is left for operator resolution;
    /// - terminal or never finalized: nothing to do.
    ///
    /// A non-cancellation `ROLLBACK PREPARED` failure means the coordinator
    /// has lost the ability to clean up after itself and is fatal.
    async fn abort(&mut self) {
        if self.core.state.is_terminal() {
            self.core.trace(format_args!(
                "abort on a transaction that is {:?}",
                self.core.state
            ));
            return;
        }

        if self.core.tx.is_some() {
            self.core.trace(format_args!("abort rolling back local transaction"));
            if let Err(err) = self.core.tx().rollback().await {
                match err {
                    PgError::Closed => {
                        self.core.trace(format_args!("abort on a failed transaction"));
                    }
                    PgError::DeadlineExceeded => {
                        self.core.trace(format_args!(
                            "rollback cancelled, driver already rolled back"
                        ));
                    }
                    err => self.core.fatal("failed to roll back", &err),
                }
            }
            self.core.tx = None;
            self.core.state = FinalizerState::Aborted;
            return;
        }

        let Some(prepared_id) = self.core.identity.prepared_id else {
            self.core
                .trace(format_args!("abort on a transaction that never finalized"));
            self.core.state = FinalizerState::Aborted;
            return;
        };

        if self.in_doubt {
            // A COMMIT PREPARED was already attempted; the server may have
            // applied it. Rolling back here could undo a commit that landed,
            // so the prepared transaction is left for operator resolution.
            tracing::warn!(
                label = %self.core.identity.label,
                "{} message: commit outcome in doubt, leaving prepared transaction for the operator",
                self.core.identity
            );
            self.core.state = FinalizerState::Aborted;
            return;
        }

        let sql = format!("ROLLBACK PREPARED '{prepared_id}'");
        let deadline = Deadline::after(ROLLBACK_PREPARED_TIMEOUT);
        match deadline.bound(self.core.pool.execute(&sql, deadline)).await {
            Err(_) | Ok(Err(PgError::DeadlineExceeded)) => {
                // The prepared transaction is still on the server; an
                // operator has to resolve it. Loud, but not a panic: the
                // cleanup attempt itself was cancelled, not rejected.
                tracing::error!(
                    label = %self.core.identity.label,
                    "{} message: ROLLBACK PREPARED timed out, prepared transaction left on server",
                    self.core.identity
                );
                self.core.state = FinalizerState::Aborted;
                return;
            }
            Ok(Err(err)) => self.core.fatal("failed ROLLBACK PREPARED", &err),
            Ok(Ok(_)) => {}
        }
        self.core.trace(format_args!("ROLLBACK PREPARED"));
        self.core.identity.prepared_id = None;
        self.core.state = FinalizerState::Aborted;
    }
}
