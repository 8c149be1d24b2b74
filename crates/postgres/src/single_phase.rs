//! Single-phase finalizer
//!
//! Commits the local transaction directly when the manager asks. Across
//! multiple participants this gives best-effort atomicity only: the manager
//! orders commits sequentially, and a participant that fails after earlier
//! ones committed cannot reverse them. Use the two-phase finalizer when the
//! databases must move together.

use crate::common::{DeferredAction, FinalizerCore};
use crate::pool::{PgError, PgPool, PgTx};
use async_trait::async_trait;
use crosstx_coordinator::{Deadline, Finalizer, FinalizerState, Result, TxIdentity};
use std::fmt;

/// Participant that commits its local transaction in one step.
pub struct SinglePhase<P: PgPool> {
    core: FinalizerCore<P>,
}

impl<P: PgPool> SinglePhase<P> {
    /// Begin a local transaction on `pool` and capture the server ids for
    /// diagnostics. Construction failure means no participant exists.
    pub async fn begin(pool: P, label: &str, deadline: Deadline) -> Result<Self> {
        let core = FinalizerCore::open(pool, label, deadline).await?;
        Ok(Self { core })
    }

    /// Borrow the local transaction handle for reads and writes.
    ///
    /// # Panics
    ///
    /// Panics once the transaction has been committed or rolled back.
    pub fn tx(&mut self) -> &mut P::Tx {
        self.core.tx()
    }

    /// Register an action to run at finalize time.
    pub fn defer(&mut self, action: DeferredAction) {
        self.core.trace(format_args!("Defer()"));
        self.core.deferred.push(action);
    }

    /// Toggle per-participant trace output.
    pub fn set_trace(&mut self, enabled: bool) {
        self.core.trace_enabled = enabled;
    }

    /// Identity captured at construction.
    pub fn identity(&self) -> &TxIdentity {
        &self.core.identity
    }

    /// Emit a fixed-format trace line when tracing is enabled.
    pub fn trace(&self, message: fmt::Arguments<'_>) {
        self.core.trace(message);
    }
}

#[async_trait]
impl<P: PgPool> Finalizer for SinglePhase<P> {
    fn state(&self) -> FinalizerState {
        self.core.state
    }

    /// Run deferred actions; otherwise a no-op in single-phase mode.
    async fn finalize(&mut self) -> Result<()> {
        if self.core.state != FinalizerState::Active {
            return Err(self.core.protocol_error(format!(
                "finalize on a transaction that is {:?}",
                self.core.state
            )));
        }
        self.core.run_deferred()
    }

    /// Commit the local transaction, gated on the server still reporting it
    /// in progress. The gate is a best-effort diagnostic; the driver commit
    /// error stays authoritative.
    async fn commit(&mut self) -> Result<()> {
        if self.core.state != FinalizerState::Active {
            return Err(self.core.protocol_error(format!(
                "commit on a transaction that is {:?}",
                self.core.state
            )));
        }

        let status = match self.core.txid_status().await {
            Ok(status) => status,
            Err(err) => return Err(self.core.database_error("reading txid_status", err)),
        };
        self.core
            .trace(format_args!("transaction status at commit '{status}'"));
        if status != "in progress" {
            return Err(self.core.protocol_error(format!(
                "commit on non-committable transaction (txid_status '{status}')"
            )));
        }

        if let Err(err) = self.core.tx().commit().await {
            return Err(self.core.database_error("failed to commit", err));
        }
        self.core.tx = None;
        self.core.state = FinalizerState::Committed;
        self.core.trace(format_args!("transaction committed"));
        Ok(())
    }

    /// Roll the local transaction back if the server still reports it in
    /// progress. A rollback failure caused by the caller's deadline is
    /// suppressed: the driver has already rolled the transaction back.
    async fn abort(&mut self) {
        if self.core.state.is_terminal() {
            self.core.trace(format_args!(
                "abort on a transaction that is {:?}",
                self.core.state
            ));
            return;
        }

        let status = match self.core.txid_status().await {
            Ok(status) => status,
            Err(err) => {
                // The status read itself failing means the transaction is
                // already gone client-side or server-side; nothing to roll
                // back.
                self.core
                    .trace(format_args!("abort skipped, txid_status failed: {err}"));
                self.core.tx = None;
                self.core.state = FinalizerState::Aborted;
                return;
            }
        };
        self.core
            .trace(format_args!("transaction status at abort '{status}'"));

        if status == "in progress" {
            if let Err(err) = self.core.tx().rollback().await {
                match err {
                    PgError::Closed => {
                        self.core.trace(format_args!("abort on a finished transaction"));
                    }
                    PgError::DeadlineExceeded => {
                        self.core.trace(format_args!(
                            "rollback cancelled, driver already rolled back"
                        ));
                    }
                    err if self.core.deadline.expired() => {
                        self.core.trace(format_args!(
                            "rollback failed after deadline expiry, driver already rolled back: {err}"
                        ));
                    }
                    err => self.core.fatal("failed to roll back", &err),
                }
            }
        }
        self.core.tx = None;
        self.core.state = FinalizerState::Aborted;
    }
}
