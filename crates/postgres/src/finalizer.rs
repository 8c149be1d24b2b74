//! Tagged variant over the two finalizer behaviors
//!
//! A manager drives participants through the [`Finalizer`] capability set and
//! never needs to know which behavior it is talking to. [`PgFinalizer`] packs
//! both behind one type so a caller can choose the strategy at runtime (or
//! even mix strategies in one manager, at the cost of the weaker variant's
//! guarantee).

use crate::common::DeferredAction;
use crate::pool::PgPool;
use crate::single_phase::SinglePhase;
use crate::two_phase::TwoPhase;
use async_trait::async_trait;
use crosstx_coordinator::{Deadline, Finalizer, FinalizerState, Result, TxIdentity};
use std::fmt;

/// A PostgreSQL participant, either single-phase or two-phase.
pub enum PgFinalizer<P: PgPool> {
    SinglePhase(SinglePhase<P>),
    TwoPhase(TwoPhase<P>),
}

impl<P: PgPool> PgFinalizer<P> {
    /// Begin a single-phase participant: best-effort multi-database
    /// atomicity, no prepared-transaction residue.
    pub async fn single_phase(pool: P, label: &str, deadline: Deadline) -> Result<Self> {
        Ok(Self::SinglePhase(SinglePhase::begin(pool, label, deadline).await?))
    }

    /// Begin a two-phase participant: all-or-nothing across databases once
    /// every participant finalizes, at the cost of possible prepared
    /// transactions to clean up after a crash.
    pub async fn two_phase(pool: P, label: &str, deadline: Deadline) -> Result<Self> {
        Ok(Self::TwoPhase(TwoPhase::begin(pool, label, deadline).await?))
    }

    /// Borrow the local transaction handle.
    ///
    /// # Panics
    ///
    /// Panics once the handle has been released; see the variants' `tx`.
    pub fn tx(&mut self) -> &mut P::Tx {
        match self {
            PgFinalizer::SinglePhase(f) => f.tx(),
            PgFinalizer::TwoPhase(f) => f.tx(),
        }
    }

    /// Register an action to run at finalize time.
    pub fn defer(&mut self, action: DeferredAction) {
        match self {
            PgFinalizer::SinglePhase(f) => f.defer(action),
            PgFinalizer::TwoPhase(f) => f.defer(action),
        }
    }

    /// Toggle per-participant trace output.
    pub fn set_trace(&mut self, enabled: bool) {
        match self {
            PgFinalizer::SinglePhase(f) => f.set_trace(enabled),
            PgFinalizer::TwoPhase(f) => f.set_trace(enabled),
        }
    }

    /// Identity captured at construction.
    pub fn identity(&self) -> &TxIdentity {
        match self {
            PgFinalizer::SinglePhase(f) => f.identity(),
            PgFinalizer::TwoPhase(f) => f.identity(),
        }
    }

    /// Emit a fixed-format trace line when tracing is enabled.
    pub fn trace(&self, message: fmt::Arguments<'_>) {
        match self {
            PgFinalizer::SinglePhase(f) => f.trace(message),
            PgFinalizer::TwoPhase(f) => f.trace(message),
        }
    }
}

#[async_trait]
impl<P: PgPool> Finalizer for PgFinalizer<P> {
    fn state(&self) -> FinalizerState {
        match self {
            PgFinalizer::SinglePhase(f) => f.state(),
            PgFinalizer::TwoPhase(f) => f.state(),
        }
    }

    async fn finalize(&mut self) -> Result<()> {
        match self {
            PgFinalizer::SinglePhase(f) => f.finalize().await,
            PgFinalizer::TwoPhase(f) => f.finalize().await,
        }
    }

    async fn commit(&mut self) -> Result<()> {
        match self {
            PgFinalizer::SinglePhase(f) => f.commit().await,
            PgFinalizer::TwoPhase(f) => f.commit().await,
        }
    }

    async fn abort(&mut self) {
        match self {
            PgFinalizer::SinglePhase(f) => f.abort().await,
            PgFinalizer::TwoPhase(f) => f.abort().await,
        }
    }
}
