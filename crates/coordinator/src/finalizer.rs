//! The capability set a participant exposes to the manager
//!
//! A finalizer wraps one database-local transaction. Two concrete behaviors
//! exist: a single-phase finalizer that commits the local transaction
//! directly, and a two-phase finalizer that stages the transaction with
//! `PREPARE TRANSACTION` at finalize time and resolves it afterward. The
//! manager sees only this trait and drives either interchangeably.

use crate::error::Result;
use async_trait::async_trait;

/// Lifecycle of a participant finalizer.
///
/// `Committed` and `Aborted` are terminal; a transition attempt out of them
/// is rejected deterministically, never silently accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// The local transaction is open and accepting work.
    Active,
    /// Finalize succeeded. For a two-phase participant the transaction is
    /// prepared on the server and the local handle has been released.
    Finalized,
    /// The participant's changes are durable.
    Committed,
    /// The participant's changes are rolled back.
    Aborted,
}

impl FinalizerState {
    /// True for states no further transition can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FinalizerState::Committed | FinalizerState::Aborted)
    }
}

/// One per-database participant in a cross-database transaction.
///
/// Callers serialize their own use of a participant; a finalizer is safe to
/// move across threads but not to drive from two at once, which the
/// `&mut self` receivers enforce.
#[async_trait]
pub trait Finalizer: Send {
    /// Current lifecycle state.
    fn state(&self) -> FinalizerState;

    /// Run deferred work and stage the transaction for commit. The first
    /// deferred-action error stops the sequence and becomes the result.
    async fn finalize(&mut self) -> Result<()>;

    /// Make the participant's changes durable. Legal only after a successful
    /// finalize and at most once.
    async fn commit(&mut self) -> Result<()>;

    /// Release everything the participant still holds. Always safe to call,
    /// idempotent, and a no-op once the participant is terminal. Failures
    /// are traced rather than returned; a cleanup failure the coordinator
    /// cannot survive (losing track of a prepared transaction) panics with
    /// full identity.
    async fn abort(&mut self);
}
