//! Transaction manager
//!
//! Holds an ordered registry of participants under stable labels and drives
//! them through the commit/abort protocol. The atomicity the manager can
//! offer depends on the participants: with two-phase finalizers a successful
//! finalize pass durably stages every database before the first commit; with
//! single-phase finalizers commits are sequential and best-effort, so a
//! failure partway through the commit pass leaves earlier participants
//! committed.

use crate::error::{Result, TxError};
use crate::finalizer::Finalizer;

/// Manager lifecycle. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Accepting participants.
    Open,
    /// The finalize/commit passes are running.
    Committing,
    /// Every participant committed.
    Committed,
    /// The abort pass is running.
    Aborting,
    /// The transaction was abandoned.
    Aborted,
}

impl ManagerState {
    /// True for states no further transition can leave.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ManagerState::Committed | ManagerState::Aborted)
    }
}

/// Drives a set of participants through all-or-nothing commit.
///
/// Participants are driven in insertion order for both the finalize and the
/// commit pass; within a pass each participant's step completes before the
/// next begins. Calling [`TxManager::abort`] after a successful commit is a
/// no-op, so unconditionally aborting on every exit path is the recommended
/// cleanup idiom.
pub struct TxManager<F: Finalizer> {
    participants: Vec<(String, F)>,
    state: ManagerState,
}

impl<F: Finalizer> TxManager<F> {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self {
            participants: Vec::new(),
            state: ManagerState::Open,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        self.state
    }

    /// Register a participant under `label`.
    ///
    /// # Panics
    ///
    /// Panics on a duplicate label or when the manager is no longer open;
    /// both are programmer errors.
    pub fn add(&mut self, label: impl Into<String>, participant: F) {
        let label = label.into();
        assert!(
            self.state == ManagerState::Open,
            "cannot add participant '{}' to a manager that is {:?}",
            label,
            self.state
        );
        assert!(
            !self.participants.iter().any(|(l, _)| *l == label),
            "duplicate participant label '{}'",
            label
        );
        self.participants.push((label, participant));
    }

    /// Borrow a registered participant, e.g. to reach its transaction handle
    /// or register deferred work.
    pub fn participant_mut(&mut self, label: &str) -> Option<&mut F> {
        self.participants
            .iter_mut()
            .find(|(l, _)| l == label)
            .map(|(_, p)| p)
    }

    /// Drive every participant through finalize, then commit.
    ///
    /// The first failure in either pass aborts every participant (already
    /// committed ones treat abort as a no-op) and is returned wrapped with
    /// the label of the participant that raised it.
    pub async fn commit(&mut self) -> Result<()> {
        if self.state != ManagerState::Open {
            return Err(TxError::InvalidState(format!(
                "commit on a manager that is {:?}",
                self.state
            )));
        }
        self.state = ManagerState::Committing;

        for i in 0..self.participants.len() {
            if let Err(err) = self.participants[i].1.finalize().await {
                let label = self.participants[i].0.clone();
                tracing::debug!("participant '{}' failed to finalize: {}", label, err);
                self.state = ManagerState::Aborting;
                self.abort_participants().await;
                self.state = ManagerState::Aborted;
                return Err(TxError::Participant {
                    label,
                    source: Box::new(err),
                });
            }
        }

        for i in 0..self.participants.len() {
            if let Err(err) = self.participants[i].1.commit().await {
                let label = self.participants[i].0.clone();
                tracing::debug!("participant '{}' failed to commit: {}", label, err);
                self.state = ManagerState::Aborting;
                self.abort_participants().await;
                self.state = ManagerState::Aborted;
                return Err(TxError::Participant {
                    label,
                    source: Box::new(err),
                });
            }
        }

        self.state = ManagerState::Committed;
        Ok(())
    }

    /// Abort the transaction. Idempotent: once the manager is terminal this
    /// is a no-op, so a commit that already succeeded stays committed.
    ///
    /// Individual participant abort failures are traced, never propagated;
    /// the caller already knows the work did not commit.
    pub async fn abort(&mut self, reason: &str) {
        if self.state.is_terminal() {
            return;
        }
        tracing::debug!("aborting transaction: {}", reason);
        self.state = ManagerState::Aborting;
        self.abort_participants().await;
        self.state = ManagerState::Aborted;
    }

    async fn abort_participants(&mut self) {
        for (label, participant) in &mut self.participants {
            tracing::debug!("aborting participant '{}'", label);
            participant.abort().await;
        }
    }
}

impl<F: Finalizer> Default for TxManager<F> {
    fn default() -> Self {
        Self::new()
    }
}
