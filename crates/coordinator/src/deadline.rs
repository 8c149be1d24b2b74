//! Caller deadlines
//!
//! A [`Deadline`] stands in for the cancellable context the caller would pass
//! through every blocking call. It is bound to a participant at construction
//! and consulted by every operation that issues SQL. Abort of a prepared
//! two-phase participant deliberately does NOT inherit the caller's deadline;
//! cleanup allocates its own bounded one so a cancelled caller cannot leave a
//! prepared transaction stranded.

use crate::error::TxError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// A point in time after which work on behalf of the caller must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    /// Deadline at an absolute instant.
    pub fn at(instant: Instant) -> Self {
        Self(instant)
    }

    /// The instant the deadline falls on.
    pub fn instant(&self) -> Instant {
        self.0
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.0.saturating_duration_since(Instant::now())
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Run `fut` for no longer than the time remaining. Expiry is converted
    /// into the typed deadline error.
    pub async fn bound<F>(&self, fut: F) -> Result<F::Output, TxError>
    where
        F: Future,
    {
        tokio::time::timeout(self.remaining(), fut)
            .await
            .map_err(|_| TxError::DeadlineExceeded)
    }
}
