//! PostgreSQL participant finalizers for cross-database transactions
//!
//! Two finalization strategies behind one capability set:
//!
//! - [`SinglePhase`] commits each local transaction directly; across several
//!   databases this is sequential and best-effort, a failure after the first
//!   successful commit cannot be reversed.
//! - [`TwoPhase`] stages each transaction with `PREPARE TRANSACTION` during
//!   the finalize pass; once every participant is prepared the changes are
//!   durable on every server and the commit pass resolves them with
//!   `COMMIT PREPARED`. A crash between commits leaves named prepared
//!   transactions for an operator to resolve, which is the documented
//!   operational cost of two-phase mode.
//!
//! The database driver is consumed, not provided: implement [`PgPool`] /
//! [`PgTx`] over the pool of your choice.

mod common;
pub mod finalizer;
pub mod pool;
pub mod single_phase;
pub mod two_phase;

pub use common::DeferredAction;
pub use finalizer::PgFinalizer;
pub use pool::{PgError, PgPool, PgResult, PgTx, PgValue};
pub use single_phase::SinglePhase;
pub use two_phase::TwoPhase;
