//! Cross-database transaction coordination
//!
//! This crate provides the transaction manager that drives a set of
//! per-database participants through an all-or-nothing commit/abort protocol,
//! the capability set ([`Finalizer`]) a participant must expose, and the
//! error envelope that carries participant identity out of failed protocol
//! steps.
//!
//! Participants are registered under stable labels and driven in insertion
//! order: first a finalize pass (for two-phase participants this stages the
//! changes durably on the server), then a commit pass. Any failure aborts
//! every participant and surfaces the first error wrapped with the label of
//! the participant that raised it.

pub mod deadline;
pub mod error;
pub mod finalizer;
pub mod manager;

pub use deadline::Deadline;
pub use error::{BoxError, Result, TxError, TxIdentity};
pub use finalizer::{Finalizer, FinalizerState};
pub use manager::{ManagerState, TxManager};
