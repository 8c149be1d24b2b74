//! In-memory PostgreSQL transaction engine
//!
//! This crate provides an in-memory implementation of the pool and
//! transaction capabilities the finalizers consume, allowing the
//! cross-database commit/abort protocol to be tested without a running
//! PostgreSQL server. It models exactly the transaction surface the
//! coordinator touches: transaction/backend id assignment, `txid_status`
//! book-keeping, buffered row writes behind blocking `FOR UPDATE` row locks,
//! and the prepared-transaction catalogue behind `PREPARE TRANSACTION` /
//! `COMMIT PREPARED` / `ROLLBACK PREPARED`.
//!
//! Rows are a flat `key -> i64` store; typed row operations on
//! [`MockTransaction`] stand in for application SQL.

pub mod pool;
pub mod server;

pub use pool::{MockPool, MockTransaction};
pub use server::{MockPg, TxStatus};
