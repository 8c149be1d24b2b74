//! Pool and transaction capabilities over the mock server
//!
//! [`MockPool`] and [`MockTransaction`] implement the capability traits the
//! finalizers consume. Only the coordinator's protocol statements are
//! understood as SQL; application data access goes through the typed row
//! operations, which is enough to model the read/modify/write transactions
//! the tests and the demo run.

use crate::server::{LockAttempt, MockPg, TxStatus};
use async_trait::async_trait;
use crosstx_coordinator::Deadline;
use crosstx_postgres::{PgError, PgPool, PgResult, PgTx, PgValue};
use std::collections::HashMap;

fn quoted_name<'a>(sql: &'a str, prefix: &str) -> Option<&'a str> {
    sql.strip_prefix(prefix)?.strip_suffix('\'')
}

/// Connection pool over one [`MockPg`] server.
#[derive(Clone)]
pub struct MockPool {
    server: MockPg,
}

impl MockPool {
    pub fn new(server: &MockPg) -> Self {
        Self {
            server: server.clone(),
        }
    }
}

#[async_trait]
impl PgPool for MockPool {
    type Tx = MockTransaction;

    async fn begin(&self, deadline: Deadline) -> PgResult<MockTransaction> {
        if deadline.expired() {
            return Err(PgError::DeadlineExceeded);
        }
        let (txid, pid) = self.server.begin_tx();
        Ok(MockTransaction {
            server: self.server.clone(),
            txid,
            pid,
            deadline,
            writes: HashMap::new(),
            done: false,
        })
    }

    async fn execute(&self, sql: &str, deadline: Deadline) -> PgResult<u64> {
        if deadline.expired() {
            return Err(PgError::DeadlineExceeded);
        }
        if let Some(name) = quoted_name(sql, "COMMIT PREPARED '") {
            self.server.commit_prepared(name).map_err(PgError::Database)?;
            return Ok(0);
        }
        if let Some(name) = quoted_name(sql, "ROLLBACK PREPARED '") {
            self.server
                .rollback_prepared(name)
                .map_err(PgError::Database)?;
            return Ok(0);
        }
        Err(PgError::Database(format!("unrecognized statement: {sql}")))
    }
}

/// One database-local transaction on the mock server.
///
/// Writes are buffered client-side and handed to the server at commit or
/// prepare time. The deadline bound at begin is checked on every operation;
/// expiry cancels the statement and rolls the transaction back server-side,
/// the way a context-bound driver behaves.
pub struct MockTransaction {
    server: MockPg,
    txid: i64,
    pid: i64,
    deadline: Deadline,
    writes: HashMap<String, i64>,
    done: bool,
}

impl MockTransaction {
    /// Server-assigned transaction id, `txid_current()`.
    pub fn txid(&self) -> i64 {
        self.txid
    }

    /// Read a row: buffered writes win over committed state.
    pub async fn get(&mut self, key: &str) -> PgResult<Option<i64>> {
        self.ensure_live()?;
        self.ensure_not_failed()?;
        Ok(self.read(key))
    }

    /// Read a row under its lock, blocking behind the current holder.
    pub async fn select_for_update(&mut self, key: &str) -> PgResult<Option<i64>> {
        self.ensure_live()?;
        self.ensure_not_failed()?;
        self.lock_row(key).await?;
        Ok(self.read(key))
    }

    /// Buffer an unconditional write under the row's lock.
    pub async fn insert(&mut self, key: &str, value: i64) -> PgResult<()> {
        self.ensure_live()?;
        self.ensure_not_failed()?;
        self.lock_row(key).await?;
        self.writes.insert(key.to_string(), value);
        Ok(())
    }

    /// Add `delta` to an existing row under its lock.
    pub async fn update_add(&mut self, key: &str, delta: i64) -> PgResult<()> {
        self.ensure_live()?;
        self.ensure_not_failed()?;
        self.lock_row(key).await?;
        let current = self
            .read(key)
            .ok_or_else(|| PgError::Database(format!("no such row: {key}")))?;
        self.writes.insert(key.to_string(), current + delta);
        Ok(())
    }

    fn read(&self, key: &str) -> Option<i64> {
        self.writes
            .get(key)
            .copied()
            .or_else(|| self.server.read_row(key))
    }

    fn ensure_live(&mut self) -> PgResult<()> {
        if self.done {
            return Err(PgError::Closed);
        }
        if self.deadline.expired() {
            self.server.cancel_tx(self.txid);
            self.done = true;
            return Err(PgError::DeadlineExceeded);
        }
        Ok(())
    }

    fn ensure_not_failed(&self) -> PgResult<()> {
        match self.server.tx_status(self.txid) {
            Some(TxStatus::InProgress) => Ok(()),
            _ => Err(PgError::Database(
                "current transaction is aborted, commands ignored until end of transaction block"
                    .to_string(),
            )),
        }
    }

    async fn lock_row(&mut self, key: &str) -> PgResult<()> {
        match self.server.try_lock(self.txid, key) {
            LockAttempt::Acquired => Ok(()),
            LockAttempt::Wait(rx) => {
                match tokio::time::timeout(self.deadline.remaining(), rx).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(_)) => {
                        // The server dropped our waiter: the transaction was
                        // aborted out from under us.
                        self.server.cancel_tx(self.txid);
                        self.done = true;
                        Err(PgError::Database(
                            "canceling statement due to conflict with recovery".to_string(),
                        ))
                    }
                    Err(_) => {
                        self.server.cancel_tx(self.txid);
                        self.done = true;
                        Err(PgError::DeadlineExceeded)
                    }
                }
            }
        }
    }
}

#[async_trait]
impl PgTx for MockTransaction {
    async fn execute(&mut self, sql: &str) -> PgResult<u64> {
        self.ensure_live()?;
        if let Some(name) = quoted_name(sql, "PREPARE TRANSACTION '") {
            self.server
                .prepare_tx(self.txid, name, self.writes.clone())
                .map_err(PgError::Database)?;
            // The catalogue owns the changes now; this handle is finished.
            self.writes.clear();
            self.done = true;
            return Ok(0);
        }
        Err(PgError::Database(format!("unrecognized statement: {sql}")))
    }

    async fn query_row(&mut self, sql: &str, params: &[PgValue]) -> PgResult<PgValue> {
        self.ensure_live()?;
        match sql {
            "SELECT txid_current()" => Ok(PgValue::Int(self.txid)),
            "SELECT pg_backend_pid()" => Ok(PgValue::Int(self.pid)),
            "SELECT txid_status($1)" => {
                let id = params.first().and_then(PgValue::as_int).ok_or_else(|| {
                    PgError::Database("txid_status requires a transaction id".to_string())
                })?;
                Ok(match self.server.tx_status(id) {
                    Some(status) => PgValue::Text(status.to_string()),
                    None => PgValue::Null,
                })
            }
            other => Err(PgError::Database(format!("unrecognized query: {other}"))),
        }
    }

    async fn commit(&mut self) -> PgResult<()> {
        self.ensure_live()?;
        let writes = std::mem::take(&mut self.writes);
        self.done = true;
        self.server.commit_tx(self.txid, writes).map_err(PgError::Database)
    }

    async fn rollback(&mut self) -> PgResult<()> {
        if self.done {
            return Err(PgError::Closed);
        }
        if self.deadline.expired() {
            self.server.cancel_tx(self.txid);
            self.done = true;
            return Err(PgError::DeadlineExceeded);
        }
        self.writes.clear();
        self.done = true;
        self.server.rollback_tx(self.txid);
        Ok(())
    }
}

impl Drop for MockTransaction {
    fn drop(&mut self) {
        if !self.done {
            self.server.rollback_tx(self.txid);
        }
    }
}
