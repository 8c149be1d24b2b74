//! Core in-memory server implementation
//!
//! One [`MockPg`] stands in for one PostgreSQL database. It keeps the
//! committed row store, per-transaction status book-keeping, the row-lock
//! table with blocked waiters, and the prepared-transaction catalogue.
//! Connections buffer their writes client-side (see
//! [`MockTransaction`](crate::MockTransaction)) and hand them over at
//! commit or prepare time, so an aborted transaction leaves no trace here.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Server-side transaction status, as `txid_status` reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    InProgress,
    Committed,
    Aborted,
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxStatus::InProgress => "in progress",
            TxStatus::Committed => "committed",
            TxStatus::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Outcome of a row-lock request.
pub(crate) enum LockAttempt {
    Acquired,
    /// Blocked behind the current holder; resolved when the holder releases.
    Wait(oneshot::Receiver<()>),
}

struct RowLock {
    holder: i64,
    waiters: VecDeque<(i64, oneshot::Sender<()>)>,
}

struct PreparedTx {
    txid: i64,
    writes: HashMap<String, i64>,
    locks: Vec<String>,
}

#[derive(Default)]
struct ServerState {
    next_txid: i64,
    next_pid: i64,
    rows: HashMap<String, i64>,
    tx_status: HashMap<i64, TxStatus>,
    locks: HashMap<String, RowLock>,
    prepared: HashMap<String, PreparedTx>,
    fail_next_commit: bool,
    fail_next_prepare: bool,
    fail_next_commit_prepared: bool,
}

impl ServerState {
    fn release_locks_of(&mut self, txid: i64) {
        let keys: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, lock)| lock.holder == txid)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.release_lock(&key, txid);
        }
    }

    fn release_lock(&mut self, key: &str, txid: i64) {
        let Some(lock) = self.locks.get_mut(key) else {
            return;
        };
        if lock.holder != txid {
            return;
        }
        // Hand the lock to the first waiter that is still listening.
        while let Some((next_txid, waiter)) = lock.waiters.pop_front() {
            if waiter.send(()).is_ok() {
                lock.holder = next_txid;
                return;
            }
        }
        self.locks.remove(key);
    }

    fn drop_waiter(&mut self, txid: i64) {
        for lock in self.locks.values_mut() {
            lock.waiters.retain(|(waiter, _)| *waiter != txid);
        }
    }

    fn abort_tx(&mut self, txid: i64) {
        if self.tx_status.get(&txid) != Some(&TxStatus::InProgress) {
            return;
        }
        // A prepared transaction survives its backend; only the catalogue
        // can resolve it.
        if self.prepared.values().any(|p| p.txid == txid) {
            return;
        }
        self.drop_waiter(txid);
        self.release_locks_of(txid);
        self.tx_status.insert(txid, TxStatus::Aborted);
    }
}

/// In-memory stand-in for one PostgreSQL database.
#[derive(Clone, Default)]
pub struct MockPg {
    state: Arc<Mutex<ServerState>>,
}

impl MockPg {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a committed row, bypassing any transaction.
    pub fn set_row(&self, key: impl Into<String>, value: i64) {
        self.state.lock().rows.insert(key.into(), value);
    }

    /// Committed value of a row.
    pub fn row(&self, key: &str) -> Option<i64> {
        self.state.lock().rows.get(key).copied()
    }

    /// Snapshot of the committed row store.
    pub fn rows(&self) -> HashMap<String, i64> {
        self.state.lock().rows.clone()
    }

    /// Names currently in the prepared-transaction catalogue, sorted.
    pub fn prepared(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().prepared.keys().cloned().collect();
        names.sort();
        names
    }

    /// Server-side status of a transaction, `None` once forgotten.
    pub fn tx_status(&self, txid: i64) -> Option<TxStatus> {
        self.state.lock().tx_status.get(&txid).copied()
    }

    /// Force a server-side abort of an in-progress, unprepared transaction,
    /// as the server's deadlock detector or an administrator would.
    pub fn abort_backend(&self, txid: i64) {
        self.state.lock().abort_tx(txid);
    }

    /// Make the next `COMMIT PREPARED` fail with an injected error.
    pub fn fail_next_commit_prepared(&self) {
        self.state.lock().fail_next_commit_prepared = true;
    }

    /// Make the next local commit fail after aborting the transaction
    /// server-side, modelling a transaction the server gave up on in the
    /// window between a status check and the commit itself.
    pub fn fail_next_commit(&self) {
        self.state.lock().fail_next_commit = true;
    }

    /// Make the next `PREPARE TRANSACTION` fail with an injected error,
    /// leaving the local transaction usable.
    pub fn fail_next_prepare(&self) {
        self.state.lock().fail_next_prepare = true;
    }

    pub(crate) fn begin_tx(&self) -> (i64, i64) {
        let mut state = self.state.lock();
        state.next_txid += 1;
        state.next_pid += 1;
        let txid = state.next_txid;
        state.tx_status.insert(txid, TxStatus::InProgress);
        (txid, state.next_pid)
    }

    pub(crate) fn read_row(&self, key: &str) -> Option<i64> {
        self.state.lock().rows.get(key).copied()
    }

    pub(crate) fn try_lock(&self, txid: i64, key: &str) -> LockAttempt {
        let mut state = self.state.lock();
        match state.locks.get_mut(key) {
            None => {
                state.locks.insert(
                    key.to_string(),
                    RowLock {
                        holder: txid,
                        waiters: VecDeque::new(),
                    },
                );
                LockAttempt::Acquired
            }
            Some(lock) if lock.holder == txid => LockAttempt::Acquired,
            Some(lock) => {
                let (tx, rx) = oneshot::channel();
                lock.waiters.push_back((txid, tx));
                LockAttempt::Wait(rx)
            }
        }
    }

    /// Abort on behalf of a connection whose deadline expired while working
    /// or waiting on a lock.
    pub(crate) fn cancel_tx(&self, txid: i64) {
        self.state.lock().abort_tx(txid);
    }

    pub(crate) fn commit_tx(
        &self,
        txid: i64,
        writes: HashMap<String, i64>,
    ) -> Result<(), String> {
        let mut state = self.state.lock();
        if state.fail_next_commit {
            state.fail_next_commit = false;
            state.abort_tx(txid);
            return Err(format!("transaction {txid} aborted during commit"));
        }
        match state.tx_status.get(&txid) {
            Some(TxStatus::InProgress) => {}
            Some(status) => return Err(format!("transaction {txid} is {status}")),
            None => return Err(format!("transaction {txid} is unknown")),
        }
        state.rows.extend(writes);
        state.release_locks_of(txid);
        state.tx_status.insert(txid, TxStatus::Committed);
        Ok(())
    }

    pub(crate) fn rollback_tx(&self, txid: i64) {
        self.state.lock().abort_tx(txid);
    }

    pub(crate) fn prepare_tx(
        &self,
        txid: i64,
        name: &str,
        writes: HashMap<String, i64>,
    ) -> Result<(), String> {
        let mut state = self.state.lock();
        if state.fail_next_prepare {
            state.fail_next_prepare = false;
            return Err("injected PREPARE TRANSACTION failure".to_string());
        }
        match state.tx_status.get(&txid) {
            Some(TxStatus::InProgress) => {}
            Some(status) => return Err(format!("transaction {txid} is {status}")),
            None => return Err(format!("transaction {txid} is unknown")),
        }
        if state.prepared.contains_key(name) {
            return Err(format!(
                "transaction identifier \"{name}\" is already in use"
            ));
        }
        // The prepared transaction keeps the row locks until it is resolved.
        let locks: Vec<String> = state
            .locks
            .iter()
            .filter(|(_, lock)| lock.holder == txid)
            .map(|(key, _)| key.clone())
            .collect();
        state.prepared.insert(
            name.to_string(),
            PreparedTx {
                txid,
                writes,
                locks,
            },
        );
        Ok(())
    }

    pub(crate) fn commit_prepared(&self, name: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        if state.fail_next_commit_prepared {
            state.fail_next_commit_prepared = false;
            return Err("injected COMMIT PREPARED failure".to_string());
        }
        let Some(prepared) = state.prepared.remove(name) else {
            return Err(format!("prepared transaction \"{name}\" does not exist"));
        };
        state.rows.extend(prepared.writes);
        for key in &prepared.locks {
            state.release_lock(key, prepared.txid);
        }
        state.tx_status.insert(prepared.txid, TxStatus::Committed);
        Ok(())
    }

    pub(crate) fn rollback_prepared(&self, name: &str) -> Result<(), String> {
        let mut state = self.state.lock();
        let Some(prepared) = state.prepared.remove(name) else {
            return Err(format!("prepared transaction \"{name}\" does not exist"));
        };
        for key in &prepared.locks {
            state.release_lock(key, prepared.txid);
        }
        state.tx_status.insert(prepared.txid, TxStatus::Aborted);
        Ok(())
    }
}
