//! Bank-transfer scenarios across two independent databases
//!
//! These tests drive the same transfer shape the demo runs: read the source
//! balance under its row lock, debit one database, credit the other, and
//! commit both through the manager. The crossing-transfer test deliberately
//! provokes the lock-wait the caller's deadline has to break.

use crosstx_coordinator::{Deadline, TxManager};
use crosstx_pg_mock::{MockPg, MockPool};
use crosstx_postgres::PgFinalizer;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;

fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

fn bank(balances: &[(&str, i64)]) -> (MockPg, MockPool) {
    let server = MockPg::new();
    for (key, balance) in balances {
        server.set_row(*key, *balance);
    }
    let pool = MockPool::new(&server);
    (server, pool)
}

#[derive(Debug, PartialEq, Eq)]
enum TransferOutcome {
    Committed,
    InsufficientFunds,
    Cancelled,
    Failed,
}

/// Move `amount` from `from` in the first database to `to` in the second,
/// all-or-nothing. Mirrors the recommended caller shape: abort on every exit
/// path, which is a no-op when the commit already succeeded.
async fn transfer(
    source: &MockPool,
    from: &str,
    dest: &MockPool,
    to: &str,
    amount: i64,
    deadline: Deadline,
) -> TransferOutcome {
    let f0 = match PgFinalizer::two_phase(source.clone(), "bank0", deadline).await {
        Ok(f) => f,
        Err(err) if err.is_deadline() => return TransferOutcome::Cancelled,
        Err(_) => return TransferOutcome::Failed,
    };
    let f1 = match PgFinalizer::two_phase(dest.clone(), "bank1", deadline).await {
        Ok(f) => f,
        Err(err) if err.is_deadline() => return TransferOutcome::Cancelled,
        Err(_) => return TransferOutcome::Failed,
    };

    let mut txm = TxManager::new();
    txm.add("bank0", f0);
    txm.add("bank1", f1);

    let outcome = run_transfer(&mut txm, from, to, amount).await;
    if outcome != TransferOutcome::Committed {
        txm.abort("transfer abandoned").await;
    }
    outcome
}

async fn run_transfer(
    txm: &mut TxManager<PgFinalizer<MockPool>>,
    from: &str,
    to: &str,
    amount: i64,
) -> TransferOutcome {
    let f0 = txm.participant_mut("bank0").unwrap();
    let available = match f0.tx().select_for_update(from).await {
        Ok(balance) => balance.unwrap_or(0),
        Err(err) if err.is_deadline() => return TransferOutcome::Cancelled,
        Err(_) => return TransferOutcome::Failed,
    };
    if available < amount {
        return TransferOutcome::InsufficientFunds;
    }
    if let Err(err) = f0.tx().update_add(from, -amount).await {
        return if err.is_deadline() {
            TransferOutcome::Cancelled
        } else {
            TransferOutcome::Failed
        };
    }

    let f1 = txm.participant_mut("bank1").unwrap();
    if let Err(err) = f1.tx().update_add(to, amount).await {
        return if err.is_deadline() {
            TransferOutcome::Cancelled
        } else {
            TransferOutcome::Failed
        };
    }

    match txm.commit().await {
        Ok(()) => TransferOutcome::Committed,
        Err(err) if err.is_deadline() => TransferOutcome::Cancelled,
        Err(_) => TransferOutcome::Failed,
    }
}

#[tokio::test]
async fn transfer_moves_money_between_banks() {
    let (server0, pool0) = bank(&[("acct:1", 1000)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    let outcome = transfer(&pool0, "acct:1", &pool1, "acct:1", 300, deadline()).await;

    assert_eq!(outcome, TransferOutcome::Committed);
    assert_eq!(server0.row("acct:1"), Some(700));
    assert_eq!(server1.row("acct:1"), Some(1300));
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());
}

#[tokio::test]
async fn insufficient_funds_leaves_both_banks_untouched() {
    let (server0, pool0) = bank(&[("acct:1", 100)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    let outcome = transfer(&pool0, "acct:1", &pool1, "acct:1", 300, deadline()).await;

    assert_eq!(outcome, TransferOutcome::InsufficientFunds);
    assert_eq!(server0.row("acct:1"), Some(100));
    assert_eq!(server1.row("acct:1"), Some(1000));
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());
}

#[tokio::test]
async fn crossing_transfers_deadlock_and_cancel_cleanly() {
    let (server0, pool0) = bank(&[("acct:1", 1000)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    // Both tasks take their source lock, then go for the other bank's row.
    // Neither can proceed; the deadline has to break the tie, and the mock
    // has no deadlock detector, so both lose.
    let barrier = Arc::new(Barrier::new(2));

    let crossing = |source: MockPool, dest: MockPool, barrier: Arc<Barrier>| async move {
        let deadline = Deadline::after(Duration::from_millis(300));
        let mut txm = TxManager::new();
        txm.add(
            "bank0",
            PgFinalizer::two_phase(source, "bank0", deadline).await.unwrap(),
        );
        txm.add(
            "bank1",
            PgFinalizer::two_phase(dest, "bank1", deadline).await.unwrap(),
        );

        let f0 = txm.participant_mut("bank0").unwrap();
        f0.tx().select_for_update("acct:1").await.unwrap();
        barrier.wait().await;

        let f1 = txm.participant_mut("bank1").unwrap();
        let blocked = f1.tx().select_for_update("acct:1").await;
        txm.abort("deadlock").await;
        blocked
    };

    let a = tokio::spawn(crossing(pool0.clone(), pool1.clone(), barrier.clone()));
    let b = tokio::spawn(crossing(pool1.clone(), pool0.clone(), barrier.clone()));

    let a = a.await.unwrap();
    let b = b.await.unwrap();
    assert!(a.unwrap_err().is_deadline());
    assert!(b.unwrap_err().is_deadline());

    // Both transactions released cleanly: no prepared residue, no lost money,
    // and the rows are lockable again.
    assert_eq!(server0.row("acct:1"), Some(1000));
    assert_eq!(server1.row("acct:1"), Some(1000));
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());

    let outcome = transfer(&pool0, "acct:1", &pool1, "acct:1", 100, deadline()).await;
    assert_eq!(outcome, TransferOutcome::Committed);
}

#[tokio::test]
async fn concurrent_transfers_conserve_the_total() {
    let accounts: Vec<(String, i64)> = (1..=5).map(|i| (format!("acct:{i}"), 1000)).collect();
    let seed: Vec<(&str, i64)> = accounts.iter().map(|(k, v)| (k.as_str(), *v)).collect();
    let (server0, pool0) = bank(&seed);
    let (server1, pool1) = bank(&seed);
    let initial_total: i64 = server0.rows().values().sum::<i64>()
        + server1.rows().values().sum::<i64>();

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let pool0 = pool0.clone();
        let pool1 = pool1.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                let from = format!("acct:{}", rand::thread_rng().gen_range(1..=5));
                let to = format!("acct:{}", rand::thread_rng().gen_range(1..=5));
                let amount = rand::thread_rng().gen_range(1..=500);
                let deadline = Deadline::after(Duration::from_millis(500));
                // Alternate direction, like the original stress shape.
                if i % 2 == 0 {
                    transfer(&pool0, &from, &pool1, &to, amount, deadline).await;
                } else {
                    transfer(&pool1, &from, &pool0, &to, amount, deadline).await;
                }
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let final_total: i64 = server0.rows().values().sum::<i64>()
        + server1.rows().values().sum::<i64>();
    assert_eq!(final_total, initial_total);
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());
}
