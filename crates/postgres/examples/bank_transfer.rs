//! Concurrent bank transfers between two independent databases.
//!
//! Deliberately conflict-heavy: a handful of accounts, several tasks firing
//! random transfers in both directions under short deadlines, so lock waits
//! and deadline-driven aborts happen constantly. Whatever the interleaving,
//! the combined balance of the two banks never changes.
//!
//! Run with `cargo run --example bank_transfer` (two-phase mode) or
//! `cargo run --example bank_transfer -- 1p` for single-phase mode. Set
//! `RUST_LOG=debug` to see the per-participant trace lines.

use crosstx_coordinator::{Deadline, TxManager};
use crosstx_pg_mock::{MockPg, MockPool};
use crosstx_postgres::PgFinalizer;
use rand::Rng;
use std::time::Duration;

const ACCOUNTS: i64 = 5;
const OPENING_BALANCE: i64 = 1000;
const TASKS: usize = 5;
const TRANSFERS_PER_TASK: usize = 100;

#[derive(Debug, Default)]
struct Tally {
    committed: u64,
    insufficient: u64,
    cancelled: u64,
    failed: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let two_phase = !std::env::args().any(|arg| arg == "1p");
    println!(
        "running {} transfers across {} tasks in {} mode",
        TASKS * TRANSFERS_PER_TASK,
        TASKS,
        if two_phase { "two-phase" } else { "single-phase" }
    );

    let bank0 = seed_bank();
    let bank1 = seed_bank();
    let pool0 = MockPool::new(&bank0);
    let pool1 = MockPool::new(&bank1);
    let initial_total = total(&bank0) + total(&bank1);

    let mut tasks = Vec::new();
    for _ in 0..TASKS {
        let pool0 = pool0.clone();
        let pool1 = pool1.clone();
        tasks.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            for i in 0..TRANSFERS_PER_TASK {
                let from = format!("acct:{}", rand::thread_rng().gen_range(1..=ACCOUNTS));
                let to = format!("acct:{}", rand::thread_rng().gen_range(1..=ACCOUNTS));
                let amount = rand::thread_rng().gen_range(1..=500);
                let outcome = if i % 2 == 0 {
                    transfer(&pool0, &from, &pool1, &to, amount, two_phase).await
                } else {
                    transfer(&pool1, &from, &pool0, &to, amount, two_phase).await
                };
                match outcome {
                    Outcome::Committed => tally.committed += 1,
                    Outcome::InsufficientFunds => tally.insufficient += 1,
                    Outcome::Cancelled => tally.cancelled += 1,
                    Outcome::Failed => tally.failed += 1,
                }
            }
            tally
        }));
    }

    let mut tally = Tally::default();
    for task in tasks {
        let t = task.await.expect("transfer task panicked");
        tally.committed += t.committed;
        tally.insufficient += t.insufficient;
        tally.cancelled += t.cancelled;
        tally.failed += t.failed;
    }

    let final_total = total(&bank0) + total(&bank1);
    println!(
        "committed {} / insufficient funds {} / cancelled {} / failed {}",
        tally.committed, tally.insufficient, tally.cancelled, tally.failed
    );
    println!(
        "combined balance {} -> {} (prepared residue: bank0 {:?}, bank1 {:?})",
        initial_total,
        final_total,
        bank0.prepared(),
        bank1.prepared()
    );
    if two_phase {
        assert_eq!(initial_total, final_total, "money was created or destroyed");
    } else if initial_total != final_total {
        // Single-phase mode is best-effort across databases; a deadline that
        // fires between the two commits splits the transfer.
        println!("single-phase mode lost a transfer between commits");
    }
}

fn seed_bank() -> MockPg {
    let bank = MockPg::new();
    for i in 1..=ACCOUNTS {
        bank.set_row(format!("acct:{i}"), OPENING_BALANCE);
    }
    bank
}

fn total(bank: &MockPg) -> i64 {
    bank.rows().values().sum()
}

enum Outcome {
    Committed,
    InsufficientFunds,
    Cancelled,
    Failed,
}

/// One transfer: debit `from` in the source bank, credit `to` in the
/// destination bank, all-or-nothing. Aborting on every non-commit path is
/// safe; abort after a successful commit is a no-op.
async fn transfer(
    source: &MockPool,
    from: &str,
    dest: &MockPool,
    to: &str,
    amount: i64,
    two_phase: bool,
) -> Outcome {
    let deadline = Deadline::after(Duration::from_secs(3));

    let begin = |pool: MockPool, label: &'static str| async move {
        let mut f = if two_phase {
            PgFinalizer::two_phase(pool, label, deadline).await?
        } else {
            PgFinalizer::single_phase(pool, label, deadline).await?
        };
        f.set_trace(true);
        Ok::<_, crosstx_coordinator::TxError>(f)
    };

    let f0 = match begin(source.clone(), "bank0").await {
        Ok(f) => f,
        Err(err) => return classify(&err),
    };
    let f1 = match begin(dest.clone(), "bank1").await {
        Ok(f) => f,
        Err(err) => return classify(&err),
    };

    let mut txm = TxManager::new();
    txm.add("bank0", f0);
    txm.add("bank1", f1);

    let outcome = async {
        let f0 = txm.participant_mut("bank0").unwrap();
        let available = match f0.tx().select_for_update(from).await {
            Ok(balance) => balance.unwrap_or(0),
            Err(err) if err.is_deadline() => return Outcome::Cancelled,
            Err(_) => return Outcome::Failed,
        };
        f0.trace(format_args!("selected balance {available} for {from}"));
        if available < amount {
            return Outcome::InsufficientFunds;
        }
        if f0.tx().update_add(from, -amount).await.is_err() {
            return Outcome::Failed;
        }

        let f1 = txm.participant_mut("bank1").unwrap();
        if f1.tx().update_add(to, amount).await.is_err() {
            return Outcome::Failed;
        }

        match txm.commit().await {
            Ok(()) => Outcome::Committed,
            Err(err) => classify(&err),
        }
    }
    .await;

    if !matches!(outcome, Outcome::Committed) {
        txm.abort("transfer abandoned").await;
    }
    outcome
}

fn classify(err: &crosstx_coordinator::TxError) -> Outcome {
    if err.is_deadline() {
        Outcome::Cancelled
    } else {
        Outcome::Failed
    }
}
