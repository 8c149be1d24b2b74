//! Two-phase finalizer behavior against the in-memory server

use crosstx_coordinator::{Deadline, Finalizer, FinalizerState, TxError, TxManager};
use crosstx_pg_mock::{MockPg, MockPool};
use crosstx_postgres::{PgFinalizer, TwoPhase};
use std::time::Duration;

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

#[tokio::test]
async fn finalize_durably_stages_the_transaction() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();

    f.finalize().await.unwrap();

    assert_eq!(f.state(), FinalizerState::Finalized);
    let prepared_id = f.prepared_id().expect("prepared id assigned");
    assert_eq!(server.prepared(), vec![prepared_id.to_string()]);
    // Staged, not yet visible.
    assert_eq!(server.row("acct:1"), Some(1000));

    f.commit().await.unwrap();
    assert_eq!(f.state(), FinalizerState::Committed);
    assert!(server.prepared().is_empty());
    assert_eq!(server.row("acct:1"), Some(700));
}

#[tokio::test]
async fn commit_without_finalize_is_rejected() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();

    let err = f.commit().await.unwrap_err();
    match err {
        TxError::Protocol { message, .. } => {
            assert!(message.contains("non-finalized"))
        }
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(server.row("acct:1"), Some(1000));
    assert!(server.prepared().is_empty());
}

#[tokio::test]
async fn double_commit_is_rejected() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();
    f.finalize().await.unwrap();
    f.commit().await.unwrap();

    let err = f.commit().await.unwrap_err();
    assert!(matches!(err, TxError::Protocol { .. }));
    assert_eq!(server.row("acct:1"), Some(700));
}

#[tokio::test]
async fn abort_of_an_active_participant_rolls_back_locally() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();

    f.abort().await;
    assert_eq!(f.state(), FinalizerState::Aborted);
    assert_eq!(server.row("acct:1"), Some(1000));
    assert!(server.prepared().is_empty());

    f.abort().await;
    assert_eq!(f.state(), FinalizerState::Aborted);
}

#[tokio::test]
async fn abort_of_a_prepared_participant_rolls_back_on_the_pool() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();
    f.finalize().await.unwrap();
    assert_eq!(server.prepared().len(), 1);

    f.abort().await;
    assert_eq!(f.state(), FinalizerState::Aborted);
    assert!(server.prepared().is_empty());
    assert_eq!(server.row("acct:1"), Some(1000));
}

#[tokio::test]
async fn abort_of_a_prepared_participant_survives_an_expired_caller_deadline() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", Deadline::after(Duration::from_millis(80)))
        .await
        .unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();
    f.finalize().await.unwrap();

    // Caller deadline gone; cleanup must still release the prepared
    // transaction through its own deadline.
    tokio::time::sleep(Duration::from_millis(120)).await;

    f.abort().await;
    assert_eq!(f.state(), FinalizerState::Aborted);
    assert!(server.prepared().is_empty());
    assert_eq!(server.row("acct:1"), Some(1000));
}

#[tokio::test]
async fn expired_deadline_surfaces_as_cancellation_on_commit() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", Deadline::after(Duration::from_millis(80)))
        .await
        .unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();
    f.finalize().await.unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;

    let err = f.commit().await.unwrap_err();
    assert!(err.is_deadline());
    assert!(matches!(err, TxError::DeadlineExceeded));
    // Nothing observed the changes; the prepared transaction waits for an
    // operator.
    assert_eq!(server.row("acct:1"), Some(1000));
    assert_eq!(server.prepared().len(), 1);
}

#[tokio::test]
async fn two_banks_commit_together() {
    let (server0, pool0) = bank(&[("acct:1", 1000)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    let mut txm = TxManager::new();
    txm.add(
        "bank0",
        PgFinalizer::two_phase(pool0, "bank0", deadline()).await.unwrap(),
    );
    txm.add(
        "bank1",
        PgFinalizer::two_phase(pool1, "bank1", deadline()).await.unwrap(),
    );

    let f0 = txm.participant_mut("bank0").unwrap();
    let available = f0.tx().select_for_update("acct:1").await.unwrap().unwrap();
    assert!(available >= 300);
    f0.tx().update_add("acct:1", -300).await.unwrap();

    let f1 = txm.participant_mut("bank1").unwrap();
    f1.tx().update_add("acct:1", 300).await.unwrap();

    txm.commit().await.unwrap();

    assert_eq!(server0.row("acct:1"), Some(700));
    assert_eq!(server1.row("acct:1"), Some(1300));
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());
}

#[tokio::test]
async fn caller_driven_abort_leaves_no_trace() {
    let (server0, pool0) = bank(&[("acct:1", 100)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    let mut txm = TxManager::new();
    txm.add(
        "bank0",
        PgFinalizer::two_phase(pool0, "bank0", deadline()).await.unwrap(),
    );
    txm.add(
        "bank1",
        PgFinalizer::two_phase(pool1, "bank1", deadline()).await.unwrap(),
    );

    let f0 = txm.participant_mut("bank0").unwrap();
    let available = f0.tx().select_for_update("acct:1").await.unwrap().unwrap();
    assert!(available < 300);

    txm.abort("Insufficient funds").await;

    assert_eq!(server0.row("acct:1"), Some(100));
    assert_eq!(server1.row("acct:1"), Some(1000));
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());
}

#[tokio::test]
async fn commit_time_driver_error_reports_the_stranded_prepared_transaction() {
    let (server0, pool0) = bank(&[("acct:1", 1000)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    let mut txm = TxManager::new();
    txm.add(
        "bank0",
        PgFinalizer::two_phase(pool0, "bank0", deadline()).await.unwrap(),
    );
    txm.add(
        "bank1",
        PgFinalizer::two_phase(pool1, "bank1", deadline()).await.unwrap(),
    );

    txm.participant_mut("bank0")
        .unwrap()
        .tx()
        .update_add("acct:1", -300)
        .await
        .unwrap();
    txm.participant_mut("bank1")
        .unwrap()
        .tx()
        .update_add("acct:1", 300)
        .await
        .unwrap();

    server1.fail_next_commit_prepared();

    let err = txm.commit().await.unwrap_err();
    assert!(matches!(err, TxError::Participant { ref label, .. } if label == "bank1"));

    // bank0 is committed, unavoidably; bank1's prepared transaction stays on
    // the server and is named in the error for the operator.
    assert_eq!(server0.row("acct:1"), Some(700));
    assert_eq!(server1.row("acct:1"), Some(1000));
    let stranded = err.identity().unwrap().prepared_id.unwrap();
    assert_eq!(server1.prepared(), vec![stranded.to_string()]);

    // The abort pass left bank1 terminal; a retried commit cannot re-resolve
    // the in-doubt prepared transaction.
    let bank1 = txm.participant_mut("bank1").unwrap();
    assert_eq!(bank1.state(), FinalizerState::Aborted);
    let err = bank1.commit().await.unwrap_err();
    assert!(matches!(err, TxError::Protocol { .. }));
    assert_eq!(server1.prepared(), vec![stranded.to_string()]);
}

#[tokio::test]
async fn finalize_failure_rolls_every_participant_back() {
    let (server0, pool0) = bank(&[("acct:1", 1000)]);
    let (server1, pool1) = bank(&[("acct:1", 1000)]);

    let mut txm = TxManager::new();
    txm.add(
        "bank0",
        PgFinalizer::two_phase(pool0, "bank0", deadline()).await.unwrap(),
    );
    txm.add(
        "bank1",
        PgFinalizer::two_phase(pool1, "bank1", deadline()).await.unwrap(),
    );

    txm.participant_mut("bank0")
        .unwrap()
        .tx()
        .update_add("acct:1", -300)
        .await
        .unwrap();
    txm.participant_mut("bank1")
        .unwrap()
        .defer(Box::new(|| Err("ledger entry rejected".into())));

    let err = txm.commit().await.unwrap_err();
    assert!(matches!(err, TxError::Participant { ref label, .. } if label == "bank1"));

    // bank0 had already prepared; the abort pass rolled it back.
    assert_eq!(server0.row("acct:1"), Some(1000));
    assert_eq!(server1.row("acct:1"), Some(1000));
    assert!(server0.prepared().is_empty());
    assert!(server1.prepared().is_empty());
}

#[tokio::test]
async fn finalize_refuses_a_server_aborted_transaction() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();

    server.abort_backend(f.identity().server_tx_id);

    let err = f.finalize().await.unwrap_err();
    match err {
        TxError::Protocol { message, .. } => assert!(message.contains("aborted")),
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(f.prepared_id(), None);
    assert!(server.prepared().is_empty());
    assert_eq!(server.row("acct:1"), Some(1000));
}

#[tokio::test]
async fn finalize_failure_clears_the_prepared_id() {
    let (server, pool) = bank(&[("acct:1", 1000)]);
    server.fail_next_prepare();

    let mut f = TwoPhase::begin(pool, "bank0", deadline()).await.unwrap();
    f.tx().update_add("acct:1", -300).await.unwrap();

    let err = f.finalize().await.unwrap_err();
    assert!(matches!(err, TxError::Database { .. }));
    assert_eq!(f.prepared_id(), None);
    assert_eq!(f.state(), FinalizerState::Active);
    assert!(server.prepared().is_empty());

    // The local transaction is still live and can be rolled back cleanly.
    f.abort().await;
    assert_eq!(f.state(), FinalizerState::Aborted);
    assert_eq!(server.row("acct:1"), Some(1000));
}
