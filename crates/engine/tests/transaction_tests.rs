//! Transaction lifecycle tests against an in-process cluster
//!
//! Covers lazy initialization, read-your-writes, snapshot reads, commit and
//! abort idempotence, and cleanup of abandoned transactions.

use std::sync::{Arc, Barrier, Once};
use std::thread;
use std::time::Duration;
use strata_core::{
    ClientState, IsolationLevel, Key, StrataError, TransactionRpc, TransactionStatus, Value,
};
use strata_engine::{LocalCluster, Session, TxnConfig};

static INIT_TRACING: Once = Once::new();

fn cluster() -> Arc<LocalCluster> {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    LocalCluster::start(3, TxnConfig::for_tests()).unwrap()
}

fn committed_value(cluster: &Arc<LocalCluster>, key: &str) -> Option<Value> {
    let session = Session::begin(&cluster.transaction_manager());
    let value = session.read(key).unwrap();
    session.commit().unwrap();
    value
}

// ============================================================================
// Initialization
// ============================================================================

#[test]
fn test_initialization_is_lazy() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let txn = manager.begin();
    assert_eq!(txn.state(), ClientState::Created);
    assert!(txn.id().is_none());
    assert!(txn.read_time().is_none());

    txn.read("lazy").unwrap();
    assert_eq!(txn.state(), ClientState::Running);
    assert!(txn.id().is_some());
    assert!(txn.read_time().is_some());
}

#[test]
fn test_init_twice_with_same_parameters_is_noop() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.init(IsolationLevel::SnapshotIsolation, None).unwrap();
    let id = txn.id();
    txn.init(IsolationLevel::SnapshotIsolation, None).unwrap();
    assert_eq!(txn.id(), id);
}

#[test]
fn test_init_with_conflicting_read_time_fails() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let read_time = manager.clock().read_time_now();
    let txn = manager
        .begin_with(IsolationLevel::SnapshotIsolation, Some(read_time))
        .unwrap();
    assert_eq!(txn.read_time(), Some(read_time));

    let other = manager.clock().read_time_now();
    assert_eq!(
        txn.init(IsolationLevel::SnapshotIsolation, Some(other)),
        Err(StrataError::AlreadyInitialized)
    );
}

#[test]
fn test_non_transactional_isolation_rejected() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    let err = txn.init(IsolationLevel::NonTransactional, None).unwrap_err();
    assert!(matches!(err, StrataError::InvalidInput(_)));
    assert_eq!(txn.state(), ClientState::Created);
}

#[test]
fn test_read_time_picked_by_tablet_for_single_key() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.read("solo").unwrap();

    let read_time = txn.read_time().unwrap();
    assert_eq!(read_time.local_limit, read_time.read);
    assert!(read_time.global_limit > read_time.read);
    let tablet = cluster.tablet_for_key(&Key::from("solo")).unwrap();
    assert_eq!(txn.local_limits().get(&tablet), Some(&read_time.read));
}

// ============================================================================
// Reads and writes
// ============================================================================

#[test]
fn test_read_your_writes() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.write("k", 1).unwrap();
    assert_eq!(txn.read("k").unwrap(), Some(Value::Int(1)));
    txn.delete("k").unwrap();
    assert_eq!(txn.read("k").unwrap(), None);
    txn.write("k", "again").unwrap();
    assert_eq!(txn.read("k").unwrap(), Some(Value::from("again")));
}

#[test]
fn test_uncommitted_write_invisible_to_others() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let writer = manager.begin();
    writer.write("k", 1).unwrap();

    let reader = manager.begin();
    assert_eq!(reader.read("k").unwrap(), None);

    writer.commit().wait().unwrap();
    // The reader's snapshot predates the commit
    assert_eq!(reader.read("k").unwrap(), None);
    assert_eq!(committed_value(&cluster, "k"), Some(Value::Int(1)));
}

#[test]
fn test_commit_time_after_every_write() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let txn = manager.begin();
    for i in 0..10 {
        txn.write(format!("key-{}", i), i as i64).unwrap();
    }
    txn.commit().wait().unwrap();
    let commit_time = txn.commit_time().unwrap();
    assert!(commit_time > txn.read_time().unwrap().read);
    assert!(manager.clock().now() > commit_time);
}

#[test]
fn test_read_many_across_tablets() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let keys: Vec<Key> = (0..12).map(|i| format!("multi-{}", i).into()).collect();

    let writer = manager.begin();
    for (i, key) in keys.iter().enumerate() {
        writer.write(key.clone(), i as i64).unwrap();
    }
    writer.commit().wait().unwrap();
    assert!(writer.touched_tablets().len() > 1);

    let reader = manager.begin();
    let values = reader.read_many(&keys).unwrap();
    let expected: Vec<_> = (0..12).map(|i| Some(Value::Int(i))).collect();
    assert_eq!(values, expected);
}

// ============================================================================
// Commit and abort
// ============================================================================

#[test]
fn test_commit_without_writes_is_local() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.read("nothing").unwrap();
    txn.commit().wait().unwrap();
    assert_eq!(txn.state(), ClientState::Committed);
    assert!(txn.commit_time().is_none());
    assert!(!cluster.has_transactions());
}

#[test]
fn test_commit_is_idempotent_across_threads() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.write("shared", 7).unwrap();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let txn = txn.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                txn.commit().wait()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), Ok(()));
    }
    assert_eq!(txn.state(), ClientState::Committed);
    assert_eq!(committed_value(&cluster, "shared"), Some(Value::Int(7)));
}

#[test]
fn test_abort_is_idempotent() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.write("gone", 1).unwrap();

    let first = txn.abort().wait().unwrap();
    let second = txn.abort().wait().unwrap();
    assert_eq!(first, TransactionStatus::Aborted);
    assert_eq!(second, TransactionStatus::Aborted);
    assert_eq!(txn.state(), ClientState::Aborted);
    assert!(cluster.wait_for(Duration::from_secs(5), |c| c.count_intents() == 0));
    assert_eq!(committed_value(&cluster, "gone"), None);
}

#[test]
fn test_abort_after_commit_is_ignored() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.write("kept", 1).unwrap();
    txn.commit().wait().unwrap();

    assert_eq!(txn.abort().wait(), Ok(TransactionStatus::Committed));
    assert_eq!(txn.state(), ClientState::Committed);
    assert_eq!(committed_value(&cluster, "kept"), Some(Value::Int(1)));
}

#[test]
fn test_abort_racing_commit_reports_coordinator_outcome() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let (mut commit_wins, mut abort_wins) = (0, 0);

    for round in 0..40 {
        let key = format!("raced-{}", round);
        let txn = manager.begin();
        txn.write(key.as_str(), round).unwrap();
        // Failed sends keep the commit in flight while the abort goes out
        cluster.fail_next_status_updates(round as usize % 4);
        let commit = txn.commit();
        let abort = txn.abort();

        match (commit.wait(), abort.wait()) {
            (Ok(()), Ok(TransactionStatus::Committed)) => {
                commit_wins += 1;
                assert_eq!(txn.state(), ClientState::Committed);
                assert_eq!(committed_value(&cluster, &key), Some(Value::Int(round)));
            }
            (Err(e), Ok(TransactionStatus::Aborted)) => {
                abort_wins += 1;
                assert!(matches!(e, StrataError::Aborted { .. }), "got {:?}", e);
                assert_eq!(txn.state(), ClientState::Aborted);
                assert_eq!(committed_value(&cluster, &key), None);
            }
            other => panic!("commit and abort disagree: {:?}", other),
        }
    }
    assert_eq!(commit_wins + abort_wins, 40);
}

#[test]
fn test_operations_after_abort_fail() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.write("k", 1).unwrap();
    txn.abort().wait().unwrap();

    assert!(matches!(txn.read("k"), Err(StrataError::Aborted { .. })));
    assert!(matches!(txn.write("k", 2), Err(StrataError::Aborted { .. })));
    assert!(txn.commit().wait().is_err());
}

#[test]
fn test_commit_survives_transient_status_failures() {
    let cluster = cluster();
    let txn = cluster.transaction_manager().begin();
    txn.write("flaky", 1).unwrap();
    cluster.fail_next_status_updates(3);
    txn.commit().wait().unwrap();
    assert_eq!(committed_value(&cluster, "flaky"), Some(Value::Int(1)));
}

#[test]
fn test_drop_aborts_unfinished_transaction() {
    let cluster = cluster();
    {
        let txn = cluster.transaction_manager().begin();
        txn.write("dropped", 1).unwrap();
        assert_eq!(cluster.count_intents(), 1);
    }
    assert!(cluster.wait_for(Duration::from_secs(5), |c| c.count_intents() == 0));
    assert_eq!(committed_value(&cluster, "dropped"), None);
}

// ============================================================================
// Metrics
// ============================================================================

#[test]
fn test_metrics_track_outcomes() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();

    let committed = manager.begin();
    committed.write("a", 1).unwrap();
    committed.commit().wait().unwrap();

    let aborted = manager.begin();
    aborted.write("b", 1).unwrap();
    aborted.abort().wait().unwrap();

    let metrics = manager.metrics();
    assert_eq!(metrics.total_started, 2);
    assert_eq!(metrics.total_committed, 1);
    assert_eq!(metrics.total_aborted, 1);
    assert_eq!(metrics.active_count, 0);
    assert_eq!(metrics.total_completed(), 2);
    assert!((metrics.abort_rate() - 0.5).abs() < f64::EPSILON);
}

#[test]
fn test_non_transactional_session() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let session = Session::new(&manager);
    session.write("plain", 3).unwrap();
    assert_eq!(session.read("plain").unwrap(), Some(Value::Int(3)));
    session.delete("plain").unwrap();
    assert_eq!(session.read("plain").unwrap(), None);
    session.commit().unwrap();
    assert!(!cluster.has_transactions());
}
