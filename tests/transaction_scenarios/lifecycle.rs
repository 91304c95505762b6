//! Leases, heartbeats and expiry

use crate::common::*;
use std::thread;
use std::time::Duration;

/// A heartbeating transaction outlives several lease periods.
#[test]
fn heartbeat_keeps_transaction_alive() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let timeout = Duration::from_millis(cluster.config().transaction_timeout_ms);

    let txn = manager.begin();
    txn.write("long-running", 1).unwrap();
    thread::sleep(timeout * 2);
    assert_eq!(txn.state(), ClientState::Running);
    txn.write("long-running-2", 2).unwrap();
    txn.commit().wait().unwrap();

    assert_eq!(committed_value(&manager, "long-running"), Some(Value::Int(1)));
    assert_eq!(committed_value(&manager, "long-running-2"), Some(Value::Int(2)));
}

/// Without heartbeats the lease lapses: the commit reports `Expired` and the
/// transaction's intents and status record are cleaned up.
#[test]
fn silent_transaction_expires() {
    let cluster = cluster_with(TxnConfig {
        disable_heartbeat_in_tests: true,
        transaction_timeout_ms: 200,
        aborted_intent_cleanup_ms: 100,
        ..TxnConfig::for_tests()
    });
    let manager = cluster.transaction_manager();

    let txn = manager.begin();
    txn.write("expiring", 1).unwrap();
    thread::sleep(Duration::from_millis(400));

    let err = txn.commit().wait().unwrap_err();
    assert!(matches!(err, StrataError::Expired { .. }), "got {:?}", err);
    assert!(err.is_retryable());
    assert_eq!(txn.state(), ClientState::Aborted);

    wait_for_no_intents(&cluster);
    assert!(cluster.wait_for(SETTLE, |c| !c.has_transactions()));
    assert_eq!(committed_value(&manager, "expiring"), None);
}

/// The sweep aborts lapsed transactions on its own.
#[test]
fn sweep_expires_abandoned_transaction() {
    let cluster = cluster_with(TxnConfig {
        disable_heartbeat_in_tests: true,
        transaction_timeout_ms: 100,
        ..TxnConfig::for_tests()
    });
    let manager = cluster.transaction_manager();
    let txn = manager.begin();
    txn.write("abandoned", 1).unwrap();
    let id = txn.id().unwrap();
    let status_tablet = txn.metadata().unwrap().status_tablet;

    let coordinator = cluster.tablet(&status_tablet).unwrap().coordinator();
    assert!(cluster.wait_for(SETTLE, |_| {
        coordinator
            .record(&id)
            .map_or(true, |r| r.status == TransactionStatus::Aborted)
    }));
    assert!(matches!(
        txn.commit().wait(),
        Err(StrataError::Expired { .. })
    ));
}

/// Committed and aborted records are retired once applied everywhere.
#[test]
fn finished_records_are_retired() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();

    commit_put(&manager, "retire-a", 1);
    let aborted = manager.begin();
    aborted.write("retire-b", 1).unwrap();
    aborted.abort().wait().unwrap();

    assert!(cluster.wait_for(SETTLE, |c| !c.has_transactions()));
    wait_for_no_intents(&cluster);
    assert_eq!(committed_value(&manager, "retire-a"), Some(Value::Int(1)));
}

/// A committed record carries the commit time the client saw until retired.
#[test]
fn committed_status_is_queryable() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let txn = manager.begin();
    txn.write("queryable", 1).unwrap();
    txn.commit().wait().unwrap();

    let id = txn.id().unwrap();
    let status_tablet = txn.metadata().unwrap().status_tablet;
    let coordinator = cluster.tablet(&status_tablet).unwrap().coordinator();
    if let Some(record) = coordinator.record(&id) {
        assert_eq!(record.status, TransactionStatus::Committed);
        assert_eq!(Some(record.status_time), txn.commit_time());
    }
}
