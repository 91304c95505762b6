//! Snapshot visibility
//!
//! - a committed transaction's writes appear everywhere at once
//! - a reader whose snapshot predates a commit never sees it
//! - a snapshot taken long before a commit needs no restart to skip it

use crate::common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

fn keys(prefix: &str, n: usize) -> Vec<Key> {
    (0..n).map(|i| format!("{}-{}", prefix, i).into()).collect()
}

// ============================================================================
// Atomic visibility
// ============================================================================

/// A reader sees either none or all of a multi-tablet commit.
#[test]
fn commit_visible_all_or_nothing() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let keys = keys("atomic", 12);
    let rounds = 20;

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let manager = manager.clone();
        let keys = keys.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut observed = 0;
            while !done.load(Ordering::Acquire) {
                let session = Session::begin(&manager);
                let values = session.read_many(&keys).expect("read_many");
                session.commit().expect("commit");
                let first = values[0].clone();
                assert!(
                    values.iter().all(|v| *v == first),
                    "torn snapshot: {:?}",
                    values
                );
                observed += 1;
            }
            observed
        })
    };

    for round in 0..rounds {
        let txn = manager.begin();
        for key in &keys {
            txn.write(key.clone(), round as i64).unwrap();
        }
        txn.commit().wait().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);

    let session = Session::begin(&manager);
    let values = session.read_many(&keys).unwrap();
    assert!(values.iter().all(|v| *v == Some(Value::Int(rounds - 1))));
}

/// Aborted writes never surface, on any tablet.
#[test]
fn aborted_writes_never_visible() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let keys = keys("aborted", 9);

    let txn = manager.begin();
    for key in &keys {
        txn.write(key.clone(), 1).unwrap();
    }
    assert!(txn.touched_tablets().len() > 1);
    assert_eq!(txn.abort().wait().unwrap(), TransactionStatus::Aborted);

    let session = Session::begin(&manager);
    assert_eq!(session.read_many(&keys).unwrap(), vec![None; keys.len()]);
    wait_for_no_intents(&cluster);
}

// ============================================================================
// Snapshot isolation
// ============================================================================

/// T2 starts while T1 is pending; T1's commit stays invisible to T2.
#[test]
fn concurrent_reader_keeps_its_snapshot() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    commit_put(&manager, "balance", 100);

    let t1 = manager.begin();
    t1.write("balance", 50).unwrap();

    let t2 = Session::begin(&manager);
    assert_eq!(t2.read("balance").unwrap(), Some(Value::Int(100)));

    t1.commit().wait().unwrap();
    assert_eq!(t2.read("balance").unwrap(), Some(Value::Int(100)));
    t2.commit().unwrap();

    assert_eq!(committed_value(&manager, "balance"), Some(Value::Int(50)));
}

/// A transaction started after a commit observes it.
#[test]
fn later_transaction_sees_commit() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    commit_put(&manager, "fresh", "v1");
    let other_client = cluster.transaction_manager();
    assert_eq!(committed_value(&other_client, "fresh"), Some(Value::from("v1")));
}

/// A transaction created before a commit but first used after it picks its
/// read time on first use.
#[test]
fn delayed_init_sees_earlier_commit() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let idle = manager.begin();
    commit_put(&manager, "late", 9);
    assert_eq!(idle.read("late").unwrap(), Some(Value::Int(9)));
}

/// T3's read time is picked, the clock moves past the skew bound, T1 commits.
/// T3 reads nothing of T1 and needs no restart; T2 started afterwards sees all.
#[test]
fn old_snapshot_skips_later_commit_without_restart() {
    let (cluster, clock) = frozen_cluster();
    let manager = cluster.transaction_manager();
    let keys = keys("skew", 6);

    let t3 = manager
        .begin_with(
            IsolationLevel::SnapshotIsolation,
            Some(manager.clock().read_time_now()),
        )
        .unwrap();
    clock.advance_micros(2 * cluster.config().max_clock_skew_us);

    let t1 = manager.begin();
    for key in &keys {
        t1.write(key.clone(), 1).unwrap();
    }
    t1.commit().wait().unwrap();

    assert_eq!(t3.read_many(&keys).unwrap(), vec![None; keys.len()]);
    for key in &keys {
        assert_eq!(t3.read(key.clone()).unwrap(), None);
    }
    assert_eq!(t3.restart_time(), None);

    let t2 = manager.begin();
    assert_eq!(t2.read_many(&keys).unwrap(), vec![Some(Value::Int(1)); keys.len()]);
}
