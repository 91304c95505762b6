//! Write-write conflicts under contention
//!
//! Concurrent read-modify-write transactions retried through
//! `Session::run_with_retry` must never lose an update.

use crate::common::*;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn contended_retry() -> RetryConfig {
    RetryConfig::transactions(200)
        .with_backoff(Duration::from_millis(1), Duration::from_millis(20))
}

/// N threads increment one counter M times each; the final value is N * M.
#[test]
fn concurrent_increments_lose_nothing() {
    let cluster = cluster();
    let threads = 4;
    let increments = 5;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let manager = cluster.transaction_manager();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..increments {
                    Session::run_with_retry(&manager, &contended_retry(), |s| {
                        let n = s.read("counter")?.and_then(|v| v.as_int()).unwrap_or(0);
                        s.write("counter", n + 1)
                    })
                    .expect("increment should eventually commit");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let manager = cluster.transaction_manager();
    assert_eq!(int_value(&manager, "counter"), (threads * increments) as i64);
}

/// Transfers between accounts on different tablets conserve the total.
#[test]
fn concurrent_transfers_conserve_total() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let accounts = ["acct-a", "acct-b", "acct-c"];
    for account in accounts {
        commit_put(&manager, account, 1_000);
    }

    let threads = 3;
    let transfers = 5;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let manager = cluster.transaction_manager();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 0..transfers {
                    let from = accounts[(t + i) % accounts.len()];
                    let to = accounts[(t + i + 1) % accounts.len()];
                    Session::run_with_retry(&manager, &contended_retry(), |s| {
                        let a = s.read(from)?.and_then(|v| v.as_int()).unwrap_or(0);
                        let b = s.read(to)?.and_then(|v| v.as_int()).unwrap_or(0);
                        s.write(from, a - 10)?;
                        s.write(to, b + 10)
                    })
                    .expect("transfer should eventually commit");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let total: i64 = accounts.iter().map(|a| int_value(&manager, a)).sum();
    assert_eq!(total, 3_000);
    wait_for_no_intents(&cluster);
}

/// A transaction that lost a conflict cannot commit.
#[test]
fn conflict_loser_cannot_commit() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    let first = manager.begin();
    let second = manager.begin();
    first.write("contended", 1).unwrap();

    match second.write("contended", 2) {
        // The second writer lost: it is aborted, the first commits
        Err(e) => {
            assert!(e.is_retryable(), "got {:?}", e);
            assert_eq!(second.state(), ClientState::Aborted);
            first.commit().wait().unwrap();
            assert_eq!(committed_value(&manager, "contended"), Some(Value::Int(1)));
        }
        // The second writer won: the first was aborted at its coordinator
        Ok(()) => {
            let err = first.commit().wait().unwrap_err();
            assert!(err.is_retryable(), "got {:?}", err);
            second.commit().wait().unwrap();
            assert_eq!(committed_value(&manager, "contended"), Some(Value::Int(2)));
        }
    }
}

/// Writing over a version committed after the snapshot conflicts.
#[test]
fn write_over_newer_commit_conflicts() {
    let (cluster, _clock) = frozen_cluster();
    let manager = cluster.transaction_manager();
    let stale = manager
        .begin_with(
            IsolationLevel::SnapshotIsolation,
            Some(manager.clock().read_time_now()),
        )
        .unwrap();
    commit_put(&manager, "row", 1);

    let err = stale.write("row", 2).unwrap_err();
    assert!(matches!(err, StrataError::Conflict { .. }), "got {:?}", err);
    assert_eq!(committed_value(&manager, "row"), Some(Value::Int(1)));
}
