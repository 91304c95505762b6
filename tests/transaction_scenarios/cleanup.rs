//! Intent cleanup when apply notifications get lost

use crate::common::*;

fn write_keys(manager: &TransactionManager, prefix: &str, n: usize) -> Transaction {
    let txn = manager.begin();
    for i in 0..n {
        txn.write(format!("{}-{}", prefix, i), i as i64).unwrap();
    }
    txn
}

/// Lost apply notifications are re-sent by the sweep until acknowledged.
#[test]
fn lost_applies_are_resent() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    cluster.set_apply_drop_probability(0.8);

    for round in 0..5 {
        let txn = write_keys(&manager, &format!("resend-{}", round), 6);
        txn.commit().wait().unwrap();
    }
    wait_for_no_intents(&cluster);
    assert!(cluster.dropped_applies() > 0);

    cluster.set_apply_drop_probability(0.0);
    assert!(cluster.wait_for(SETTLE, |c| !c.has_transactions()));
}

/// With every notification lost, compaction asks the status tablet and
/// discards the intents of an aborted transaction.
#[test]
fn compaction_discards_aborted_intents() {
    let cluster = cluster_with(TxnConfig {
        aborted_intent_cleanup_ms: 100,
        ..TxnConfig::for_tests()
    });
    let manager = cluster.transaction_manager();
    cluster.set_apply_drop_probability(1.0);

    let txn = write_keys(&manager, "compact-abort", 6);
    let intents = cluster.count_intents();
    assert_eq!(intents, 6);
    txn.abort().wait().unwrap();

    wait_for_no_intents(&cluster);
    let discarded: u64 = cluster
        .tablets()
        .iter()
        .map(|t| t.participant().stats().discarded_intents)
        .sum();
    assert_eq!(discarded, intents as u64);

    cluster.set_apply_drop_probability(0.0);
    assert!(cluster.wait_for(SETTLE, |c| !c.has_transactions()));
}

/// With every notification lost, compaction applies a committed
/// transaction's intents.
#[test]
fn compaction_applies_committed_intents() {
    let cluster = cluster_with(TxnConfig {
        aborted_intent_cleanup_ms: 100,
        ..TxnConfig::for_tests()
    });
    let manager = cluster.transaction_manager();
    cluster.set_apply_drop_probability(1.0);

    let txn = write_keys(&manager, "compact-commit", 6);
    txn.commit().wait().unwrap();
    wait_for_no_intents(&cluster);

    let applied: u64 = cluster
        .tablets()
        .iter()
        .map(|t| t.participant().stats().applied_intents)
        .sum();
    assert_eq!(applied, 6);
    for i in 0..6 {
        assert_eq!(
            committed_value(&manager, &format!("compact-commit-{}", i)),
            Some(Value::Int(i as i64))
        );
    }
}

/// Dropping an unfinished transaction aborts it in the background.
#[test]
fn dropped_transaction_is_aborted() {
    let cluster = cluster();
    let manager = cluster.transaction_manager();
    drop(write_keys(&manager, "dropped", 4));
    wait_for_no_intents(&cluster);
    assert_eq!(committed_value(&manager, "dropped-0"), None);
    assert_eq!(manager.metrics().total_aborted, 1);
}
