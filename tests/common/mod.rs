//! Shared test utilities for the integration suites.
//!
//! Import via `#[path = "../common/mod.rs"] mod common;` from a suite's main.rs.

#![allow(dead_code)]
#![allow(unused_imports)]

use std::sync::{Arc, Once};
use std::time::Duration;
pub use stratadb_txn::{
    ClientState, HybridTime, IsolationLevel, Key, LocalCluster, RetryConfig, Session,
    StrataError, Transaction, TransactionManager, TransactionStatus, TxnConfig, Value,
};
pub use strata_core::ManualClock;

/// Physical time frozen clusters start at
pub const FROZEN_START_US: u64 = 1_000_000_000;

/// Time to wait for background work to settle
pub const SETTLE: Duration = Duration::from_secs(10);

static INIT_TRACING: Once = Once::new();

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// Clusters
// ============================================================================

/// Three-tablet cluster on wall-clock time
pub fn cluster() -> Arc<LocalCluster> {
    cluster_with(TxnConfig::for_tests())
}

/// Three-tablet cluster on wall-clock time with `config`
pub fn cluster_with(config: TxnConfig) -> Arc<LocalCluster> {
    init_tracing();
    LocalCluster::start(3, config).expect("cluster should start")
}

/// Cluster whose physical time only moves when the test moves it
pub fn frozen_cluster() -> (Arc<LocalCluster>, Arc<ManualClock>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(FROZEN_START_US));
    let cluster = LocalCluster::builder()
        .tablets(3)
        .config(TxnConfig::for_tests())
        .physical_clock(clock.clone())
        .start()
        .expect("cluster should start");
    (cluster, clock)
}

// ============================================================================
// Helpers
// ============================================================================

/// Write `value` under `key` in its own transaction and commit
pub fn commit_put(manager: &TransactionManager, key: &str, value: impl Into<Value>) {
    let txn = manager.begin();
    txn.write(key, value).expect("write");
    txn.commit().wait().expect("commit");
}

/// Latest committed value of `key`, read in a fresh session
pub fn committed_value(manager: &TransactionManager, key: &str) -> Option<Value> {
    let session = Session::begin(manager);
    let value = session.read(key).expect("read");
    session.commit().expect("commit");
    value
}

/// Integer value of `key`, treating a missing key as zero
pub fn int_value(manager: &TransactionManager, key: &str) -> i64 {
    committed_value(manager, key)
        .and_then(|v| v.as_int())
        .unwrap_or(0)
}

/// Wait until every intent in the cluster has been applied or discarded
pub fn wait_for_no_intents(cluster: &Arc<LocalCluster>) {
    assert!(
        cluster.wait_for(SETTLE, |c| c.count_intents() == 0),
        "{} intents still outstanding",
        cluster.count_intents()
    );
}
