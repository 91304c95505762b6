//! Factory for transactions sharing one transport, clock and scheduler

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use strata_concurrency::{BackgroundScheduler, ConflictResolver};
use strata_core::{
    ChildTransactionData, ClockRef, IsolationLevel, ReadHybridTime, StrataResult, TransactionRpc,
};

use super::handle::Transaction;
use crate::config::TxnConfig;

/// State every transaction of one manager shares
pub(crate) struct ManagerShared {
    pub(crate) rpc: Arc<dyn TransactionRpc>,
    pub(crate) clock: ClockRef,
    pub(crate) scheduler: Arc<BackgroundScheduler>,
    pub(crate) config: TxnConfig,
    pub(crate) resolver: ConflictResolver,
    pub(crate) counters: Counters,
}

impl fmt::Debug for ManagerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerShared")
            .field("clock", &self.clock)
            .field("config", &self.config)
            .finish()
    }
}

/// Transaction counters
///
/// Relaxed ordering throughout: the values are observational only and
/// approximate counts are acceptable.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    active: AtomicU64,
    started: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    restarts: AtomicU64,
}

impl Counters {
    pub(crate) fn record_start(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.finish();
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.finish();
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_restart(&self) {
        self.restarts.fetch_add(1, Ordering::Relaxed);
    }

    fn finish(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                Some(x.saturating_sub(1))
            });
    }
}

/// Transaction metrics
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionMetrics {
    /// Transactions initialized and not yet finished
    pub active_count: u64,
    /// Total transactions initialized
    pub total_started: u64,
    /// Total transactions committed
    pub total_committed: u64,
    /// Total transactions aborted, for any reason
    pub total_aborted: u64,
    /// Read restarts performed
    pub total_restarts: u64,
    /// Commit success rate (committed / started)
    pub commit_rate: f64,
}

impl TransactionMetrics {
    /// Total transactions that completed (committed + aborted)
    pub fn total_completed(&self) -> u64 {
        self.total_committed + self.total_aborted
    }

    /// Abort rate (aborted / started)
    pub fn abort_rate(&self) -> f64 {
        if self.total_started > 0 {
            self.total_aborted as f64 / self.total_started as f64
        } else {
            0.0
        }
    }
}

/// Creates transactions over one transport
///
/// Cloning is cheap; clones share the transport, clock, scheduler and metrics.
#[derive(Debug, Clone)]
pub struct TransactionManager {
    shared: Arc<ManagerShared>,
}

impl TransactionManager {
    /// Manager over `rpc`, picking times from `clock`
    pub fn new(
        rpc: Arc<dyn TransactionRpc>,
        clock: ClockRef,
        scheduler: Arc<BackgroundScheduler>,
        config: TxnConfig,
        resolver: ConflictResolver,
    ) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                rpc,
                clock,
                scheduler,
                config,
                resolver,
                counters: Counters::default(),
            }),
        }
    }

    /// New transaction; initialized lazily on first use
    pub fn begin(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.shared), 0)
    }

    /// New transaction for retry number `attempt` of some work
    ///
    /// Later attempts get higher priorities, so a retried transaction
    /// eventually wins conflict resolution.
    pub fn begin_attempt(&self, attempt: u32) -> Transaction {
        Transaction::new(Arc::clone(&self.shared), attempt)
    }

    /// New transaction initialized right away, optionally at a given read time
    pub fn begin_with(
        &self,
        isolation: IsolationLevel,
        read_time: Option<ReadHybridTime>,
    ) -> StrataResult<Transaction> {
        let txn = self.begin();
        txn.init(isolation, read_time)?;
        Ok(txn)
    }

    /// Child transaction observing the snapshot described by `data`
    pub fn child(&self, data: ChildTransactionData) -> StrataResult<Transaction> {
        Transaction::child(Arc::clone(&self.shared), data)
    }

    /// Transport
    pub fn rpc(&self) -> &Arc<dyn TransactionRpc> {
        &self.shared.rpc
    }

    /// Clock read times are picked from
    pub fn clock(&self) -> &ClockRef {
        &self.shared.clock
    }

    /// Config
    pub fn config(&self) -> &TxnConfig {
        &self.shared.config
    }

    /// Metrics snapshot
    pub fn metrics(&self) -> TransactionMetrics {
        let c = &self.shared.counters;
        let started = c.started.load(Ordering::Relaxed);
        let committed = c.committed.load(Ordering::Relaxed);
        TransactionMetrics {
            active_count: c.active.load(Ordering::Relaxed),
            total_started: started,
            total_committed: committed,
            total_aborted: c.aborted.load(Ordering::Relaxed),
            total_restarts: c.restarts.load(Ordering::Relaxed),
            commit_rate: if started > 0 {
                committed as f64 / started as f64
            } else {
                0.0
            },
        }
    }
}
