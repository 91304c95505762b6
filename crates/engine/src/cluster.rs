//! In-process cluster of tablets
//!
//! [`LocalCluster`] implements [`TransactionRpc`] by calling straight into
//! its tablets, which makes it both the transport for clients and the
//! transport participants use to query and abort other transactions.
//!
//! Background work runs on one [`BackgroundScheduler`]:
//! - apply notifications sent right after a status becomes terminal
//! - a periodic sweep that expires abandoned transactions, re-sends
//!   unacknowledged notifications, compacts stale intents and retires
//!   status records
//!
//! Faults for tests: apply notifications can be dropped with a probability,
//! and a number of upcoming status updates can be made to fail.

use parking_lot::Mutex;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use strata_concurrency::{
    BackgroundScheduler, ConflictResolver, EscalatingRandomPriority, PriorityPolicy, Repeat,
    TaskHandle, TaskPriority,
};
use strata_core::{
    ApplyRequest, ClockRef, GetStatusRequest, HeartbeatRequest, HybridClock, Key, PhysicalClock,
    ReadRequest, ReadResponse, SkewedClock, StatusResponse, StrataError, StrataResult,
    SystemClock, TabletId, TransactionId, TransactionRpc, UpdateStatusRequest, WriteRequest,
    WriteResponse,
};
use tracing::{debug, info, warn};

use crate::config::TxnConfig;
use crate::tablet::Tablet;
use crate::transaction::TransactionManager;

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`LocalCluster`]
///
/// ```ignore
/// let cluster = LocalCluster::builder()
///     .tablets(3)
///     .config(TxnConfig::for_tests())
///     .start()?;
/// let manager = cluster.transaction_manager();
/// ```
#[derive(Debug, Clone)]
pub struct ClusterBuilder {
    tablets: usize,
    config: TxnConfig,
    physical: Option<Arc<dyn PhysicalClock>>,
    policy: Option<Arc<dyn PriorityPolicy>>,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            tablets: 3,
            config: TxnConfig::default(),
            physical: None,
            policy: None,
        }
    }
}

impl ClusterBuilder {
    /// Number of tablets
    pub fn tablets(mut self, tablets: usize) -> Self {
        self.tablets = tablets;
        self
    }

    /// Transaction layer config
    pub fn config(mut self, config: TxnConfig) -> Self {
        self.config = config;
        self
    }

    /// Physical clock every node starts from; defaults to wall-clock time
    pub fn physical_clock(mut self, physical: Arc<dyn PhysicalClock>) -> Self {
        self.physical = Some(physical);
        self
    }

    /// Priority policy; defaults to [`EscalatingRandomPriority`]
    pub fn priority_policy(mut self, policy: Arc<dyn PriorityPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Build the cluster and start its sweep
    pub fn start(self) -> StrataResult<Arc<LocalCluster>> {
        if self.tablets == 0 {
            return Err(StrataError::invalid_input("cluster needs at least one tablet"));
        }
        self.config.validate()?;

        let base = self.physical.unwrap_or_else(|| Arc::new(SystemClock));
        let resolver = ConflictResolver::new(
            self.policy
                .unwrap_or_else(|| Arc::new(EscalatingRandomPriority)),
        );
        let scheduler = Arc::new(BackgroundScheduler::new(
            self.config.scheduler_threads,
            self.config.max_queue_depth,
        )?);

        let tablets: Vec<Arc<Tablet>> = (0..self.tablets)
            .map(|i| {
                Arc::new(Tablet::new(
                    TabletId::new(format!("tablet-{}", i)),
                    Arc::clone(&base),
                    &self.config,
                    resolver.clone(),
                ))
            })
            .collect();
        let index = tablets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id().clone(), i))
            .collect();
        let client_physical = Arc::new(SkewedClock::new(Arc::clone(&base)));
        let client_clock: ClockRef = Arc::new(HybridClock::new(
            client_physical.clone(),
            self.config.max_clock_skew_us,
        ));

        let config = self.config;
        let cluster = Arc::new_cyclic(|self_ref| LocalCluster {
            self_ref: self_ref.clone(),
            config,
            base,
            tablets,
            index,
            client_physical,
            client_clock,
            scheduler,
            resolver,
            next_status_tablet: AtomicUsize::new(0),
            faults: Faults::default(),
            sweep: Mutex::new(None),
        });
        cluster.start_sweep()?;
        info!(
            target: "strata::cluster",
            tablets = cluster.tablets.len(),
            max_clock_skew_us = cluster.config.max_clock_skew_us,
            "Local cluster started"
        );
        Ok(cluster)
    }
}

// ============================================================================
// Cluster
// ============================================================================

#[derive(Debug, Default)]
struct Faults {
    apply_drop_probability: Mutex<f64>,
    failing_status_updates: AtomicUsize,
    dropped_applies: AtomicU64,
}

/// Outcome of one sweep over every tablet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// PENDING transactions aborted for a lapsed lease
    pub expired: usize,
    /// Apply notifications sent
    pub notifications_sent: usize,
    /// Apply notifications acknowledged
    pub notifications_acked: usize,
    /// Stale intents applied by compaction
    pub compacted_applied: usize,
    /// Stale intents discarded by compaction
    pub compacted_discarded: usize,
    /// Status records removed
    pub retired: usize,
}

/// A set of tablets in one process, wired together as a transport
pub struct LocalCluster {
    self_ref: Weak<LocalCluster>,
    config: TxnConfig,
    base: Arc<dyn PhysicalClock>,
    tablets: Vec<Arc<Tablet>>,
    index: FxHashMap<TabletId, usize>,
    client_physical: Arc<SkewedClock>,
    client_clock: ClockRef,
    scheduler: Arc<BackgroundScheduler>,
    resolver: ConflictResolver,
    next_status_tablet: AtomicUsize,
    faults: Faults,
    sweep: Mutex<Option<TaskHandle>>,
}

impl LocalCluster {
    /// Start configuring a cluster
    pub fn builder() -> ClusterBuilder {
        ClusterBuilder::default()
    }

    /// Cluster of `tablets` tablets on wall-clock time
    pub fn start(tablets: usize, config: TxnConfig) -> StrataResult<Arc<Self>> {
        Self::builder().tablets(tablets).config(config).start()
    }

    fn start_sweep(&self) -> StrataResult<()> {
        let weak = self.self_ref.clone();
        let handle = self.scheduler.schedule_periodic(
            TaskPriority::Low,
            self.config.status_sweep_interval(),
            move || match weak.upgrade() {
                Some(cluster) => {
                    cluster.sweep_now();
                    Repeat::Continue
                }
                None => Repeat::Stop,
            },
        )?;
        *self.sweep.lock() = Some(handle);
        Ok(())
    }

    // ========================================================================
    // Clients
    // ========================================================================

    /// Transaction manager using the cluster's client clock
    pub fn transaction_manager(self: &Arc<Self>) -> TransactionManager {
        self.manager_with_clock(Arc::clone(&self.client_clock))
    }

    /// Transaction manager whose clock is offset by `delta_us` from the
    /// cluster's physical time
    ///
    /// A manager with a lagging clock picks read times in the past, which is
    /// how read restarts are provoked in tests.
    pub fn transaction_manager_with_delta(self: &Arc<Self>, delta_us: i64) -> TransactionManager {
        let physical = Arc::new(SkewedClock::new(Arc::clone(&self.base)));
        physical.set_delta_us(delta_us);
        let clock: ClockRef = Arc::new(HybridClock::new(physical, self.config.max_clock_skew_us));
        self.manager_with_clock(clock)
    }

    fn manager_with_clock(self: &Arc<Self>, clock: ClockRef) -> TransactionManager {
        let rpc: Arc<dyn TransactionRpc> = Arc::clone(self) as Arc<dyn TransactionRpc>;
        TransactionManager::new(
            rpc,
            clock,
            Arc::clone(&self.scheduler),
            self.config.clone(),
            self.resolver.clone(),
        )
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Config the cluster runs with
    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    /// All tablets, in creation order
    pub fn tablets(&self) -> &[Arc<Tablet>] {
        &self.tablets
    }

    /// Tablet by id
    pub fn tablet(&self, id: &TabletId) -> StrataResult<&Arc<Tablet>> {
        self.index
            .get(id)
            .and_then(|i| self.tablets.get(*i))
            .ok_or_else(|| StrataError::invalid_input(format!("unknown tablet {}", id)))
    }

    /// Physical clock behind the default client clock
    pub fn client_physical_clock(&self) -> &Arc<SkewedClock> {
        &self.client_physical
    }

    /// Default client clock
    pub fn client_clock(&self) -> &ClockRef {
        &self.client_clock
    }

    /// Scheduler running the cluster's background work
    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    /// Whether any tablet still holds a status record
    pub fn has_transactions(&self) -> bool {
        self.tablets
            .iter()
            .any(|t| t.coordinator().count_transactions() > 0)
    }

    /// Status records held across all tablets
    pub fn count_transactions(&self) -> usize {
        self.tablets
            .iter()
            .map(|t| t.coordinator().count_transactions())
            .sum()
    }

    /// Intents held across all tablets
    pub fn count_intents(&self) -> usize {
        self.tablets
            .iter()
            .map(|t| t.participant().intent_count())
            .sum()
    }

    // ========================================================================
    // Faults
    // ========================================================================

    /// Drop apply notifications with probability `p` (clamped to `[0, 1]`)
    pub fn set_apply_drop_probability(&self, p: f64) {
        *self.faults.apply_drop_probability.lock() = p.clamp(0.0, 1.0);
    }

    /// Apply notifications dropped so far
    pub fn dropped_applies(&self) -> u64 {
        self.faults.dropped_applies.load(Ordering::Relaxed)
    }

    /// Make the next `n` status updates fail with a network error
    pub fn fail_next_status_updates(&self, n: usize) {
        self.faults.failing_status_updates.store(n, Ordering::SeqCst);
    }

    fn take_status_update_fault(&self) -> bool {
        self.faults
            .failing_status_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn should_drop_apply(&self) -> bool {
        let p = *self.faults.apply_drop_probability.lock();
        p > 0.0 && rand::thread_rng().gen_bool(p)
    }

    // ========================================================================
    // Background work
    // ========================================================================

    fn deliver(&self, status_tablet: &TabletId, tablet: &TabletId, req: ApplyRequest) -> bool {
        let transaction_id = req.transaction_id;
        match self.apply(tablet, req) {
            Ok(()) => {
                if let Ok(status) = self.tablet(status_tablet) {
                    status.coordinator().ack_apply(&transaction_id, tablet);
                }
                true
            }
            Err(e) => {
                debug!(
                    target: "strata::cluster",
                    txn_id = %transaction_id,
                    tablet = %tablet,
                    error = %e,
                    "Apply notification not delivered"
                );
                false
            }
        }
    }

    fn notify_participants(&self, status_tablet: &TabletId, transaction_id: &TransactionId) {
        let Ok(status) = self.tablet(status_tablet) else {
            return;
        };
        let notifications = status.coordinator().notifications_for(transaction_id);
        if notifications.is_empty() {
            return;
        }
        let weak = self.self_ref.clone();
        let status_tablet = status_tablet.clone();
        let submitted = self.scheduler.submit(TaskPriority::Normal, move || {
            if let Some(cluster) = weak.upgrade() {
                for (tablet, req) in notifications {
                    cluster.deliver(&status_tablet, &tablet, req);
                }
            }
        });
        if submitted.is_err() {
            // The sweep re-sends whatever stays unacknowledged
            warn!(
                target: "strata::cluster",
                txn_id = %transaction_id,
                "Scheduler full, apply notifications deferred to sweep"
            );
        }
    }

    /// Run one sweep over every tablet now
    pub fn sweep_now(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        for tablet in &self.tablets {
            stats.expired += tablet.coordinator().expire_stale();
        }
        for tablet in &self.tablets {
            for (target, req) in tablet.coordinator().pending_notifications() {
                stats.notifications_sent += 1;
                if self.deliver(tablet.id(), &target, req) {
                    stats.notifications_acked += 1;
                }
            }
        }
        for tablet in &self.tablets {
            let compaction = tablet.participant().compact(self);
            stats.compacted_applied += compaction.applied_intents;
            stats.compacted_discarded += compaction.discarded_intents;
        }
        for tablet in &self.tablets {
            stats.retired += tablet.coordinator().retire();
        }
        if stats != SweepStats::default() {
            debug!(
                target: "strata::cluster",
                expired = stats.expired,
                sent = stats.notifications_sent,
                acked = stats.notifications_acked,
                retired = stats.retired,
                "Sweep finished"
            );
        }
        stats
    }

    /// Poll `condition` until it holds or `timeout` passes
    pub fn wait_for(&self, timeout: Duration, mut condition: impl FnMut(&Self) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if condition(self) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Stop the sweep and the scheduler
    pub fn shutdown(&self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.cancel();
        }
        self.scheduler.shutdown();
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        if let Some(handle) = self.sweep.lock().take() {
            handle.cancel();
        }
    }
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("tablets", &self.tablets.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl TransactionRpc for LocalCluster {
    fn get_status(&self, tablet: &TabletId, req: GetStatusRequest) -> StrataResult<StatusResponse> {
        self.tablet(tablet)?.coordinator().get_status(req)
    }

    fn update_status(
        &self,
        tablet: &TabletId,
        req: UpdateStatusRequest,
    ) -> StrataResult<StatusResponse> {
        if self.take_status_update_fault() {
            return Err(StrataError::network(format!(
                "injected failure updating status on {}",
                tablet
            )));
        }
        let resp = self.tablet(tablet)?.coordinator().update_status(req)?;
        if resp.status.is_terminal() {
            self.notify_participants(tablet, &resp.transaction_id);
        }
        Ok(resp)
    }

    fn heartbeat(&self, tablet: &TabletId, req: HeartbeatRequest) -> StrataResult<StatusResponse> {
        self.tablet(tablet)?.coordinator().heartbeat(req)
    }

    fn read(&self, tablet: &TabletId, req: ReadRequest) -> StrataResult<ReadResponse> {
        self.tablet(tablet)?.participant().read(req, self)
    }

    fn write(&self, tablet: &TabletId, req: WriteRequest) -> StrataResult<WriteResponse> {
        self.tablet(tablet)?.participant().write(req, self)
    }

    fn apply(&self, tablet: &TabletId, req: ApplyRequest) -> StrataResult<()> {
        if self.should_drop_apply() {
            self.faults.dropped_applies.fetch_add(1, Ordering::Relaxed);
            return Err(StrataError::network(format!(
                "apply of {} to {} dropped",
                req.transaction_id, tablet
            )));
        }
        self.tablet(tablet)?.participant().apply(req)
    }

    fn tablet_for_key(&self, key: &Key) -> StrataResult<TabletId> {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        let i = (hasher.finish() % self.tablets.len() as u64) as usize;
        Ok(self.tablets[i].id().clone())
    }

    fn pick_status_tablet(&self) -> StrataResult<TabletId> {
        let i = self.next_status_tablet.fetch_add(1, Ordering::Relaxed) % self.tablets.len();
        Ok(self.tablets[i].id().clone())
    }
}
