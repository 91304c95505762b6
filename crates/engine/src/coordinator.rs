//! Status coordinator hosted by every tablet
//!
//! Each tablet keeps a status table for the transactions that picked it as
//! their status tablet. A record moves `PENDING → COMMITTED` or
//! `PENDING → ABORTED` exactly once; terminal records never change again.
//!
//! The table is a sharded `DashMap` keyed by transaction id, so requests for
//! different transactions never serialize on a common lock. Nothing in here
//! performs an RPC: notifications to participants are handed out as
//! [`ApplyRequest`]s and delivered by the caller, which reports success back
//! through [`StatusCoordinator::ack_apply`].
//!
//! # Status time
//!
//! - While PENDING, every answer carries a fresh `now()` of this tablet's
//!   clock; the stored value only grows.
//! - Every request first advances the clock past the sender's propagated time.
//!   A commit time is picked from the same clock afterwards, so it is strictly
//!   greater than every PENDING time handed out before and every time any
//!   reader propagated while the transaction was PENDING.

use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::collections::BTreeSet;
use std::hash::BuildHasherDefault;
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{
    AbortReason, ApplyRequest, ClockRef, GetStatusRequest, HeartbeatRequest, HybridTime,
    StatusResponse, StatusUpdate, StrataError, StrataResult, TabletId, TransactionId,
    TransactionStatus, UpdateStatusRequest,
};
use tracing::{debug, info, warn};

use crate::config::TxnConfig;

type FxBuildHasher = BuildHasherDefault<FxHasher>;

/// Timing knobs of a coordinator, all in microseconds of its own clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    /// Lease granted by each heartbeat
    pub transaction_timeout_us: u64,
    /// Minimum gap between resends of one apply notification
    pub apply_retry_interval_us: u64,
    /// How long a fully acknowledged terminal record is kept
    pub retention_us: u64,
}

impl CoordinatorOptions {
    /// Options derived from the transaction layer config
    pub fn from_config(config: &TxnConfig) -> Self {
        Self {
            transaction_timeout_us: config.transaction_timeout_us(),
            apply_retry_interval_us: config.apply_retry_interval_us(),
            retention_us: config.status_retention_us(),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from_config(&TxnConfig::default())
    }
}

/// Status of one transaction as held by its status tablet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    /// Transaction identity
    pub transaction_id: TransactionId,
    /// Current status
    pub status: TransactionStatus,
    /// Last PENDING time handed out, or the commit/abort time once terminal
    pub status_time: HybridTime,
    /// Set when the status is ABORTED
    pub abort_reason: Option<AbortReason>,
    /// Tablets holding intents of this transaction
    pub participants: BTreeSet<TabletId>,
    /// Participants that have not acknowledged the terminal status yet
    pub unacked: BTreeSet<TabletId>,
    /// Physical time after which a PENDING record is aborted
    pub lease_deadline_us: u64,
    /// Physical time of the terminal transition
    pub terminal_at_us: Option<u64>,
    last_notified_us: Option<u64>,
}

impl StatusRecord {
    fn response(&self, propagated_time: HybridTime) -> StatusResponse {
        StatusResponse {
            transaction_id: self.transaction_id,
            status: self.status,
            status_time: self.status_time,
            abort_reason: self.abort_reason,
            propagated_time,
        }
    }

    fn apply_requests(&self, propagated_time: HybridTime) -> Vec<(TabletId, ApplyRequest)> {
        let commit_time = match self.status {
            TransactionStatus::Committed => Some(self.status_time),
            _ => None,
        };
        self.unacked
            .iter()
            .map(|tablet| {
                (
                    tablet.clone(),
                    ApplyRequest {
                        transaction_id: self.transaction_id,
                        status: self.status,
                        commit_time,
                        propagated_time,
                    },
                )
            })
            .collect()
    }
}

/// Counter snapshot of one coordinator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorMetrics {
    /// Records created by a registering heartbeat
    pub created: u64,
    /// Records that reached COMMITTED
    pub committed: u64,
    /// Records that reached ABORTED, expirations included
    pub aborted: u64,
    /// Aborts caused by a lapsed lease
    pub expired: u64,
    /// Records removed after every participant acknowledged
    pub retired: u64,
    /// Records currently held
    pub active: u64,
}

// Relaxed ordering: the counters are observational and synchronize nothing.
#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    expired: AtomicU64,
    retired: AtomicU64,
}

/// Status table of one tablet
#[derive(Debug)]
pub struct StatusCoordinator {
    tablet_id: TabletId,
    clock: ClockRef,
    options: CoordinatorOptions,
    records: DashMap<TransactionId, StatusRecord, FxBuildHasher>,
    counters: Counters,
}

impl StatusCoordinator {
    /// Empty status table for `tablet_id`
    pub fn new(tablet_id: TabletId, clock: ClockRef, options: CoordinatorOptions) -> Self {
        Self {
            tablet_id,
            clock,
            options,
            records: DashMap::with_hasher(FxBuildHasher::default()),
            counters: Counters::default(),
        }
    }

    /// Tablet hosting this table
    pub fn tablet_id(&self) -> &TabletId {
        &self.tablet_id
    }

    fn now_us(&self) -> u64 {
        self.clock.now().physical_micros()
    }

    fn not_found(transaction_id: TransactionId) -> StrataError {
        StrataError::NotFound { transaction_id }
    }

    /// Current status of a transaction
    pub fn get_status(&self, req: GetStatusRequest) -> StrataResult<StatusResponse> {
        self.clock.update(req.propagated_time);
        let mut record = self
            .records
            .get_mut(&req.transaction_id)
            .ok_or_else(|| Self::not_found(req.transaction_id))?;
        self.expire_if_lapsed(&mut record);
        if record.status == TransactionStatus::Pending {
            record.status_time = record.status_time.max(self.clock.now());
        }
        Ok(record.response(self.clock.now()))
    }

    /// Create (when registering) or keep alive a PENDING record
    ///
    /// Participants named in the request are added to the record. A record
    /// that already reached a terminal status is reported as is.
    pub fn heartbeat(&self, req: HeartbeatRequest) -> StrataResult<StatusResponse> {
        self.clock.update(req.propagated_time);
        let now = self.clock.now();
        let deadline = now
            .physical_micros()
            .saturating_add(self.options.transaction_timeout_us);

        if req.register {
            let created = match self.records.entry(req.transaction_id) {
                dashmap::mapref::entry::Entry::Occupied(_) => false,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(StatusRecord {
                        transaction_id: req.transaction_id,
                        status: TransactionStatus::Pending,
                        status_time: now,
                        abort_reason: None,
                        participants: BTreeSet::new(),
                        unacked: BTreeSet::new(),
                        lease_deadline_us: deadline,
                        terminal_at_us: None,
                        last_notified_us: None,
                    });
                    true
                }
            };
            if created {
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    target: "strata::coordinator",
                    tablet = %self.tablet_id,
                    txn_id = %req.transaction_id,
                    "Status record created"
                );
            }
        }

        let mut record = self
            .records
            .get_mut(&req.transaction_id)
            .ok_or_else(|| Self::not_found(req.transaction_id))?;
        self.expire_if_lapsed(&mut record);
        if record.status == TransactionStatus::Pending {
            record.lease_deadline_us = record.lease_deadline_us.max(deadline);
            record.participants.extend(req.participants);
            record.status_time = record.status_time.max(self.clock.now());
        }
        Ok(record.response(self.clock.now()))
    }

    /// Move a PENDING record to COMMITTED or ABORTED
    ///
    /// A record that is already terminal is left untouched and its status is
    /// returned, so retries and racing commit/abort requests all observe the
    /// one outcome that won. A commit whose lease lapsed turns into an abort.
    pub fn update_status(&self, req: UpdateStatusRequest) -> StrataResult<StatusResponse> {
        self.clock.update(req.propagated_time);
        if let Some(proposed) = req.proposed_commit_time {
            self.clock.update(proposed);
        }
        let mut record = self
            .records
            .get_mut(&req.transaction_id)
            .ok_or_else(|| Self::not_found(req.transaction_id))?;
        self.expire_if_lapsed(&mut record);
        if record.status.is_terminal() {
            debug!(
                target: "strata::coordinator",
                tablet = %self.tablet_id,
                txn_id = %req.transaction_id,
                status = %record.status,
                "Status update on terminal record ignored"
            );
            return Ok(record.response(self.clock.now()));
        }

        record.participants.extend(req.participants);
        match req.update {
            StatusUpdate::Commit => self.finish(&mut record, TransactionStatus::Committed, None),
            StatusUpdate::Abort(reason) => {
                self.finish(&mut record, TransactionStatus::Aborted, Some(reason))
            }
        }
        Ok(record.response(self.clock.now()))
    }

    fn expire_if_lapsed(&self, record: &mut StatusRecord) {
        if record.status == TransactionStatus::Pending && self.now_us() > record.lease_deadline_us
        {
            warn!(
                target: "strata::coordinator",
                tablet = %self.tablet_id,
                txn_id = %record.transaction_id,
                lease_deadline_us = record.lease_deadline_us,
                "Transaction lease lapsed, aborting"
            );
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            self.finish(record, TransactionStatus::Aborted, Some(AbortReason::Expired));
        }
    }

    fn finish(&self, record: &mut StatusRecord, status: TransactionStatus, reason: Option<AbortReason>) {
        let status_time = self.clock.now();
        record.status = status;
        record.status_time = status_time;
        record.abort_reason = reason;
        record.unacked = record.participants.clone();
        record.terminal_at_us = Some(status_time.physical_micros());
        record.last_notified_us = None;
        match status {
            TransactionStatus::Committed => {
                self.counters.committed.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "strata::coordinator",
                    tablet = %self.tablet_id,
                    txn_id = %record.transaction_id,
                    commit_time = %status_time,
                    participants = record.participants.len(),
                    "Transaction committed"
                );
            }
            _ => {
                self.counters.aborted.fetch_add(1, Ordering::Relaxed);
                info!(
                    target: "strata::coordinator",
                    tablet = %self.tablet_id,
                    txn_id = %record.transaction_id,
                    reason = ?reason,
                    "Transaction aborted"
                );
            }
        }
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Apply notifications for one terminal transaction, ignoring the resend gap
    pub fn notifications_for(&self, transaction_id: &TransactionId) -> Vec<(TabletId, ApplyRequest)> {
        let now = self.clock.now();
        match self.records.get_mut(transaction_id) {
            Some(mut record) if record.status.is_terminal() && !record.unacked.is_empty() => {
                record.last_notified_us = Some(now.physical_micros());
                record.apply_requests(now)
            }
            _ => Vec::new(),
        }
    }

    /// Apply notifications that are due for (re)sending
    pub fn pending_notifications(&self) -> Vec<(TabletId, ApplyRequest)> {
        let now = self.clock.now();
        let now_us = now.physical_micros();
        let mut out = Vec::new();
        for mut record in self.records.iter_mut() {
            if !record.status.is_terminal() || record.unacked.is_empty() {
                continue;
            }
            let due = record.last_notified_us.map_or(true, |last| {
                now_us.saturating_sub(last) >= self.options.apply_retry_interval_us
            });
            if due {
                record.last_notified_us = Some(now_us);
                out.extend(record.apply_requests(now));
            }
        }
        out
    }

    /// Record that `tablet` resolved the intents of `transaction_id`
    pub fn ack_apply(&self, transaction_id: &TransactionId, tablet: &TabletId) {
        if let Some(mut record) = self.records.get_mut(transaction_id) {
            record.unacked.remove(tablet);
        }
    }

    /// Abort every PENDING record whose lease lapsed; returns how many
    pub fn expire_stale(&self) -> usize {
        let mut expired = 0;
        for mut record in self.records.iter_mut() {
            let was_pending = record.status == TransactionStatus::Pending;
            self.expire_if_lapsed(&mut record);
            if was_pending && record.status.is_terminal() {
                expired += 1;
            }
        }
        expired
    }

    /// Remove terminal records that every participant acknowledged and that
    /// outlived the retention period; returns how many
    pub fn retire(&self) -> usize {
        let now_us = self.now_us();
        let retention = self.options.retention_us;
        let before = self.records.len();
        self.records.retain(|_, record| {
            let done = record.status.is_terminal()
                && record.unacked.is_empty()
                && record
                    .terminal_at_us
                    .map_or(false, |at| now_us.saturating_sub(at) >= retention);
            !done
        });
        let retired = before.saturating_sub(self.records.len());
        if retired > 0 {
            self.counters
                .retired
                .fetch_add(retired as u64, Ordering::Relaxed);
            debug!(
                target: "strata::coordinator",
                tablet = %self.tablet_id,
                retired,
                "Retired status records"
            );
        }
        retired
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Number of records held
    pub fn count_transactions(&self) -> usize {
        self.records.len()
    }

    /// Copy of the record of `transaction_id`
    pub fn record(&self, transaction_id: &TransactionId) -> Option<StatusRecord> {
        self.records.get(transaction_id).map(|r| r.clone())
    }

    /// Counter snapshot
    pub fn metrics(&self) -> CoordinatorMetrics {
        CoordinatorMetrics {
            created: self.counters.created.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            active: self.records.len() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use strata_core::{HybridClock, ManualClock};

    const TIMEOUT_US: u64 = 1_000;

    fn coordinator() -> (Arc<ManualClock>, StatusCoordinator) {
        let physical = Arc::new(ManualClock::new(1_000_000));
        let clock: ClockRef = Arc::new(HybridClock::new(physical.clone(), 100));
        let coordinator = StatusCoordinator::new(
            TabletId::new("status"),
            clock,
            CoordinatorOptions {
                transaction_timeout_us: TIMEOUT_US,
                apply_retry_interval_us: 50,
                retention_us: 200,
            },
        );
        (physical, coordinator)
    }

    fn register(c: &StatusCoordinator, id: TransactionId, participants: &[&str]) -> StatusResponse {
        c.heartbeat(HeartbeatRequest {
            transaction_id: id,
            register: true,
            participants: participants.iter().map(|p| TabletId::new(*p)).collect(),
            propagated_time: HybridTime::MIN,
        })
        .unwrap()
    }

    fn status(c: &StatusCoordinator, id: TransactionId, propagated: HybridTime) -> StrataResult<StatusResponse> {
        c.get_status(GetStatusRequest {
            transaction_id: id,
            propagated_time: propagated,
        })
    }

    fn update(c: &StatusCoordinator, id: TransactionId, update: StatusUpdate) -> StrataResult<StatusResponse> {
        c.update_status(UpdateStatusRequest {
            transaction_id: id,
            update,
            participants: BTreeSet::new(),
            proposed_commit_time: None,
            propagated_time: HybridTime::MIN,
        })
    }

    #[test]
    fn test_unknown_transaction_not_found() {
        let (_, c) = coordinator();
        let id = TransactionId::new();
        assert!(status(&c, id, HybridTime::MIN).unwrap_err().is_not_found());
        assert!(update(&c, id, StatusUpdate::Commit).unwrap_err().is_not_found());
        let err = c
            .heartbeat(HeartbeatRequest {
                transaction_id: id,
                register: false,
                participants: BTreeSet::new(),
                propagated_time: HybridTime::MIN,
            })
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_commit_time_exceeds_propagated_pending_time() {
        let (_, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &["t1"]);
        let far = HybridTime::from_micros(5_000_000);
        let pending = status(&c, id, far).unwrap();
        assert_eq!(pending.status, TransactionStatus::Pending);
        assert!(pending.status_time > far);

        let committed = update(&c, id, StatusUpdate::Commit).unwrap();
        assert_eq!(committed.status, TransactionStatus::Committed);
        assert!(committed.status_time > pending.status_time);
    }

    #[test]
    fn test_terminal_status_is_stable() {
        let (physical, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &[]);
        let committed = update(&c, id, StatusUpdate::Commit).unwrap();

        let again = update(&c, id, StatusUpdate::Abort(AbortReason::Client)).unwrap();
        assert_eq!(again.status, TransactionStatus::Committed);
        assert_eq!(again.status_time, committed.status_time);

        physical.advance_micros(10 * TIMEOUT_US);
        let later = status(&c, id, HybridTime::MIN).unwrap();
        assert_eq!(later.status, TransactionStatus::Committed);
        assert_eq!(later.status_time, committed.status_time);
    }

    #[test]
    fn test_lapsed_lease_turns_commit_into_expiry() {
        let (physical, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &["t1"]);
        physical.advance_micros(TIMEOUT_US + 1);
        let resp = update(&c, id, StatusUpdate::Commit).unwrap();
        assert_eq!(resp.status, TransactionStatus::Aborted);
        assert_eq!(resp.abort_reason, Some(AbortReason::Expired));
        assert_eq!(c.metrics().expired, 1);
    }

    #[test]
    fn test_heartbeat_extends_lease() {
        let (physical, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &[]);
        for _ in 0..5 {
            physical.advance_micros(TIMEOUT_US / 2);
            let resp = c
                .heartbeat(HeartbeatRequest {
                    transaction_id: id,
                    register: false,
                    participants: BTreeSet::new(),
                    propagated_time: HybridTime::MIN,
                })
                .unwrap();
            assert_eq!(resp.status, TransactionStatus::Pending);
        }
        assert_eq!(c.expire_stale(), 0);
        physical.advance_micros(TIMEOUT_US + 1);
        assert_eq!(c.expire_stale(), 1);
        assert_eq!(
            c.record(&id).unwrap().abort_reason,
            Some(AbortReason::Expired)
        );
    }

    #[test]
    fn test_notifications_until_acknowledged_then_retire() {
        let (physical, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &["t1", "t2"]);
        let committed = update(&c, id, StatusUpdate::Commit).unwrap();

        let first = c.notifications_for(&id);
        assert_eq!(first.len(), 2);
        assert!(first
            .iter()
            .all(|(_, req)| req.commit_time == Some(committed.status_time)));

        // Resend gap not reached yet
        assert!(c.pending_notifications().is_empty());
        c.ack_apply(&id, &TabletId::new("t1"));
        physical.advance_micros(60);
        let resent = c.pending_notifications();
        assert_eq!(resent.len(), 1);
        assert_eq!(resent[0].0, TabletId::new("t2"));

        // Unacknowledged records are never retired
        physical.advance_micros(1_000);
        assert_eq!(c.retire(), 0);
        c.ack_apply(&id, &TabletId::new("t2"));
        assert_eq!(c.retire(), 1);
        assert_eq!(c.count_transactions(), 0);
        assert_eq!(c.metrics().retired, 1);
    }

    #[test]
    fn test_retention_delays_retirement() {
        let (physical, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &[]);
        update(&c, id, StatusUpdate::Abort(AbortReason::Client)).unwrap();
        assert_eq!(c.retire(), 0);
        physical.advance_micros(250);
        assert_eq!(c.retire(), 1);
    }

    #[test]
    fn test_register_is_idempotent() {
        let (_, c) = coordinator();
        let id = TransactionId::new();
        register(&c, id, &["t1"]);
        register(&c, id, &["t2"]);
        let record = c.record(&id).unwrap();
        assert_eq!(record.participants.len(), 2);
        assert_eq!(c.metrics().created, 1);
    }

    proptest! {
        #[test]
        fn prop_status_time_monotonic(ops in proptest::collection::vec((0u8..4, 0u64..2_000), 1..40)) {
            let (physical, c) = coordinator();
            let id = TransactionId::new();
            register(&c, id, &["t1"]);
            let mut last = HybridTime::MIN;
            let mut terminal: Option<StatusResponse> = None;
            for (op, step) in ops {
                physical.advance_micros(step / 4);
                let resp = match op {
                    0 => status(&c, id, HybridTime::from_micros(1_000_000 + step)),
                    1 => c.heartbeat(HeartbeatRequest {
                        transaction_id: id,
                        register: false,
                        participants: BTreeSet::new(),
                        propagated_time: HybridTime::MIN,
                    }),
                    2 => update(&c, id, StatusUpdate::Commit),
                    _ => update(&c, id, StatusUpdate::Abort(AbortReason::Client)),
                }
                .unwrap();
                prop_assert!(resp.status_time >= last);
                last = resp.status_time;
                match &terminal {
                    Some(t) => {
                        prop_assert_eq!(resp.status, t.status);
                        prop_assert_eq!(resp.status_time, t.status_time);
                    }
                    None if resp.status.is_terminal() => terminal = Some(resp),
                    None => {}
                }
            }
        }
    }
}
