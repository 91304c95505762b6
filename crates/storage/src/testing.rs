//! Test doubles for exercising a participant without a cluster
//!
//! [`StubStatusRpc`] answers status queries and status updates from an
//! in-memory table and records what it was asked. Participant traffic
//! (reads, writes, applies, routing) is not supported and returns an error.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use strata_concurrency::MAX_TRANSACTION_PRIORITY;
use strata_core::{
    AbortReason, ApplyRequest, ClockRef, GetStatusRequest, HeartbeatRequest, HybridTime, Key,
    ReadRequest, ReadResponse, StatusResponse, StatusUpdate, StrataError, StrataResult, TabletId,
    TransactionId, TransactionRpc, TransactionStatus, UpdateStatusRequest, WriteRequest,
    WriteResponse,
};

/// Highest priority a test transaction can use
pub const TOP_PRIORITY: u64 = MAX_TRANSACTION_PRIORITY;

#[derive(Debug, Clone, Copy)]
struct Entry {
    status: TransactionStatus,
    status_time: HybridTime,
    abort_reason: Option<AbortReason>,
}

/// In-memory status table standing in for status tablets
#[derive(Debug)]
pub struct StubStatusRpc {
    clock: ClockRef,
    statuses: Mutex<FxHashMap<TransactionId, Entry>>,
    max_propagated: Mutex<HybridTime>,
    status_queries: AtomicUsize,
}

impl StubStatusRpc {
    /// Empty table answering with times from `clock`
    pub fn new(clock: ClockRef) -> Self {
        Self {
            clock,
            statuses: Mutex::new(FxHashMap::default()),
            max_propagated: Mutex::new(HybridTime::MIN),
            status_queries: AtomicUsize::new(0),
        }
    }

    fn set(&self, id: TransactionId, status: TransactionStatus, time: HybridTime, reason: Option<AbortReason>) {
        self.statuses.lock().insert(
            id,
            Entry {
                status,
                status_time: time,
                abort_reason: reason,
            },
        );
    }

    /// Mark `id` as running
    pub fn set_pending(&self, id: TransactionId) {
        self.set(id, TransactionStatus::Pending, self.clock.now(), None);
    }

    /// Mark `id` as committed at `commit_time`
    pub fn set_committed(&self, id: TransactionId, commit_time: HybridTime) {
        self.set(id, TransactionStatus::Committed, commit_time, None);
    }

    /// Mark `id` as aborted by its client
    pub fn set_aborted(&self, id: TransactionId) {
        self.set(
            id,
            TransactionStatus::Aborted,
            self.clock.now(),
            Some(AbortReason::Client),
        );
    }

    /// Drop the record of `id` so lookups return `NotFound`
    pub fn forget(&self, id: TransactionId) {
        self.statuses.lock().remove(&id);
    }

    /// Current status of `id`
    pub fn status_of(&self, id: TransactionId) -> Option<TransactionStatus> {
        self.statuses.lock().get(&id).map(|e| e.status)
    }

    /// Largest propagated time seen on a status request
    pub fn max_propagated_time(&self) -> HybridTime {
        *self.max_propagated.lock()
    }

    /// Number of `GetStatus` calls answered
    pub fn status_queries(&self) -> usize {
        self.status_queries.load(Ordering::Relaxed)
    }

    fn observe(&self, propagated: HybridTime) {
        self.clock.update(propagated);
        let mut max = self.max_propagated.lock();
        if propagated > *max {
            *max = propagated;
        }
    }

    fn respond(&self, id: TransactionId) -> StrataResult<StatusResponse> {
        let entry = self
            .statuses
            .lock()
            .get(&id)
            .copied()
            .ok_or(StrataError::NotFound { transaction_id: id })?;
        let status_time = match entry.status {
            TransactionStatus::Pending => self.clock.now(),
            _ => entry.status_time,
        };
        Ok(StatusResponse {
            transaction_id: id,
            status: entry.status,
            status_time,
            abort_reason: entry.abort_reason,
            propagated_time: self.clock.now(),
        })
    }
}

impl TransactionRpc for StubStatusRpc {
    fn get_status(&self, _tablet: &TabletId, req: GetStatusRequest) -> StrataResult<StatusResponse> {
        self.status_queries.fetch_add(1, Ordering::Relaxed);
        self.observe(req.propagated_time);
        self.respond(req.transaction_id)
    }

    fn update_status(
        &self,
        _tablet: &TabletId,
        req: UpdateStatusRequest,
    ) -> StrataResult<StatusResponse> {
        self.observe(req.propagated_time);
        let pending = self.status_of(req.transaction_id) == Some(TransactionStatus::Pending);
        if pending {
            match req.update {
                StatusUpdate::Commit => self.set_committed(req.transaction_id, self.clock.now()),
                StatusUpdate::Abort(reason) => self.set(
                    req.transaction_id,
                    TransactionStatus::Aborted,
                    self.clock.now(),
                    Some(reason),
                ),
            }
        }
        self.respond(req.transaction_id)
    }

    fn heartbeat(&self, _tablet: &TabletId, req: HeartbeatRequest) -> StrataResult<StatusResponse> {
        self.observe(req.propagated_time);
        if req.register && self.status_of(req.transaction_id).is_none() {
            self.set_pending(req.transaction_id);
        }
        self.respond(req.transaction_id)
    }

    fn read(&self, tablet: &TabletId, _req: ReadRequest) -> StrataResult<ReadResponse> {
        Err(StrataError::internal(format!("stub cannot read from {}", tablet)))
    }

    fn write(&self, tablet: &TabletId, _req: WriteRequest) -> StrataResult<WriteResponse> {
        Err(StrataError::internal(format!("stub cannot write to {}", tablet)))
    }

    fn apply(&self, tablet: &TabletId, _req: ApplyRequest) -> StrataResult<()> {
        Err(StrataError::internal(format!("stub cannot apply on {}", tablet)))
    }

    fn tablet_for_key(&self, key: &Key) -> StrataResult<TabletId> {
        Err(StrataError::internal(format!("stub has no route for {}", key)))
    }

    fn pick_status_tablet(&self) -> StrataResult<TabletId> {
        Ok(TabletId::new("status"))
    }
}
