//! Liveness heartbeat of a running transaction
//!
//! The periodic task holds only weak references: to the manager's shared
//! state and to a small [`HeartbeatState`] owned by the transaction. Dropping
//! the transaction therefore ends its heartbeat, and the coordinator expires
//! the record once the lease lapses.

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use strata_concurrency::{Repeat, TaskHandle, TaskPriority};
use strata_core::{
    HeartbeatRequest, StatusResponse, StrataError, StrataResult, TabletId, TransactionId,
    TransactionStatus,
};
use tracing::{debug, warn};

use super::manager::ManagerShared;

/// What the heartbeat task shares with its transaction
#[derive(Debug)]
pub(crate) struct HeartbeatState {
    transaction_id: TransactionId,
    status_tablet: TabletId,
    failure: Mutex<Option<StrataError>>,
    stopped: AtomicBool,
}

impl HeartbeatState {
    pub(crate) fn new(transaction_id: TransactionId, status_tablet: TabletId) -> Arc<Self> {
        Arc::new(Self {
            transaction_id,
            status_tablet,
            failure: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    /// Error every later operation of the transaction should fail with
    pub(crate) fn failure(&self) -> Option<StrataError> {
        self.failure.lock().clone()
    }

    fn record_failure(&self, error: StrataError) {
        self.failure.lock().get_or_insert(error);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A running heartbeat; stopping it is idempotent
#[derive(Debug)]
pub(crate) struct Heartbeat {
    state: Arc<HeartbeatState>,
    task: Option<TaskHandle>,
}

impl Heartbeat {
    /// Start heartbeating unless disabled for tests
    pub(crate) fn start(
        shared: &Arc<ManagerShared>,
        transaction_id: TransactionId,
        status_tablet: TabletId,
    ) -> StrataResult<Self> {
        let state = HeartbeatState::new(transaction_id, status_tablet);
        if shared.config.disable_heartbeat_in_tests {
            return Ok(Self { state, task: None });
        }
        let weak_shared = Arc::downgrade(shared);
        let weak_state = Arc::downgrade(&state);
        let task = shared.scheduler.schedule_periodic(
            TaskPriority::Normal,
            shared.config.heartbeat_interval(),
            move || beat(&weak_shared, &weak_state),
        )?;
        Ok(Self {
            state,
            task: Some(task),
        })
    }

    pub(crate) fn failure(&self) -> Option<StrataError> {
        self.state.failure()
    }

    pub(crate) fn stop(&self) {
        self.state.stopped.store(true, Ordering::Release);
        if let Some(task) = &self.task {
            task.cancel();
        }
    }
}

fn beat(shared: &Weak<ManagerShared>, state: &Weak<HeartbeatState>) -> Repeat {
    let (Some(shared), Some(state)) = (shared.upgrade(), state.upgrade()) else {
        return Repeat::Stop;
    };
    if state.is_stopped() {
        return Repeat::Stop;
    }
    let req = HeartbeatRequest {
        transaction_id: state.transaction_id,
        register: false,
        participants: BTreeSet::new(),
        propagated_time: shared.clock.now(),
    };
    match shared.rpc.heartbeat(&state.status_tablet, req) {
        Ok(resp) => {
            shared.clock.update(resp.propagated_time);
            match resp.status {
                TransactionStatus::Pending => Repeat::Continue,
                TransactionStatus::Committed => Repeat::Stop,
                TransactionStatus::Aborted => {
                    let error = aborted_error(&resp);
                    warn!(
                        target: "strata::txn",
                        txn_id = %state.transaction_id,
                        error = %error,
                        "Heartbeat found transaction aborted"
                    );
                    state.record_failure(error);
                    Repeat::Stop
                }
            }
        }
        Err(e) if e.is_not_found() => {
            warn!(
                target: "strata::txn",
                txn_id = %state.transaction_id,
                "Heartbeat found no status record"
            );
            state.record_failure(StrataError::Expired {
                transaction_id: state.transaction_id,
            });
            Repeat::Stop
        }
        Err(e) => {
            // The lease decides; keep trying until the coordinator answers
            debug!(
                target: "strata::txn",
                txn_id = %state.transaction_id,
                error = %e,
                "Heartbeat failed, retrying next interval"
            );
            Repeat::Continue
        }
    }
}

/// Error for a transaction the coordinator reports as ABORTED
pub(crate) fn aborted_error(resp: &StatusResponse) -> StrataError {
    match resp.abort_reason {
        Some(reason) => reason.to_error(resp.transaction_id),
        None => StrataError::Aborted {
            reason: format!("transaction {} aborted", resp.transaction_id),
        },
    }
}
