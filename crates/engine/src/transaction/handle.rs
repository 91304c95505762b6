//! Client-side transaction handle
//!
//! A [`Transaction`] drives one transaction through
//! `Created → Running → CommitRequested → Committed | Aborted`:
//!
//! - Initialization is lazy: the id, status tablet and priority are fixed on
//!   first use (or by [`Transaction::init`]).
//! - The read time is picked on first read. A first read confined to one
//!   tablet lets that tablet pick it, which avoids an uncertainty window.
//! - The first write registers the transaction at its status tablet and
//!   starts the heartbeat.
//! - `commit` and `abort` run on the background scheduler and complete a
//!   [`Completion`]. Both are idempotent.
//!
//! # Lock order
//!
//! `read_time_lock` before `state`. No lock is held across an RPC except
//! `read_time_lock`, which serializes the request that picks the read time.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use strata_concurrency::{completion_pair, Completion, ConsistentReadPoint, TaskPriority};
use strata_core::{
    AbortReason, ClientState, HeartbeatRequest, HybridTime, IntentValue, IsolationLevel, Key,
    ReadHybridTime, ReadRequest, ReadResponse, ReadResult, StatusResponse, StatusUpdate,
    StrataError, StrataResult, TabletId, TransactionId, TransactionMetadata, TransactionStatus,
    UpdateStatusRequest, Value, WriteRequest,
};
use tracing::{debug, info, warn};

use super::heartbeat::{aborted_error, Heartbeat};
use super::manager::ManagerShared;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Kind {
    Top,
    Child,
}

pub(super) struct TransactionInner {
    pub(super) shared: Arc<ManagerShared>,
    pub(super) kind: Kind,
    pub(super) attempt: u32,
    pub(super) read_point: ConsistentReadPoint,
    read_time_lock: Mutex<()>,
    pub(super) state: Mutex<TxnState>,
}

#[derive(Debug)]
pub(super) struct TxnState {
    pub(super) client_state: ClientState,
    pub(super) isolation: IsolationLevel,
    pub(super) metadata: Option<TransactionMetadata>,
    pub(super) touched: BTreeSet<TabletId>,
    pub(super) registered: bool,
    rows_delivered: bool,
    /// Original read time of a transaction restarted under the same id;
    /// writes are checked against it
    conflict_floor: Option<HybridTime>,
    heartbeat: Option<Heartbeat>,
    commit: Option<Completion<StrataResult<()>>>,
    abort: Option<Completion<StrataResult<TransactionStatus>>>,
    commit_time: Option<HybridTime>,
    failure: Option<StrataError>,
}

impl TxnState {
    fn new() -> Self {
        Self {
            client_state: ClientState::Created,
            isolation: IsolationLevel::SnapshotIsolation,
            metadata: None,
            touched: BTreeSet::new(),
            registered: false,
            rows_delivered: false,
            conflict_floor: None,
            heartbeat: None,
            commit: None,
            abort: None,
            commit_time: None,
            failure: None,
        }
    }

    fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.stop();
        }
    }

    fn aborted_failure(&self) -> StrataError {
        self.failure.clone().unwrap_or_else(|| StrataError::Aborted {
            reason: "transaction aborted".to_string(),
        })
    }
}

/// Handle to one client transaction
///
/// Cloning is cheap; clones refer to the same transaction. Dropping the last
/// clone of a registered, unfinished transaction sends a best-effort abort.
#[derive(Clone)]
pub struct Transaction {
    pub(super) inner: Arc<TransactionInner>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Transaction")
            .field("id", &state.metadata.as_ref().map(|m| m.transaction_id))
            .field("state", &state.client_state)
            .field("kind", &self.inner.kind)
            .field("attempt", &self.inner.attempt)
            .field("read_time", &self.inner.read_point.read_time())
            .finish()
    }
}

impl Transaction {
    pub(super) fn new(shared: Arc<ManagerShared>, attempt: u32) -> Self {
        Self::with_kind(shared, Kind::Top, attempt)
    }

    pub(super) fn with_kind(shared: Arc<ManagerShared>, kind: Kind, attempt: u32) -> Self {
        let read_point = ConsistentReadPoint::new(Arc::clone(&shared.clock));
        Self {
            inner: Arc::new(TransactionInner {
                shared,
                kind,
                attempt,
                read_point,
                read_time_lock: Mutex::new(()),
                state: Mutex::new(TxnState::new()),
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Transaction id, once initialized
    pub fn id(&self) -> Option<TransactionId> {
        self.inner
            .state
            .lock()
            .metadata
            .as_ref()
            .map(|m| m.transaction_id)
    }

    /// Metadata, once initialized
    pub fn metadata(&self) -> Option<TransactionMetadata> {
        self.inner.state.lock().metadata.clone()
    }

    /// Client-local state
    pub fn state(&self) -> ClientState {
        self.inner.state.lock().client_state
    }

    /// Read time, once picked
    pub fn read_time(&self) -> Option<ReadHybridTime> {
        self.inner.read_point.read_time()
    }

    /// Local limits established per tablet
    pub fn local_limits(&self) -> BTreeMap<TabletId, HybridTime> {
        self.inner.read_point.local_limits()
    }

    /// Largest restart time reported so far, if a restart is pending
    pub fn restart_time(&self) -> Option<HybridTime> {
        self.inner.read_point.restart_time()
    }

    /// Commit time, once committed
    pub fn commit_time(&self) -> Option<HybridTime> {
        self.inner.state.lock().commit_time
    }

    /// Tablets holding intents of this transaction
    pub fn touched_tablets(&self) -> BTreeSet<TabletId> {
        self.inner.state.lock().touched.clone()
    }

    /// Whether this handle was created from [`strata_core::ChildTransactionData`]
    pub fn is_child(&self) -> bool {
        self.inner.kind == Kind::Child
    }

    /// Number of earlier attempts under a different id
    pub fn attempt(&self) -> u32 {
        self.inner.attempt
    }

    /// Whether rows of the current statement reached the caller
    pub fn rows_delivered(&self) -> bool {
        self.inner.state.lock().rows_delivered
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Fix the isolation level and, optionally, the read time
    ///
    /// Calling again with the same parameters is a no-op; different
    /// parameters fail with [`StrataError::AlreadyInitialized`].
    pub fn init(
        &self,
        isolation: IsolationLevel,
        read_time: Option<ReadHybridTime>,
    ) -> StrataResult<()> {
        if isolation == IsolationLevel::NonTransactional {
            return Err(StrataError::invalid_input(
                "transactions cannot be non-transactional",
            ));
        }
        let mut state = self.inner.state.lock();
        if state.client_state != ClientState::Created {
            let same_isolation = state.isolation == isolation;
            let same_read_time =
                read_time.map_or(true, |rt| self.inner.read_point.read_time() == Some(rt));
            return if same_isolation && same_read_time {
                Ok(())
            } else {
                Err(StrataError::AlreadyInitialized)
            };
        }
        if let Some(read_time) = read_time {
            self.inner
                .read_point
                .set_read_time(read_time, BTreeMap::new())?;
        }
        state.isolation = isolation;
        self.initialize(&mut state).map(|_| ())
    }

    fn initialize(&self, state: &mut TxnState) -> StrataResult<TransactionMetadata> {
        let shared = &self.inner.shared;
        let metadata = TransactionMetadata {
            transaction_id: TransactionId::new(),
            isolation: state.isolation,
            status_tablet: shared.rpc.pick_status_tablet()?,
            priority: shared.resolver.assign_priority(self.inner.attempt),
            start_time: shared.clock.now(),
        };
        state.metadata = Some(metadata.clone());
        state.client_state = ClientState::Running;
        shared.counters.record_start();
        debug!(
            target: "strata::txn",
            txn_id = %metadata.transaction_id,
            status_tablet = %metadata.status_tablet,
            priority = metadata.priority,
            attempt = self.inner.attempt,
            "Transaction initialized"
        );
        Ok(metadata)
    }

    /// Metadata of a usable transaction, initializing it if needed
    pub(super) fn running_metadata(&self) -> StrataResult<TransactionMetadata> {
        let mut state = self.inner.state.lock();
        if let Some(error) = self.absorb_heartbeat_failure(&mut state) {
            return Err(error);
        }
        match state.client_state {
            ClientState::Created => self.initialize(&mut state),
            ClientState::Running => state
                .metadata
                .clone()
                .ok_or_else(|| StrataError::internal("running transaction without metadata")),
            ClientState::RestartRequired => Err(StrataError::RestartRequired {
                restart_time: self
                    .inner
                    .read_point
                    .restart_time()
                    .ok_or_else(|| StrataError::internal("restart required without a time"))?,
            }),
            ClientState::CommitRequested | ClientState::Committed => Err(
                StrataError::invalid_state(state.client_state.to_string()),
            ),
            ClientState::Aborted => Err(state.aborted_failure()),
        }
    }

    /// Turn a failure the heartbeat observed into local state
    fn absorb_heartbeat_failure(&self, state: &mut TxnState) -> Option<StrataError> {
        if !matches!(
            state.client_state,
            ClientState::Running | ClientState::RestartRequired
        ) {
            return None;
        }
        let error = state.heartbeat.as_ref()?.failure()?;
        self.finish_locked(state, ClientState::Aborted, None, Some(error.clone()));
        Some(error)
    }

    pub(super) fn ensure_read_time(&self) {
        let read_point = &self.inner.read_point;
        if read_point.is_set() {
            return;
        }
        let _guard = self.inner.read_time_lock.lock();
        if !read_point.is_set() {
            read_point.set_current_read_time();
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Read one key at this transaction's snapshot
    ///
    /// Fails with [`StrataError::RestartRequired`] when a version inside the
    /// uncertainty window was found; the transaction then needs
    /// [`Transaction::create_restarted_transaction`].
    pub fn read(&self, key: impl Into<Key>) -> StrataResult<Option<Value>> {
        let key = key.into();
        let tablet = self.inner.shared.rpc.tablet_for_key(&key)?;
        let metadata = self.running_metadata()?;
        self.read_at(&tablet, key, &metadata, true)
    }

    /// Read several keys at one snapshot
    ///
    /// Every key is read even after one reports a restart, so the restart
    /// time covers all tablets involved.
    pub fn read_many(&self, keys: &[Key]) -> StrataResult<Vec<Option<Value>>> {
        let rpc = &self.inner.shared.rpc;
        let routed = keys
            .iter()
            .map(|key| Ok((rpc.tablet_for_key(key)?, key.clone())))
            .collect::<StrataResult<Vec<_>>>()?;
        let single_tablet = routed.windows(2).all(|pair| pair[0].0 == pair[1].0);
        let metadata = self.running_metadata()?;
        if !single_tablet {
            self.ensure_read_time();
        }

        let mut values = Vec::with_capacity(routed.len());
        let mut restart: Option<HybridTime> = None;
        for (tablet, key) in routed {
            match self.read_at(&tablet, key, &metadata, single_tablet) {
                Ok(value) => values.push(value),
                Err(StrataError::RestartRequired { restart_time }) => {
                    restart = Some(restart.map_or(restart_time, |t| t.max(restart_time)));
                    values.push(None);
                }
                Err(e) => return Err(e),
            }
        }
        match restart {
            Some(restart_time) => Err(StrataError::RestartRequired { restart_time }),
            None => Ok(values),
        }
    }

    fn read_at(
        &self,
        tablet: &TabletId,
        key: Key,
        metadata: &TransactionMetadata,
        may_pick_at_tablet: bool,
    ) -> StrataResult<Option<Value>> {
        let read_point = &self.inner.read_point;
        let resp = if read_point.is_set() {
            self.send_read(tablet, key, metadata, read_point.read_time_for(tablet))?
        } else if may_pick_at_tablet {
            let _guard = self.inner.read_time_lock.lock();
            if read_point.is_set() {
                self.send_read(tablet, key, metadata, read_point.read_time_for(tablet))?
            } else {
                let resp = self.send_read(tablet, key, metadata, None)?;
                let mut limits = BTreeMap::new();
                limits.insert(tablet.clone(), resp.used_read_time.local_limit);
                read_point.set_read_time(resp.used_read_time, limits)?;
                resp
            }
        } else {
            self.ensure_read_time();
            self.send_read(tablet, key, metadata, read_point.read_time_for(tablet))?
        };
        read_point.update_local_limit(tablet, resp.local_limit);

        match resp.result {
            ReadResult::Value(value) => Ok(value),
            ReadResult::RestartRequired(restart_time) => {
                read_point.record_restart(tablet.clone(), restart_time);
                let mut state = self.inner.state.lock();
                if state.client_state == ClientState::Running {
                    state.client_state = ClientState::RestartRequired;
                }
                debug!(
                    target: "strata::txn",
                    txn_id = %metadata.transaction_id,
                    tablet = %tablet,
                    %restart_time,
                    "Read restart required"
                );
                Err(StrataError::RestartRequired { restart_time })
            }
        }
    }

    fn send_read(
        &self,
        tablet: &TabletId,
        key: Key,
        metadata: &TransactionMetadata,
        read_time: Option<ReadHybridTime>,
    ) -> StrataResult<ReadResponse> {
        let shared = &self.inner.shared;
        let req = ReadRequest {
            key,
            transaction: Some(metadata.clone()),
            read_time,
            propagated_time: shared.clock.now(),
        };
        let resp = shared.rpc.read(tablet, req)?;
        shared.clock.update(resp.propagated_time);
        Ok(resp)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Write `value` under `key` as an intent of this transaction
    pub fn write(&self, key: impl Into<Key>, value: impl Into<Value>) -> StrataResult<()> {
        self.write_intent(key.into(), IntentValue::Put(value.into()))
    }

    /// Delete `key` as part of this transaction
    pub fn delete(&self, key: impl Into<Key>) -> StrataResult<()> {
        self.write_intent(key.into(), IntentValue::Delete)
    }

    fn write_intent(&self, key: Key, value: IntentValue) -> StrataResult<()> {
        let shared = &self.inner.shared;
        let tablet = shared.rpc.tablet_for_key(&key)?;
        let metadata = self.running_metadata()?;
        self.ensure_read_time();
        self.ensure_registered(&metadata, Some(&tablet))?;

        let req = WriteRequest {
            key,
            value,
            transaction: Some(metadata),
            read_time: Some(self.write_read_time(&tablet)?),
            propagated_time: shared.clock.now(),
        };
        match shared.rpc.write(&tablet, req) {
            Ok(resp) => {
                shared.clock.update(resp.propagated_time);
                Ok(())
            }
            Err(e) if e.is_retryable() => {
                self.fail(e.clone());
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn write_read_time(&self, tablet: &TabletId) -> StrataResult<ReadHybridTime> {
        let mut read_time = self
            .inner
            .read_point
            .read_time_for(tablet)
            .ok_or_else(|| StrataError::internal("write without a read time"))?;
        if let Some(floor) = self.inner.state.lock().conflict_floor {
            read_time.read = read_time.read.min(floor);
        }
        Ok(read_time)
    }

    /// Make sure the status tablet knows this transaction and `tablet`
    pub(super) fn ensure_registered(
        &self,
        metadata: &TransactionMetadata,
        tablet: Option<&TabletId>,
    ) -> StrataResult<()> {
        let shared = &self.inner.shared;
        let (register, participants) = {
            let state = self.inner.state.lock();
            let new_tablet = tablet.map_or(false, |t| !state.touched.contains(t));
            if state.registered && !new_tablet {
                return Ok(());
            }
            let mut participants = state.touched.clone();
            participants.extend(tablet.cloned());
            (!state.registered && self.inner.kind == Kind::Top, participants)
        };

        let req = HeartbeatRequest {
            transaction_id: metadata.transaction_id,
            register,
            participants: participants.clone(),
            propagated_time: shared.clock.now(),
        };
        let resp = match shared.rpc.heartbeat(&metadata.status_tablet, req) {
            Ok(resp) => resp,
            Err(e) if e.is_not_found() => {
                let error = StrataError::Expired {
                    transaction_id: metadata.transaction_id,
                };
                self.fail(error.clone());
                return Err(error);
            }
            Err(e) => return Err(e),
        };
        shared.clock.update(resp.propagated_time);
        match resp.status {
            TransactionStatus::Pending => {}
            TransactionStatus::Aborted => {
                let error = aborted_error(&resp);
                self.fail(error.clone());
                return Err(error);
            }
            TransactionStatus::Committed => {
                return Err(StrataError::invalid_state(format!(
                    "transaction {} already committed",
                    metadata.transaction_id
                )));
            }
        }

        let mut state = self.inner.state.lock();
        state.touched.extend(participants);
        state.registered = true;
        if state.heartbeat.is_none()
            && self.inner.kind == Kind::Top
            && state.client_state.needs_heartbeat()
        {
            state.heartbeat = Some(Heartbeat::start(
                shared,
                metadata.transaction_id,
                metadata.status_tablet.clone(),
            )?);
        }
        Ok(())
    }

    /// Record a fatal error and abort
    fn fail(&self, error: StrataError) {
        self.inner.state.lock().failure.get_or_insert(error);
        let _ = self.abort();
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Begin a new statement; no rows of it have reached the caller yet
    pub fn start_statement(&self) {
        self.inner.state.lock().rows_delivered = false;
    }

    /// Mark that rows of the current statement reached the caller
    ///
    /// From now on a read restart cannot be recovered transparently.
    pub fn record_rows_delivered(&self) {
        self.inner.state.lock().rows_delivered = true;
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Ask the status tablet to commit
    ///
    /// Completes with `Ok(())` once COMMITTED, `Conflict` or `Expired` when
    /// the coordinator aborted the transaction first. Repeated calls return
    /// the same completion.
    pub fn commit(&self) -> Completion<StrataResult<()>> {
        let mut state = self.inner.state.lock();
        if let Some(completion) = &state.commit {
            return completion.clone();
        }
        if self.inner.kind == Kind::Child {
            return Completion::ready(Err(StrataError::invalid_state(
                "child transactions finish through finish_child",
            )));
        }
        if let Some(error) = self.absorb_heartbeat_failure(&mut state) {
            return Completion::ready(Err(error));
        }
        match state.client_state {
            ClientState::Created | ClientState::Running => {}
            ClientState::Committed => return Completion::ready(Ok(())),
            ClientState::Aborted => return Completion::ready(Err(state.aborted_failure())),
            ClientState::RestartRequired | ClientState::CommitRequested => {
                return Completion::ready(Err(StrataError::invalid_state(
                    state.client_state.to_string(),
                )));
            }
        }

        if !state.registered {
            // Nothing was written, so there is nothing to decide
            let completion = Completion::ready(Ok(()));
            state.commit = Some(completion.clone());
            self.finish_locked(&mut state, ClientState::Committed, None, None);
            return completion;
        }
        let Some(metadata) = state.metadata.clone() else {
            return Completion::ready(Err(StrataError::internal(
                "registered transaction without metadata",
            )));
        };
        let participants = state.touched.clone();
        state.client_state = ClientState::CommitRequested;
        let (promise, completion) = completion_pair();
        state.commit = Some(completion.clone());
        drop(state);

        debug!(
            target: "strata::txn",
            txn_id = %metadata.transaction_id,
            participants = participants.len(),
            "Commit requested"
        );
        let task = {
            let this = self.clone();
            let metadata = metadata.clone();
            let participants = participants.clone();
            let promise = promise.clone();
            move || {
                promise.fulfill(this.drive_commit(&metadata, participants));
            }
        };
        if self
            .inner
            .shared
            .scheduler
            .submit(TaskPriority::High, task)
            .is_err()
        {
            promise.fulfill(self.drive_commit(&metadata, participants));
        }
        completion
    }

    fn drive_commit(
        &self,
        metadata: &TransactionMetadata,
        participants: BTreeSet<TabletId>,
    ) -> StrataResult<()> {
        let resp = self.send_status_update(
            metadata,
            StatusUpdate::Commit,
            &participants,
            "commit",
        );
        match resp {
            Ok(resp) => match resp.status {
                TransactionStatus::Committed => {
                    self.finish(ClientState::Committed, Some(resp.status_time), None);
                    Ok(())
                }
                TransactionStatus::Aborted => {
                    let error = aborted_error(&resp);
                    self.finish(ClientState::Aborted, None, Some(error.clone()));
                    Err(error)
                }
                TransactionStatus::Pending => {
                    let error =
                        StrataError::internal("coordinator left a committing transaction pending");
                    self.commit_outcome_unknown(metadata, &error);
                    Err(error)
                }
            },
            Err(e) if e.is_not_found() => {
                let error = StrataError::Expired {
                    transaction_id: metadata.transaction_id,
                };
                self.finish(ClientState::Aborted, None, Some(error.clone()));
                Err(error)
            }
            Err(e) => {
                self.commit_outcome_unknown(metadata, &e);
                Err(e)
            }
        }
    }

    /// Stop heartbeating so the coordinator expires the transaction if the
    /// commit never arrived; the local state stays `CommitRequested`
    fn commit_outcome_unknown(&self, metadata: &TransactionMetadata, error: &StrataError) {
        warn!(
            target: "strata::txn",
            txn_id = %metadata.transaction_id,
            error = %error,
            "Commit outcome unknown"
        );
        self.inner.state.lock().stop_heartbeat();
    }

    // ========================================================================
    // Abort
    // ========================================================================

    /// Ask the status tablet to abort
    ///
    /// Completes with the coordinator's actual terminal status: a commit that
    /// won the race yields `Ok(Committed)`. Repeated calls return the same
    /// completion; a committed transaction is left alone.
    pub fn abort(&self) -> Completion<StrataResult<TransactionStatus>> {
        let mut state = self.inner.state.lock();
        if let Some(completion) = &state.abort {
            return completion.clone();
        }
        if self.inner.kind == Kind::Child {
            return Completion::ready(Err(StrataError::invalid_state(
                "child transactions finish through finish_child",
            )));
        }
        match state.client_state {
            ClientState::Committed => return Completion::ready(Ok(TransactionStatus::Committed)),
            ClientState::Aborted if !state.registered => {
                return Completion::ready(Ok(TransactionStatus::Aborted));
            }
            _ => {}
        }

        let racing_commit = state.client_state == ClientState::CommitRequested;
        if !racing_commit {
            let error = StrataError::Aborted {
                reason: "aborted by client".to_string(),
            };
            self.finish_locked(&mut state, ClientState::Aborted, None, Some(error));
        }
        let metadata = match (&state.metadata, state.registered) {
            (Some(metadata), true) => metadata.clone(),
            _ => {
                let completion = Completion::ready(Ok(TransactionStatus::Aborted));
                state.abort = Some(completion.clone());
                return completion;
            }
        };
        let participants = state.touched.clone();
        let (promise, completion) = completion_pair();
        state.abort = Some(completion.clone());
        drop(state);

        let task = {
            let this = self.clone();
            let metadata = metadata.clone();
            let participants = participants.clone();
            let promise = promise.clone();
            move || {
                promise.fulfill(this.drive_abort(&metadata, participants));
            }
        };
        if self
            .inner
            .shared
            .scheduler
            .submit(TaskPriority::High, task)
            .is_err()
        {
            promise.fulfill(self.drive_abort(&metadata, participants));
        }
        completion
    }

    fn drive_abort(
        &self,
        metadata: &TransactionMetadata,
        participants: BTreeSet<TabletId>,
    ) -> StrataResult<TransactionStatus> {
        let resp = self.send_status_update(
            metadata,
            StatusUpdate::Abort(AbortReason::Client),
            &participants,
            "abort",
        );
        match resp {
            Ok(resp) => {
                match resp.status {
                    TransactionStatus::Committed => {
                        self.finish(ClientState::Committed, Some(resp.status_time), None)
                    }
                    TransactionStatus::Aborted => {
                        self.finish(ClientState::Aborted, None, Some(aborted_error(&resp)))
                    }
                    TransactionStatus::Pending => {}
                }
                Ok(resp.status)
            }
            // Retired records were terminal; a committed one would still be known
            Err(e) if e.is_not_found() => {
                self.finish(ClientState::Aborted, None, None);
                Ok(TransactionStatus::Aborted)
            }
            Err(e) => Err(e),
        }
    }

    /// Send a status update, resending after transport errors until the
    /// configured RPC deadline
    fn send_status_update(
        &self,
        metadata: &TransactionMetadata,
        update: StatusUpdate,
        participants: &BTreeSet<TabletId>,
        what: &str,
    ) -> StrataResult<StatusResponse> {
        let shared = &self.inner.shared;
        let resend = RetryConfig::resends();
        let deadline = Instant::now() + shared.config.rpc_timeout();
        let mut attempt = 0;
        loop {
            let req = UpdateStatusRequest {
                transaction_id: metadata.transaction_id,
                update: update.clone(),
                participants: participants.clone(),
                proposed_commit_time: None,
                propagated_time: shared.clock.now(),
            };
            let e = match shared.rpc.update_status(&metadata.status_tablet, req) {
                Ok(resp) => {
                    shared.clock.update(resp.propagated_time);
                    return Ok(resp);
                }
                Err(e) => e,
            };
            let Some(delay) = resend.next_delay(attempt, &e) else {
                return Err(e);
            };
            if Instant::now() + delay >= deadline {
                return Err(StrataError::TimedOut(format!(
                    "{} of transaction {} not acknowledged: {}",
                    what, metadata.transaction_id, e
                )));
            }
            debug!(
                target: "strata::txn",
                txn_id = %metadata.transaction_id,
                error = %e,
                attempt,
                "Resending {}", what
            );
            std::thread::sleep(delay);
            attempt += 1;
        }
    }

    // ========================================================================
    // Terminal states
    // ========================================================================

    fn finish(
        &self,
        client_state: ClientState,
        commit_time: Option<HybridTime>,
        failure: Option<StrataError>,
    ) {
        let mut state = self.inner.state.lock();
        self.finish_locked(&mut state, client_state, commit_time, failure);
    }

    fn finish_locked(
        &self,
        state: &mut TxnState,
        client_state: ClientState,
        commit_time: Option<HybridTime>,
        failure: Option<StrataError>,
    ) {
        if state.client_state.is_done() {
            return;
        }
        state.client_state = client_state;
        state.commit_time = commit_time;
        if let Some(failure) = failure {
            state.failure.get_or_insert(failure);
        }
        state.stop_heartbeat();

        let Some(metadata) = &state.metadata else {
            return;
        };
        if self.inner.kind == Kind::Child {
            return;
        }
        let counters = &self.inner.shared.counters;
        match client_state {
            ClientState::Committed => counters.record_commit(),
            _ => counters.record_abort(),
        }
        info!(
            target: "strata::txn",
            txn_id = %metadata.transaction_id,
            state = %client_state,
            commit_time = ?commit_time,
            error = ?state.failure,
            "Transaction finished"
        );
    }

    // ========================================================================
    // Restart
    // ========================================================================

    /// Transaction to continue with after a read restart
    ///
    /// Only legal in `RestartRequired` and while no rows of the current
    /// statement reached the caller. A transaction without intents keeps its
    /// id; otherwise a new transaction with escalated priority replaces it and
    /// this one is aborted along with its writes, which the caller has to
    /// redo. Either way the new read time is
    /// `max(read, restart_time)` with a global limit raised to match.
    pub fn create_restarted_transaction(&self) -> StrataResult<Transaction> {
        if self.inner.kind == Kind::Child {
            return Err(StrataError::invalid_state(
                "child transactions restart through their parent",
            ));
        }
        let shared = &self.inner.shared;
        let mut state = self.inner.state.lock();
        if state.client_state != ClientState::RestartRequired {
            return Err(StrataError::invalid_state(format!(
                "cannot restart in state {}",
                state.client_state
            )));
        }
        if state.rows_delivered {
            return Err(StrataError::RestartRequired {
                restart_time: self
                    .inner
                    .read_point
                    .restart_time()
                    .ok_or_else(|| StrataError::internal("restart required without a time"))?,
            });
        }
        let read_time = self.inner.read_point.restarted_read_time()?;
        let local_limits = self.inner.read_point.local_limits();
        shared.counters.record_restart();

        if state.touched.is_empty() {
            let restarted = Transaction::new(Arc::clone(shared), self.inner.attempt);
            restarted
                .inner
                .read_point
                .set_read_time(read_time, local_limits)?;
            let original_read = self.inner.read_point.read_time().map(|rt| rt.read);
            {
                let mut next = restarted.inner.state.lock();
                next.client_state = ClientState::Running;
                next.isolation = state.isolation;
                next.metadata = state.metadata.clone();
                next.registered = state.registered;
                next.heartbeat = state.heartbeat.take();
                next.conflict_floor = state.conflict_floor.or(original_read);
            }
            // The id lives on in the restarted handle
            state.registered = false;
            state.client_state = ClientState::Aborted;
            state.failure = Some(StrataError::invalid_state("restarted"));
            debug!(
                target: "strata::txn",
                txn_id = ?state.metadata.as_ref().map(|m| m.transaction_id),
                read_time = %read_time,
                "Restarted under the same id"
            );
            return Ok(restarted);
        }

        let restarted = Transaction::new(Arc::clone(shared), self.inner.attempt + 1);
        restarted
            .inner
            .read_point
            .set_read_time(read_time, local_limits)?;
        restarted.inner.state.lock().isolation = state.isolation;
        debug!(
            target: "strata::txn",
            txn_id = ?state.metadata.as_ref().map(|m| m.transaction_id),
            read_time = %read_time,
            "Restarted under a new id"
        );
        drop(state);
        let _ = self.abort();
        Ok(restarted)
    }
}

impl Drop for TransactionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.stop_heartbeat();
        if self.kind != Kind::Top
            || !state.registered
            || state.client_state.is_done()
            || state.client_state == ClientState::CommitRequested
        {
            return;
        }
        let Some(metadata) = state.metadata.clone() else {
            return;
        };
        self.shared.counters.record_abort();
        debug!(
            target: "strata::txn",
            txn_id = %metadata.transaction_id,
            "Dropped unfinished transaction, aborting"
        );
        let shared = Arc::clone(&self.shared);
        let participants = std::mem::take(&mut state.touched);
        let _ = self.shared.scheduler.submit(TaskPriority::Low, move || {
            let req = UpdateStatusRequest {
                transaction_id: metadata.transaction_id,
                update: StatusUpdate::Abort(AbortReason::Client),
                participants,
                proposed_commit_time: None,
                propagated_time: shared.clock.now(),
            };
            if let Err(e) = shared.rpc.update_status(&metadata.status_tablet, req) {
                debug!(
                    target: "strata::txn",
                    txn_id = %metadata.transaction_id,
                    error = %e,
                    "Abort of dropped transaction failed; lease will expire"
                );
            }
        });
    }
}
