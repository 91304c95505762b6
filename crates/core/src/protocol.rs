//! Wire-level messages and the transport collaborator
//!
//! Every request and response carries a `propagated_time`: the sender's
//! current hybrid time. Receivers call `ClockSource::update` with it before
//! doing anything else, which is what keeps causally related events ordered
//! across independently clocked nodes.
//!
//! [`TransactionRpc`] is the seam between the protocol and the transport.
//! Retry and backoff live above it; an implementation only delivers one
//! request to one tablet and returns its response.

use crate::error::StrataResult;
use crate::hybrid_time::{HybridTime, ReadHybridTime};
use crate::types::{
    AbortReason, Key, TabletId, TransactionId, TransactionMetadata, TransactionStatus,
};
use crate::value::{IntentValue, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

// ============================================================================
// Status coordinator messages
// ============================================================================

/// Query the status of one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStatusRequest {
    /// Transaction to look up
    pub transaction_id: TransactionId,
    /// Sender's hybrid time; readers send their `global_limit`
    pub propagated_time: HybridTime,
}

/// Coordinator's answer for one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Transaction the status belongs to
    pub transaction_id: TransactionId,
    /// Current status
    pub status: TransactionStatus,
    /// PENDING: coordinator time of this observation.
    /// COMMITTED: commit time. ABORTED: time of the abort decision.
    pub status_time: HybridTime,
    /// Set when `status` is ABORTED
    pub abort_reason: Option<AbortReason>,
    /// Coordinator's hybrid time
    pub propagated_time: HybridTime,
}

/// Requested terminal transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusUpdate {
    /// PENDING → COMMITTED
    Commit,
    /// PENDING → ABORTED
    Abort(AbortReason),
}

/// Ask the coordinator to commit or abort a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatusRequest {
    /// Transaction to transition
    pub transaction_id: TransactionId,
    /// Requested transition
    pub update: StatusUpdate,
    /// Tablets holding intents that must be resolved afterwards
    pub participants: BTreeSet<TabletId>,
    /// Lower bound the client wants for the commit time, if any
    pub proposed_commit_time: Option<HybridTime>,
    /// Sender's hybrid time
    pub propagated_time: HybridTime,
}

/// Liveness signal extending a transaction's lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Transaction to keep alive
    pub transaction_id: TransactionId,
    /// First contact: create the status record instead of failing with NotFound
    pub register: bool,
    /// Tablets written so far
    pub participants: BTreeSet<TabletId>,
    /// Sender's hybrid time
    pub propagated_time: HybridTime,
}

// ============================================================================
// Participant messages
// ============================================================================

/// Read one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Key to read
    pub key: Key,
    /// Reading transaction; `None` for a non-transactional read
    pub transaction: Option<TransactionMetadata>,
    /// Snapshot to read at; `None` lets the tablet pick its current time
    pub read_time: Option<ReadHybridTime>,
    /// Sender's hybrid time
    pub propagated_time: HybridTime,
}

/// Outcome of a read at one tablet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReadResult {
    /// The visible value (`None` if absent or deleted)
    Value(Option<Value>),
    /// A version inside the uncertainty window exists; reading at the given
    /// time (or later) would be certain
    RestartRequired(HybridTime),
}

/// Response to a [`ReadRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadResponse {
    /// Read outcome
    pub result: ReadResult,
    /// Read time actually used (differs from the request when the tablet picked it)
    pub used_read_time: ReadHybridTime,
    /// Local limit the tablet established for this reader
    pub local_limit: HybridTime,
    /// Tablet's hybrid time
    pub propagated_time: HybridTime,
}

/// Write one key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Key to write
    pub key: Key,
    /// Value or tombstone
    pub value: IntentValue,
    /// Writing transaction; `None` for a non-transactional write
    pub transaction: Option<TransactionMetadata>,
    /// Writer's snapshot; committed versions newer than `read` conflict
    pub read_time: Option<ReadHybridTime>,
    /// Sender's hybrid time
    pub propagated_time: HybridTime,
}

/// Response to a [`WriteRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResponse {
    /// Time the intent (or non-transactional version) was written
    pub write_time: HybridTime,
    /// Tablet's hybrid time
    pub propagated_time: HybridTime,
}

/// Tell a participant a transaction reached a terminal status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyRequest {
    /// Transaction whose intents should be resolved
    pub transaction_id: TransactionId,
    /// COMMITTED or ABORTED
    pub status: TransactionStatus,
    /// Commit time when `status` is COMMITTED
    pub commit_time: Option<HybridTime>,
    /// Coordinator's hybrid time
    pub propagated_time: HybridTime,
}

// ============================================================================
// Transport
// ============================================================================

/// Transport collaborator delivering protocol messages to tablets
///
/// Implementations route to the tablet's current leader and return either
/// the tablet's response or a transport error (`Network`/`TimedOut`).
pub trait TransactionRpc: Send + Sync {
    /// Query a transaction's status at its status tablet
    fn get_status(&self, tablet: &TabletId, req: GetStatusRequest) -> StrataResult<StatusResponse>;

    /// Commit or abort a transaction at its status tablet
    fn update_status(
        &self,
        tablet: &TabletId,
        req: UpdateStatusRequest,
    ) -> StrataResult<StatusResponse>;

    /// Register or keep alive a transaction at its status tablet
    fn heartbeat(&self, tablet: &TabletId, req: HeartbeatRequest) -> StrataResult<StatusResponse>;

    /// Read one key at a participant
    fn read(&self, tablet: &TabletId, req: ReadRequest) -> StrataResult<ReadResponse>;

    /// Write one key at a participant
    fn write(&self, tablet: &TabletId, req: WriteRequest) -> StrataResult<WriteResponse>;

    /// Deliver a resolution notification to a participant
    fn apply(&self, tablet: &TabletId, req: ApplyRequest) -> StrataResult<()>;

    /// Tablet owning `key`
    fn tablet_for_key(&self, key: &Key) -> StrataResult<TabletId>;

    /// Choose a status tablet for a new transaction
    fn pick_status_tablet(&self) -> StrataResult<TabletId>;
}
