//! Core types for distributed transactions
//!
//! This module defines the foundational types:
//! - TransactionId: Unique identifier generated client-side
//! - TabletId: Identifier of a shard replica group
//! - Key: Opaque user key
//! - TransactionMetadata: Immutable description of an initialized transaction
//! - TransactionStatus: Authoritative status held by the coordinator
//! - ClientState: Client-local lifecycle of a transaction handle
//! - ChildTransactionData / ChildTransactionResult: Parent/child hand-off

use crate::error::{StrataError, StrataResult};
use crate::hybrid_time::{HybridTime, ReadHybridTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a transaction
///
/// A TransactionId is a wrapper around a UUID v4, generated by the client the
/// first time the transaction is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Create a new random TransactionId using UUID v4
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a TransactionId from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get the raw bytes of this TransactionId
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a tablet (one shard and its replicas)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TabletId(String);

impl TabletId {
    /// Create a tablet id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque user key
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<u8>);

impl Key {
    /// Create a key from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Isolation level of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Single-shot operations outside any transaction
    NonTransactional,
    /// Snapshot isolation with write-write conflict detection
    SnapshotIsolation,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::NonTransactional => write!(f, "NON_TRANSACTIONAL"),
            IsolationLevel::SnapshotIsolation => write!(f, "SNAPSHOT_ISOLATION"),
        }
    }
}

/// Immutable description of an initialized transaction
///
/// Sent with every transactional read and write so participants know which
/// status tablet owns the transaction's outcome and how to rank it in a
/// conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    /// Transaction identity
    pub transaction_id: TransactionId,
    /// Isolation level fixed at initialization
    pub isolation: IsolationLevel,
    /// Tablet hosting the transaction's status record
    pub status_tablet: TabletId,
    /// Conflict-resolution priority; higher wins
    pub priority: u64,
    /// Client hybrid time at initialization
    pub start_time: HybridTime,
}

/// Authoritative transaction status held by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Running; outcome not decided
    Pending,
    /// Committed at the record's status time (terminal)
    Committed,
    /// Aborted (terminal)
    Aborted,
}

impl TransactionStatus {
    /// Whether the status can never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Pending => write!(f, "PENDING"),
            TransactionStatus::Committed => write!(f, "COMMITTED"),
            TransactionStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Why a transaction ended up ABORTED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortReason {
    /// The client asked for the abort
    Client,
    /// Another transaction won conflict resolution
    Conflict,
    /// Heartbeats stopped and the lease lapsed
    Expired,
}

impl AbortReason {
    /// Error a committer should observe for a transaction aborted for this reason
    pub fn to_error(self, transaction_id: TransactionId) -> StrataError {
        match self {
            AbortReason::Client => StrataError::Aborted {
                reason: format!("transaction {} aborted by client", transaction_id),
            },
            AbortReason::Conflict => StrataError::conflict(format!(
                "transaction {} aborted by conflict resolution",
                transaction_id
            )),
            AbortReason::Expired => StrataError::Expired { transaction_id },
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Client => write!(f, "client"),
            AbortReason::Conflict => write!(f, "conflict"),
            AbortReason::Expired => write!(f, "expired"),
        }
    }
}

/// Client-local lifecycle of a transaction handle
///
/// State transitions:
/// - `Created` → `Running` (first read/write or explicit init)
/// - `Running` → `RestartRequired` (a read hit an uncertain version)
/// - `Running` → `CommitRequested` (commit sent)
/// - `CommitRequested` → `Committed` | `Aborted` (coordinator answered)
/// - `Created` | `Running` | `RestartRequired` → `Aborted` (abort)
///
/// `Committed` and `Aborted` together form the DONE state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Not yet initialized
    Created,
    /// Initialized and usable
    Running,
    /// A read needs to be re-run at a later read time
    RestartRequired,
    /// Commit sent, waiting for the coordinator
    CommitRequested,
    /// DONE, committed
    Committed,
    /// DONE, aborted
    Aborted,
}

impl ClientState {
    /// Whether the handle reached DONE
    pub fn is_done(&self) -> bool {
        matches!(self, ClientState::Committed | ClientState::Aborted)
    }

    /// Whether heartbeats should be running in this state
    pub fn needs_heartbeat(&self) -> bool {
        matches!(
            self,
            ClientState::Running | ClientState::RestartRequired | ClientState::CommitRequested
        )
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Created => "CREATED",
            ClientState::Running => "RUNNING",
            ClientState::RestartRequired => "RESTART_REQUIRED",
            ClientState::CommitRequested => "COMMIT_REQUESTED",
            ClientState::Committed => "DONE(COMMITTED)",
            ClientState::Aborted => "DONE(ABORTED)",
        };
        f.write_str(name)
    }
}

/// Snapshot exported from a running parent to seed a child transaction
///
/// One-directional transfer object: the child never references the parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTransactionData {
    /// Parent metadata; the child writes under the same transaction id
    pub metadata: TransactionMetadata,
    /// Parent read time
    pub read_time: ReadHybridTime,
    /// Per-tablet local limits the parent already established
    pub local_limits: BTreeMap<TabletId, HybridTime>,
}

impl ChildTransactionData {
    /// Encode for shipping to another process
    pub fn encode(&self) -> StrataResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| StrataError::internal(e.to_string()))
    }

    /// Decode data produced by [`ChildTransactionData::encode`]
    pub fn decode(bytes: &[u8]) -> StrataResult<Self> {
        let data: Self = rmp_serde::from_slice(bytes)
            .map_err(|e| StrataError::invalid_input(format!("bad child data: {}", e)))?;
        if !data.read_time.is_valid() || !data.read_time.is_consistent() {
            return Err(StrataError::invalid_input(format!(
                "child data carries inconsistent read time {}",
                data.read_time
            )));
        }
        Ok(data)
    }
}

/// Work summary returned by a finished child, merged back into the parent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildTransactionResult {
    /// Lowest read time the parent may use afterwards; set when the child
    /// observed a restart requirement
    pub read_time_lower_bound: Option<HybridTime>,
    /// Tablets the child wrote intents to
    pub touched_tablets: BTreeSet<TabletId>,
    /// Local limits the child established
    pub local_limits: BTreeMap<TabletId, HybridTime>,
}

impl ChildTransactionResult {
    /// Encode for shipping to the parent's process
    pub fn encode(&self) -> StrataResult<Vec<u8>> {
        rmp_serde::to_vec(self).map_err(|e| StrataError::internal(e.to_string()))
    }

    /// Decode data produced by [`ChildTransactionResult::encode`]
    pub fn decode(bytes: &[u8]) -> StrataResult<Self> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| StrataError::invalid_input(format!("bad child result: {}", e)))
    }
}
