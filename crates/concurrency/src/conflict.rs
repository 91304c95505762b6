//! Write-conflict resolution between concurrent transactions
//!
//! When a write by transaction A meets a provisional write (intent) of a
//! still-PENDING transaction B on the same key, exactly one of them may
//! proceed. The loser is aborted and its caller sees a retryable `Conflict`.
//!
//! # Rules
//!
//! - The transaction with the higher priority wins
//! - Equal priorities are broken by transaction id, so every pair has a
//!   deterministic winner
//! - Non-transactional writes carry [`NON_TRANSACTIONAL_PRIORITY`] and always win
//! - An intent whose owner already COMMITTED is not a priority question: it
//!   conflicts only if it committed after the writer's snapshot
//!
//! Priority assignment is a pluggable [`PriorityPolicy`]. The default policy
//! draws random priorities from a band that narrows toward the top with every
//! retry, so a transaction that keeps losing becomes likelier to win and the
//! system makes progress under contention.

use rand::Rng;
use std::fmt;
use std::sync::Arc;
use strata_core::{HybridTime, TransactionId, TransactionMetadata};

/// Highest priority a transaction can be assigned
pub const MAX_TRANSACTION_PRIORITY: u64 = u64::MAX - 1;

/// Priority used by non-transactional writes; beats every transaction
pub const NON_TRANSACTIONAL_PRIORITY: u64 = u64::MAX;

/// Assigns conflict-resolution priorities to new transactions
pub trait PriorityPolicy: Send + Sync + fmt::Debug {
    /// Priority for a transaction on its `attempt`-th try (0 for the first)
    fn assign(&self, attempt: u32) -> u64;
}

/// Random priorities from a band that escalates with each retry
///
/// Attempt `n` draws uniformly from
/// `[MAX - (MAX >> n), MAX]`: the whole range for the first try, the upper
/// half for the second, the upper quarter for the third and so on.
#[derive(Debug, Default, Clone, Copy)]
pub struct EscalatingRandomPriority;

impl EscalatingRandomPriority {
    /// Lowest priority attempt `attempt` can draw
    pub fn floor(attempt: u32) -> u64 {
        let shift = attempt.min(63);
        MAX_TRANSACTION_PRIORITY - (MAX_TRANSACTION_PRIORITY >> shift)
    }
}

impl PriorityPolicy for EscalatingRandomPriority {
    fn assign(&self, attempt: u32) -> u64 {
        rand::thread_rng().gen_range(Self::floor(attempt)..=MAX_TRANSACTION_PRIORITY)
    }
}

/// Deterministic priorities for tests: `base + attempt`
#[derive(Debug, Clone, Copy)]
pub struct FixedPriority(pub u64);

impl PriorityPolicy for FixedPriority {
    fn assign(&self, attempt: u32) -> u64 {
        self.0.saturating_add(attempt as u64).min(MAX_TRANSACTION_PRIORITY)
    }
}

/// One side of a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Contender {
    /// Transaction id, or `None` for a non-transactional write
    pub transaction_id: Option<TransactionId>,
    /// Conflict-resolution priority
    pub priority: u64,
}

impl Contender {
    /// Contender for a transactional write
    pub fn transaction(metadata: &TransactionMetadata) -> Self {
        Self {
            transaction_id: Some(metadata.transaction_id),
            priority: metadata.priority,
        }
    }

    /// Contender for a non-transactional write
    pub fn non_transactional() -> Self {
        Self {
            transaction_id: None,
            priority: NON_TRANSACTIONAL_PRIORITY,
        }
    }

    fn rank(&self) -> (u64, Option<TransactionId>) {
        // Non-transactional sorts above every transaction id at equal priority.
        (self.priority, self.transaction_id)
    }
}

/// Decision for a requester meeting a pending holder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The requester wins; the holder must be aborted
    AbortHolder,
    /// The holder wins; the requester must abort and retry
    AbortRequester,
}

/// How an intent of an already-committed transaction affects a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommittedConflict {
    /// Committed at or before the writer's snapshot; just an older version
    Visible,
    /// Committed after the writer's snapshot; the writer lost
    Newer,
}

/// Decides which of two contending writers proceeds
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    policy: Arc<dyn PriorityPolicy>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(Arc::new(EscalatingRandomPriority))
    }
}

impl ConflictResolver {
    /// Create a resolver with the given priority policy
    pub fn new(policy: Arc<dyn PriorityPolicy>) -> Self {
        Self { policy }
    }

    /// Priority for a new transaction on its `attempt`-th try
    pub fn assign_priority(&self, attempt: u32) -> u64 {
        self.policy.assign(attempt)
    }

    /// Decide between a writer and the pending owner of an intent
    pub fn resolve(&self, requester: &Contender, holder: &Contender) -> Resolution {
        if requester.rank() > holder.rank() {
            Resolution::AbortHolder
        } else {
            Resolution::AbortRequester
        }
    }

    /// Classify a committed write met by a writer reading at `read_time`
    pub fn classify_committed(
        &self,
        commit_time: HybridTime,
        read_time: HybridTime,
    ) -> CommittedConflict {
        if commit_time <= read_time {
            CommittedConflict::Visible
        } else {
            CommittedConflict::Newer
        }
    }
}
