//! Error types for the transaction layer
//!
//! Every fallible operation in the workspace returns [`StrataResult`].
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! ## Propagation policy
//!
//! - Read restarts are recovered inside the transaction layer whenever legal;
//!   [`StrataError::RestartRequired`] only reaches callers that already
//!   received rows for the current statement.
//! - [`StrataError::Conflict`] and [`StrataError::Expired`] are retryable:
//!   the caller should run the work again in a new transaction.
//! - [`StrataError::NotFound`] for a transaction id means the status record is
//!   gone; callers treat it as ABORTED.

use crate::hybrid_time::HybridTime;
use crate::types::{TransactionId, TransactionStatus};
use thiserror::Error;

/// Result type alias for transaction operations
pub type StrataResult<T> = std::result::Result<T, StrataError>;

/// Error types for the transaction layer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StrataError {
    /// The transaction lease lapsed before commit; the coordinator aborted it
    #[error("transaction expired: {transaction_id}")]
    Expired {
        /// Transaction whose lease lapsed
        transaction_id: TransactionId,
    },

    /// Lost write-conflict resolution; retry as a new transaction
    #[error("conflict: {reason}")]
    Conflict {
        /// Human-readable description of the conflict
        reason: String,
    },

    /// Visibility is uncertain and the read cannot be restarted transparently
    #[error("read restart required at {restart_time}")]
    RestartRequired {
        /// Earliest read time at which the read becomes certain
        restart_time: HybridTime,
    },

    /// `init` was called again with different parameters
    #[error("transaction already initialized")]
    AlreadyInitialized,

    /// Operation is not legal in the transaction's current state
    #[error("invalid transaction state: {state}")]
    InvalidState {
        /// Description of the current state
        state: String,
    },

    /// Status record unknown to the coordinator (never created or retired)
    #[error("transaction not found: {transaction_id}")]
    NotFound {
        /// Transaction that was looked up
        transaction_id: TransactionId,
    },

    /// The transaction was aborted by an explicit client abort
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Human-readable reason for the abort
        reason: String,
    },

    /// A deadline passed before the operation completed
    #[error("timed out: {0}")]
    TimedOut(String),

    /// Transport-level failure; the request may be retried
    #[error("network error: {0}")]
    Network(String),

    /// Invalid argument or configuration
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Internal invariant violation
    #[error("internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        StrataError::Internal(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StrataError::InvalidInput(message.into())
    }

    /// Create a retryable conflict error
    pub fn conflict(reason: impl Into<String>) -> Self {
        StrataError::Conflict {
            reason: reason.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(state: impl Into<String>) -> Self {
        StrataError::InvalidState {
            state: state.into(),
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        StrataError::Network(message.into())
    }

    /// Whether running the work again in a new transaction may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StrataError::Conflict { .. } | StrataError::Expired { .. }
        )
    }

    /// Whether the error came from a transport failure worth resending
    pub fn is_transient(&self) -> bool {
        matches!(self, StrataError::Network(_) | StrataError::TimedOut(_))
    }

    /// Whether the transaction's lease lapsed
    pub fn is_expired(&self) -> bool {
        matches!(self, StrataError::Expired { .. })
    }

    /// Whether a read restart is required
    pub fn is_restart_required(&self) -> bool {
        matches!(self, StrataError::RestartRequired { .. })
    }

    /// Whether a status lookup found no record
    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound { .. })
    }

    /// Status a reader should assume for a transaction after this lookup error
    ///
    /// A missing record means the transaction was aborted and cleaned up
    /// (committed records are retained until every participant applied them).
    pub fn implied_status(&self) -> Option<TransactionStatus> {
        match self {
            StrataError::NotFound { .. } => Some(TransactionStatus::Aborted),
            _ => None,
        }
    }
}
