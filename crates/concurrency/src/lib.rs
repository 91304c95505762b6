//! Concurrency building blocks for the transaction protocol
//!
//! This crate provides:
//! - ConflictResolver: Priority-based write-conflict resolution with pluggable policies
//! - ConsistentReadPoint: Read-time selection, per-tablet local limits, read restarts
//! - BackgroundScheduler: Worker pool with delayed and periodic cancellable tasks
//! - Completion: One-shot handles for asynchronous commit and abort

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod background;
pub mod completion;
pub mod conflict;
pub mod read_point;

pub use background::{
    BackgroundScheduler, BackpressureError, Repeat, SchedulerStats, TaskHandle, TaskPriority,
};
pub use completion::{completion_pair, Completion, Promise};
pub use conflict::{
    CommittedConflict, ConflictResolver, Contender, EscalatingRandomPriority, FixedPriority,
    PriorityPolicy, Resolution, MAX_TRANSACTION_PRIORITY, NON_TRANSACTIONAL_PRIORITY,
};
pub use read_point::{ConsistentReadPoint, RestartTracker};
