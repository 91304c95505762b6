//! Client and tablet layers of the distributed transaction protocol
//!
//! This crate ties the lower layers together:
//! - Transaction: client state machine (lazy init, reads with restart,
//!   intents, commit/abort, heartbeats, child transactions)
//! - Session: statement API with transparent read restarts and retries
//! - StatusCoordinator: authoritative status table of one status tablet
//! - Tablet / LocalCluster: tablets wired together behind `TransactionRpc`
//! - TxnConfig: TOML-backed tunables
//!
//! Logging uses `tracing` targets `strata::txn`, `strata::session`,
//! `strata::coordinator` and `strata::cluster`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod retry;
pub mod session;
pub mod tablet;
pub mod transaction;

pub use cluster::{ClusterBuilder, LocalCluster, SweepStats};
pub use config::TxnConfig;
pub use coordinator::{CoordinatorMetrics, CoordinatorOptions, StatusCoordinator, StatusRecord};
pub use retry::{RetryConfig, RetryOn};
pub use session::{Session, MAX_READ_RESTARTS};
pub use tablet::Tablet;
pub use transaction::{Transaction, TransactionManager, TransactionMetrics};
