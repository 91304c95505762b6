//! Strata transactions - distributed snapshot-isolated transactions
//!
//! Keys are spread over tablets. Every transaction has a status tablet that
//! owns its outcome; writes land as intents at participant tablets and become
//! visible once the status tablet records COMMITTED. Read times are hybrid
//! times with a clock-skew uncertainty window, and reads that fall inside the
//! window are restarted at a later time.
//!
//! # Quick Start
//!
//! ```ignore
//! use stratadb_txn::{LocalCluster, Session, TxnConfig};
//!
//! let cluster = LocalCluster::start(3, TxnConfig::default())?;
//! let manager = cluster.transaction_manager();
//!
//! let session = Session::begin(&manager);
//! session.write("user:123", "Alice")?;
//! session.commit()?;
//!
//! let reader = Session::begin(&manager);
//! assert_eq!(reader.read("user:123")?, Some("Alice".into()));
//! ```
//!
//! # Architecture
//!
//! - `strata-core`: hybrid time, clocks, ids, wire messages, errors
//! - `strata-concurrency`: read points, conflict resolution, scheduler
//! - `strata-storage`: the per-tablet participant (intents and versions)
//! - `strata-engine`: status coordinator, client transactions, sessions,
//!   and an in-process cluster

pub use strata_concurrency::{
    ConflictResolver, EscalatingRandomPriority, FixedPriority, PriorityPolicy,
};
pub use strata_core::{
    ChildTransactionData, ChildTransactionResult, ClientState, HybridTime, IsolationLevel, Key,
    ReadHybridTime, StrataError, StrataResult, TabletId, TransactionId, TransactionStatus, Value,
};
pub use strata_engine::{
    ClusterBuilder, LocalCluster, RetryConfig, RetryOn, Session, StatusCoordinator, SweepStats, Tablet,
    Transaction, TransactionManager, TransactionMetrics, TxnConfig,
};
