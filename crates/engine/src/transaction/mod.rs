//! Client side of the transaction protocol
//!
//! - [`TransactionManager`]: creates transactions over one transport
//! - [`Transaction`]: one transaction's state machine
//! - heartbeat: the background lease extension of a registered transaction
//! - child: exporting a snapshot to a child and merging its result back

mod child;
mod handle;
mod heartbeat;
mod manager;

pub use handle::Transaction;
pub use manager::{TransactionManager, TransactionMetrics};
