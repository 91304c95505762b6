//! Core types and traits for Strata distributed transactions
//!
//! This crate defines the foundational types used throughout the system:
//! - HybridTime / ReadHybridTime: Physical+logical timestamps and snapshot windows
//! - Clock: PhysicalClock, HybridClock, ManualClock, SkewedClock (ClockSource)
//! - Types: TransactionId, TabletId, Key, TransactionMetadata, TransactionStatus
//! - Value: Scalar values and intent payloads
//! - Protocol: Request/response messages and the TransactionRpc transport trait
//! - Error: StrataError hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod error;
pub mod hybrid_time;
pub mod protocol;
pub mod types;
pub mod value;

pub use clock::{
    ClockRef, ClockSource, DeltaGuard, HybridClock, ManualClock, PhysicalClock, SkewedClock,
    SystemClock,
};
pub use error::{StrataError, StrataResult};
pub use hybrid_time::{HybridTime, ReadHybridTime};
pub use protocol::{
    ApplyRequest, GetStatusRequest, HeartbeatRequest, ReadRequest, ReadResponse, ReadResult,
    StatusResponse, StatusUpdate, TransactionRpc, UpdateStatusRequest, WriteRequest,
    WriteResponse,
};
pub use types::{
    AbortReason, ChildTransactionData, ChildTransactionResult, ClientState, IsolationLevel, Key,
    TabletId, TransactionId, TransactionMetadata, TransactionStatus,
};
pub use value::{IntentValue, Value};
