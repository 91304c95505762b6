//! Storage side of the transaction protocol
//!
//! This crate implements the per-tablet participant:
//! - VersionChain: Committed versions of a key, newest first
//! - Participant: Intents, snapshot reads with restart detection, conflict
//!   checks on write, apply/discard of resolved transactions, compaction
//! - testing: In-memory status table for exercising a participant alone

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod participant;
pub mod testing;
pub mod version_chain;

pub use participant::{CompactionStats, Participant, ParticipantOptions, ParticipantStats};
pub use version_chain::{CommittedVersion, VersionChain};
