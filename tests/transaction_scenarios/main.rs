//! End-to-end transaction scenarios against an in-process cluster
//!
//! Run with `RUST_LOG=strata=debug` to see the protocol at work.

#[path = "../common/mod.rs"]
mod common;

mod cleanup;
mod conflicts;
mod lifecycle;
mod snapshot;
