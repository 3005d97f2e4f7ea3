//! Graph collaborator backends
//!
//! This module provides implementations of the core `GraphBackend` trait:
//! - `MemoryGraph`: in-process graph for simulation and end-to-end tests
//! - `PwDumpGraph`: PipeWire through `pw-dump` and `pw-link`
//!
//! plus the `EventHub` that fans notifications out to the engine and the
//! `GraphPoller` that derives those notifications from periodic snapshots.

pub mod hub;
pub mod memory;
pub mod poller;
pub mod pw_dump;

pub use hub::EventHub;
pub use memory::MemoryGraph;
pub use poller::GraphPoller;
pub use pw_dump::{parse_dump, PwDumpGraph, PwToolError};
