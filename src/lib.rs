//! Ensemble Runtime: a replicated application runtime combining a Raft
//! consensus engine, an event-sourced store, a saga orchestrator and
//! command/query dispatchers behind a single configuration surface.
//!
//! `raft` is the consensus engine proper; `cluster`, `eventstore`, `saga`
//! and `dispatch` are the application-level components built on top of it.

pub mod cluster;
pub mod config;
pub mod context;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod eventstore;
pub mod kv_storage;
pub mod metrics;
pub mod raft;
pub mod saga;
pub mod transport;

#[cfg(any(test, feature = "testsupport"))]
pub mod testsupport;

/// Node identity. A cheap `Copy + Ord` integer rather than an opaque
/// string, since it is used as a `BTreeSet`/`BTreeMap` key throughout Raft
/// membership state.
pub type NodeId = u64;

pub use config::RuntimeConfig;
pub use error::{RuntimeError, RuntimeResult};
