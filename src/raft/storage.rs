//! The `RaftStorage` trait: the seam between the protocol and whichever
//! state machine is attached (Event Store append pipeline, or the Cluster
//! Manager's replicated map). Shaped directly on
//! `async-raft::storage::RaftStorage`.

use async_trait::async_trait;

use super::types::{Entry, HardState, InitialState, MembershipConfig, Snapshot, SnapshotMeta};
use crate::error::RuntimeResult;

/// A Raft storage engine. All methods except `apply_to_state_machine` must
/// never fail under normal operation: any error returned from them other
/// than from `apply_to_state_machine` causes the replica to stop serving
///.
#[async_trait]
pub trait RaftStorage: Send + Sync + 'static {
    async fn get_membership_config(&self) -> RuntimeResult<MembershipConfig>;

    async fn get_initial_state(&self) -> RuntimeResult<InitialState>;

    async fn save_hard_state(&self, hs: &HardState) -> RuntimeResult<()>;

    /// Fetch entries in `[start, stop)`.
    async fn get_log_entries(&self, start: u64, stop: u64) -> RuntimeResult<Vec<Entry>>;

    async fn try_get_log_entry(&self, index: u64) -> RuntimeResult<Option<Entry>>;

    async fn get_last_log_id(&self) -> RuntimeResult<super::types::LogId>;

    /// Delete all log entries with index >= `from`.
    async fn delete_logs_from(&self, from: u64) -> RuntimeResult<()>;

    /// Append entries, in order, to the log. Entry indices determine their
    /// storage location; this never needs to interpret payloads.
    async fn append_to_log(&self, entries: &[Entry]) -> RuntimeResult<()>;

    /// Apply committed entries to the attached state machine, returning one
    /// response payload per entry. This is the one method allowed to fail
    /// with an application-level error without taking the replica down —
    /// callers distinguish via `RuntimeError::StorageFatal`.
    async fn apply_to_state_machine(&self, entries: &[Entry]) -> RuntimeResult<Vec<Vec<u8>>>;

    /// Export the state machine's current state and return a new snapshot.
    async fn do_log_compaction(&self) -> RuntimeResult<Snapshot>;

    /// Install a snapshot streamed from a leader, truncating the log
    /// through `meta.last_log_id.index`.
    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, data: Vec<u8>) -> RuntimeResult<()>;

    async fn get_current_snapshot(&self) -> RuntimeResult<Option<Snapshot>>;
}
