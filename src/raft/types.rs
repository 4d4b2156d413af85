//! Core Raft data types: log identity, entries, membership, and RPC
//! request/response shapes. Modeled on `async-raft::raft` and
//! `async-raft::storage`, generalized so the state machine payload (`D`) is
//! this crate's concrete command type rather than a type parameter. The
//! Cluster Manager's replicated map is the one state machine this crate
//! drives through Raft today; see `eventstore`'s module docs for why the
//! Event Store is durable-per-replica via the Storage collaborator instead
//! of a second Raft group (see DESIGN.md for the full rationale).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A Raft log identity: `(term, index)`, ordered first by term then index,
/// matching `async-raft::LogId`'s comparison semantics.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub const ZERO: LogId = LogId { term: 0, index: 0 };
}

/// The role a replica believes it currently holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

/// The payload carried by a committed Raft log entry. `Normal` carries an
/// opaque, pre-serialized command for whichever state machine owns this
/// log (Event Store append pipeline or Cluster Manager replicated map).
/// `ConfigChange` entries are interpreted by the Raft core itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EntryPayload {
    Blank,
    Normal(Vec<u8>),
    ConfigChange(ConfigChange),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChange {
    pub add: Option<NodeId>,
    pub remove: Option<NodeId>,
}

/// One entry in the replicated log: `{index, term, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
    pub timestamp_ms: u64,
}

impl Entry {
    pub fn new_blank(log_id: LogId, timestamp_ms: u64) -> Self {
        Self { log_id, payload: EntryPayload::Blank, timestamp_ms }
    }
}

/// The current cluster membership as known to a replica. Joint consensus
/// is deliberately not implemented, so there is no `members_after_consensus`
/// field — only the current member set, plus the single pending change
/// guarded elsewhere by a 30s timeout.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MembershipConfig {
    pub members: BTreeSet<NodeId>,
}

impl MembershipConfig {
    pub fn new_initial(id: NodeId) -> Self {
        let mut members = BTreeSet::new();
        members.insert(id);
        Self { members }
    }

    /// Quorum size including self: `floor(n/2) + 1` over a peer set that
    /// always includes the local node.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// Persistent hard state: `{currentTerm, votedFor}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// The state a storage implementation must report when a replica first
/// starts, mirroring `async-raft::storage::InitialState`.
#[derive(Debug, Clone)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied: LogId,
    pub hard_state: HardState,
    pub membership: MembershipConfig,
}

impl InitialState {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::ZERO,
            last_applied: LogId::ZERO,
            hard_state: HardState::default(),
            membership: MembershipConfig::new_initial(id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_log_id: LogId,
    pub membership: MembershipConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

// ---- RPCs -------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_id: LogId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_id: LogId,
    pub entries: Vec<Entry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    /// When rejecting, the highest index the follower can prove matches the
    /// leader, letting the leader jump `next_index` down in one step
    /// instead of decrementing one at a time.
    pub conflict_index: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: u64,
}

/// A client write request: an opaque command payload bound for the
/// attached state machine, or an internal config-change/blank entry.
#[derive(Debug, Clone)]
pub enum ClientWriteRequest {
    Normal(Vec<u8>),
    ConfigChange(ConfigChange),
    Blank,
}

impl ClientWriteRequest {
    pub(crate) fn into_payload(self) -> EntryPayload {
        match self {
            ClientWriteRequest::Normal(b) => EntryPayload::Normal(b),
            ClientWriteRequest::ConfigChange(c) => EntryPayload::ConfigChange(c),
            ClientWriteRequest::Blank => EntryPayload::Blank,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientWriteResponse {
    pub log_id: LogId,
    /// The state machine's response bytes, produced by applying the entry.
    pub data: Vec<u8>,
}
