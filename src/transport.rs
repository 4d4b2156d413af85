//! The Transport collaborator: framed peer-to-peer delivery plus
//! partition/heal notifications. The core treats every send/recv as
//! fire-and-forget — a missing reply only fails to advance `matchIndex`,
//! it is never fatal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RuntimeResult;
use crate::NodeId;

/// The RPC payloads exchanged between Raft replicas, carried inside a
/// [`Message`] envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessageType {
    RequestVote,
    RequestVoteResponse,
    AppendEntries,
    AppendEntriesResponse,
    InstallSnapshot,
    InstallSnapshotResponse,
}

/// The wire envelope described in : `{from, to?, type, term, body, timestamp, signature?}`.
///
/// `body` is pre-serialized by the caller so that `Message` itself stays
/// payload-agnostic; the core (de)serializes the concrete RPC types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub from: NodeId,
    pub to: Option<NodeId>,
    pub msg_type: MessageType,
    pub term: u64,
    pub body: Vec<u8>,
    pub timestamp: u64,
    pub signature: Option<Vec<u8>>,
    /// Correlates a response message back to the request that triggered it.
    /// Required because the collaborator interface is fire-and-forget
    /// (`send`/`recv` rather than request/response) — see
    /// `raft::network::RaftNetworkClient`, which is the only thing that
    /// reads this field.
    pub request_id: u64,
}

/// A network-partition notification surfaced to the Cluster Manager and
/// Raft Replica so a leader can step down on loss of quorum.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    Partition { isolated: Vec<NodeId> },
    Heal,
}

/// Verifies a message's `signature` field. Signatures are treated as an
/// opaque predicate — real deployments substitute a vetted signature
/// primitive here; this crate does not attempt to reproduce any simulated
/// cryptography.
pub trait SignatureVerifier: Send + Sync + 'static {
    fn verify(&self, msg: &Message) -> bool;
}

/// Accepts every message; the default when no verifier is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllVerifier;

impl SignatureVerifier for AllowAllVerifier {
    fn verify(&self, _msg: &Message) -> bool {
        true
    }
}

/// The peer-to-peer transport collaborator required by the core.
///
/// Implementations are expected to be cheap to clone (e.g. `Arc`-wrapped)
/// and to serialize/length-prefix messages on the wire; this trait only
/// describes the logical send/receive surface.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one message to a peer, awaiting a transport-level ack (not a
    /// protocol-level response). Errors here are never fatal to the caller.
    async fn send(&self, to: NodeId, msg: Message) -> RuntimeResult<()>;

    /// Fetch the next inbound message, if any are buffered.
    async fn recv(&self) -> RuntimeResult<Option<Message>>;
}
