//! Peer liveness tracking: a ping loop per known
//! peer with a three-strikes rule, independent of whether that peer is
//! currently reachable through Raft.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::transport::Transport;
use crate::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerHealth {
    Healthy,
    Suspect(u32),
    Unhealthy,
}

/// Tracks consecutive ping failures per peer and decides when a peer has
/// crossed the `unhealthy_after_failures` threshold.
pub struct HealthTable {
    unhealthy_after: u32,
    state: RwLock<HashMap<NodeId, PeerHealth>>,
}

impl HealthTable {
    pub fn new(unhealthy_after: u32) -> Self {
        Self { unhealthy_after, state: RwLock::new(HashMap::new()) }
    }

    /// Record a ping result for `peer`, returning `true` the moment it
    /// crosses from suspect into unhealthy (the caller should propose
    /// removal exactly once, on that transition).
    pub fn record(&self, peer: NodeId, reachable: bool) -> bool {
        let mut state = self.state.write();
        let entry = state.entry(peer).or_insert(PeerHealth::Healthy);
        if reachable {
            *entry = PeerHealth::Healthy;
            return false;
        }
        let failures = match entry {
            PeerHealth::Suspect(n) => *n + 1,
            _ => 1,
        };
        if failures >= self.unhealthy_after {
            let was_unhealthy = *entry == PeerHealth::Unhealthy;
            *entry = PeerHealth::Unhealthy;
            return !was_unhealthy;
        }
        *entry = PeerHealth::Suspect(failures);
        false
    }

    pub fn status(&self, peer: NodeId) -> PeerHealth {
        self.state.read().get(&peer).copied().unwrap_or(PeerHealth::Healthy)
    }

    pub fn remove(&self, peer: NodeId) {
        self.state.write().remove(&peer);
    }

    pub fn snapshot(&self) -> HashMap<NodeId, PeerHealth> {
        self.state.read().clone()
    }
}

/// A trivial reachability probe: attempts a zero-length send through the
/// transport and treats any transport error as unreachable. Real transports
/// are expected to implement an actual ping message type; this crate's
/// `Transport` trait only guarantees `send`/`recv`, so health probing
/// reuses that surface directly rather than inventing a parallel RPC kind.
pub async fn ping(transport: &Arc<dyn Transport>, from: NodeId, peer: NodeId) -> bool {
    let msg = crate::transport::Message {
        from,
        to: Some(peer),
        msg_type: crate::transport::MessageType::AppendEntriesResponse,
        term: 0,
        body: Vec::new(),
        timestamp: 0,
        signature: None,
        request_id: 0,
    };
    transport.send(peer, msg).await.is_ok()
}
