//! Suspicion-based peer quarantine. A **defensive**, not
//! Byzantine-safe, mechanism: it only counts envelope anomalies seen by
//! this single replica and quarantines the sender locally. This is
//! retained purely as a misbehavior heuristic, not as BFT.

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::broadcast;

use crate::error::RuntimeResult;
use crate::raft::storage::RaftStorage;
use crate::NodeId;

use super::RaftCore;

#[derive(Default)]
pub(crate) struct SuspicionTable {
    counts: HashMap<NodeId, u32>,
    quarantined_until: HashMap<NodeId, Instant>,
    tx_quarantine: Option<broadcast::Sender<NodeId>>,
}

impl SuspicionTable {
    pub(crate) fn is_quarantined(&self, peer: NodeId) -> bool {
        self.quarantined_until.get(&peer).map(|until| Instant::now() < *until).unwrap_or(false)
    }

    pub(crate) fn subscribe(&mut self) -> broadcast::Receiver<NodeId> {
        if let Some(tx) = &self.tx_quarantine {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(64);
        self.tx_quarantine = Some(tx);
        rx
    }
}

impl<S: RaftStorage> RaftCore<S> {
    /// Record one suspicion trigger (invalid envelope, unrecognized sender,
    /// signature mismatch — each adds 1). Above `suspicion_threshold` the
    /// peer is quarantined for `quarantine_period` and the Cluster Manager
    /// (via the broadcast channel) is notified to propose its removal.
    pub(crate) async fn record_suspicion(&mut self, peer: NodeId) -> RuntimeResult<()> {
        let count = self.suspects.counts.entry(peer).or_insert(0);
        *count += 1;
        let count = *count;
        tracing::debug!(peer, count, "suspicion recorded");

        if count >= self.config.suspicion_threshold {
            let until = Instant::now() + self.config.quarantine_period;
            self.suspects.quarantined_until.insert(peer, until);
            self.suspects.counts.remove(&peer);
            self.remove_follower(peer);
            tracing::warn!(peer, "peer quarantined due to repeated suspicion");
            if let Some(tx) = &self.suspects.tx_quarantine {
                let _ = tx.send(peer);
            }
        }
        Ok(())
    }

    pub(crate) fn is_peer_quarantined(&self, peer: NodeId) -> bool {
        self.suspects.is_quarantined(peer)
    }
}
