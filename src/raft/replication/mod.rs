//! Per-follower replication stream: a task spawned by the leader for each
//! peer, responsible for sending `AppendEntries` (including the heartbeat
//! cadence) and reporting progress back to `RaftCore`. Modeled directly on
//! `async-raft::replication::{ReplicationStream, ReplicationCore}` — the
//! leader never blocks on a slow follower because each follower gets its
//! own task and its own retry loop, and a follower that has fallen behind
//! is caught up by decrementing `next_index` until the consistency check
//! passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::Instrument;

use crate::config::RaftConfig;
use crate::raft::network::RaftNetworkClient;
use crate::raft::storage::RaftStorage;
use crate::raft::types::*;
use crate::transport::MessageType;
use crate::NodeId;

/// The leader-side volatile state a replication task needs in order to know
/// how far it may replicate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaderVolatile {
    pub last_log_id: LogId,
    pub commit_index: u64,
}

/// Events a replication task reports back to `RaftCore`.
pub enum ReplicaEvent {
    /// The follower (or a peer it relayed through) observed a higher term;
    /// the leader must step down.
    RevertToFollower { term: u64 },
    /// The follower has durably replicated through `index`.
    UpdateMatchIndex { target: NodeId, index: u64 },
}

/// A handle to a spawned per-follower replication task.
pub struct ReplicationHandle {
    tx_nudge: mpsc::UnboundedSender<()>,
}

impl ReplicationHandle {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn<S: RaftStorage>(
        id: NodeId,
        target: NodeId,
        term: u64,
        config: Arc<RaftConfig>,
        network: Arc<RaftNetworkClient>,
        storage: Arc<S>,
        rx_leader_state: watch::Receiver<LeaderVolatile>,
        next_index: u64,
        raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    ) -> Self {
        let (tx_nudge, rx_nudge) = mpsc::unbounded_channel();
        let core = ReplicationCore {
            id,
            target,
            term,
            config,
            network,
            storage,
            rx_leader_state,
            raft_core_tx,
            rx_nudge,
            next_index,
        };
        tokio::spawn(core.run().instrument(tracing::debug_span!("replication", target)));
        Self { tx_nudge }
    }

    /// Nudge the task to try replicating again promptly instead of waiting
    /// for its next heartbeat tick.
    pub fn nudge(&self) {
        let _ = self.tx_nudge.send(());
    }
}

struct ReplicationCore<S> {
    id: NodeId,
    target: NodeId,
    term: u64,
    config: Arc<RaftConfig>,
    network: Arc<RaftNetworkClient>,
    storage: Arc<S>,
    rx_leader_state: watch::Receiver<LeaderVolatile>,
    raft_core_tx: mpsc::UnboundedSender<ReplicaEvent>,
    rx_nudge: mpsc::UnboundedReceiver<()>,
    next_index: u64,
}

impl<S: RaftStorage> ReplicationCore<S> {
    async fn run(mut self) {
        let mut hb = interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = hb.tick() => {
                    if !self.send_once().await { return; }
                }
                n = self.rx_nudge.recv() => {
                    if n.is_none() { return; }
                    if !self.send_once().await { return; }
                }
            }
        }
    }

    /// Send one `AppendEntries`: real entries from `next_index` onward if
    /// the follower needs catching up, otherwise an empty heartbeat.
    /// Returns `false` if the task should exit (leader stepped down).
    async fn send_once(&mut self) -> bool {
        let leader_state = *self.rx_leader_state.borrow();

        let prev_index = self.next_index.saturating_sub(1);
        let prev_log_id = if prev_index == 0 {
            LogId::ZERO
        } else {
            match self.storage.try_get_log_entry(prev_index).await {
                Ok(Some(e)) => e.log_id,
                Ok(None) => LogId::ZERO,
                Err(_) => return true,
            }
        };

        let entries = if self.next_index <= leader_state.last_log_id.index {
            let stop = (self.next_index + self.config.max_log_entries_per_append as u64).min(leader_state.last_log_id.index + 1);
            match self.storage.get_log_entries(self.next_index, stop).await {
                Ok(e) => e,
                Err(_) => return true,
            }
        } else {
            Vec::new()
        };

        let rpc = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_id,
            entries: entries.clone(),
            leader_commit: leader_state.commit_index,
        };
        let body = match serde_json::to_vec(&rpc) {
            Ok(b) => b,
            Err(_) => return true,
        };
        let resp = self.network.request(self.target, MessageType::AppendEntries, self.term, body).await;
        match resp {
            Ok(m) => match serde_json::from_slice::<AppendEntriesResponse>(&m.body) {
                Ok(r) if r.term > self.term => {
                    let _ = self.raft_core_tx.send(ReplicaEvent::RevertToFollower { term: r.term });
                    false
                }
                Ok(r) if r.success => {
                    if let Some(last) = entries.last() {
                        self.next_index = last.log_id.index + 1;
                        let _ = self
                            .raft_core_tx
                            .send(ReplicaEvent::UpdateMatchIndex { target: self.target, index: last.log_id.index });
                    }
                    true
                }
                Ok(r) => {
                    // Log mismatch: decrement and retry on the next tick.
                    self.next_index = r.conflict_index.unwrap_or_else(|| prev_index.max(1));
                    true
                }
                Err(_) => true,
            },
            // Transport errors are never fatal: a
            // missing reply just fails to advance match_index this round.
            Err(_) => true,
        }
    }
}
