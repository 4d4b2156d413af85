//! The core logic of a Raft replica: a single-owner actor task that mutates
//! all Raft state itself, exactly as `async-raft::core::RaftCore` does.
//! Network I/O and timers never touch this state directly — they enqueue
//! `RaftMsg`s onto `rx_api` and the main loop drains them.

mod election;
mod membership;
mod replication_handling;
mod suspicion;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::RaftConfig;
use crate::context::Context;
use crate::error::{
    ChangeConfigError, ClientReadError, ClientWriteError, InitializeError, RuntimeError, RuntimeResult,
};
use crate::metrics::RaftMetrics;
use crate::raft::network::RaftNetworkClient;
use crate::raft::replication::{ReplicaEvent, ReplicationHandle};
use crate::raft::storage::RaftStorage;
use crate::raft::types::*;
use crate::NodeId;

pub(crate) use suspicion::SuspicionTable;

/// One entry awaiting either a client response or nothing (internal requests
/// such as the leader's initial blank entry).
pub(crate) struct PendingWrite {
    pub entry: Arc<Entry>,
    pub tx: Option<oneshot::Sender<RuntimeResult<ClientWriteResponse>>>,
}

/// Messages accepted by the `RaftCore` actor. Every public method on the
/// `Raft` facade is a thin round-trip through this channel.
pub enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<AppendEntriesResponse>,
    },
    RequestVote {
        rpc: RequestVoteRequest,
        tx: oneshot::Sender<RequestVoteResponse>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: oneshot::Sender<InstallSnapshotResponse>,
    },
    ClientWrite {
        req: ClientWriteRequest,
        tx: oneshot::Sender<RuntimeResult<ClientWriteResponse>>,
    },
    ClientRead {
        tx: oneshot::Sender<Result<(), ClientReadError>>,
    },
    InitWithConfig {
        members: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), InitializeError>>,
    },
    ChangeMembership {
        change: ConfigChange,
        tx: oneshot::Sender<Result<(), ChangeConfigError>>,
    },
    ReportSuspicion {
        peer: NodeId,
    },
    NetworkPartition {
        isolated: Vec<NodeId>,
    },
    NetworkHeal,
}

/// Per-follower leader-only volatile state plus a handle to its replication task.
struct FollowerState {
    next_index: u64,
    match_index: u64,
    replication: ReplicationHandle,
}

/// The subset of [`FollowerState`] known at the moment a new leader spawns
/// replication tasks, before anything has matched.
pub(crate) struct FollowerStateInit {
    pub(crate) next_index: u64,
    pub(crate) replication: ReplicationHandle,
}

/// A single pending, not-yet-committed membership change and when it must
/// time out: held in a map with a 30s timeout.
struct PendingChange {
    change: ConfigChange,
    started_at: Instant,
    tx: Option<oneshot::Sender<Result<(), ChangeConfigError>>>,
}

pub struct RaftCore<S: RaftStorage> {
    pub(crate) id: NodeId,
    pub(crate) config: Arc<RaftConfig>,
    pub(crate) ctx: Context,
    pub(crate) network: Arc<RaftNetworkClient>,
    pub(crate) storage: Arc<S>,

    pub(crate) state: State,
    pub(crate) membership: MembershipConfig,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) last_log_id: LogId,
    pub(crate) commit_index: u64,
    pub(crate) last_applied: u64,
    pub(crate) current_leader: Option<NodeId>,

    followers: BTreeMap<NodeId, FollowerState>,
    tx_leader_state: Option<watch::Sender<crate::raft::replication::LeaderVolatile>>,
    pending_change: Option<PendingChange>,
    pub(crate) suspects: SuspicionTable,

    last_heartbeat: Option<Instant>,
    next_election_timeout: Instant,

    rx_api: mpsc::UnboundedReceiver<RaftMsg>,
    rx_replica: mpsc::UnboundedReceiver<ReplicaEvent>,
    tx_replica: mpsc::UnboundedSender<ReplicaEvent>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,

    pending_writes: BTreeMap<u64, PendingWrite>,
    pub(crate) last_apply_response: Option<Vec<u8>>,
}

impl<S: RaftStorage> RaftCore<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<RaftConfig>,
        ctx: Context,
        network: Arc<RaftNetworkClient>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RuntimeResult<()>> {
        let (tx_replica, rx_replica) = mpsc::unbounded_channel();
        let this = Self {
            id,
            config,
            ctx,
            network,
            storage,
            state: State::Follower,
            membership: MembershipConfig::new_initial(id),
            current_term: 0,
            voted_for: None,
            last_log_id: LogId::ZERO,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            followers: BTreeMap::new(),
            tx_leader_state: None,
            pending_change: None,
            suspects: SuspicionTable::default(),
            last_heartbeat: None,
            next_election_timeout: Instant::now(),
            rx_api,
            rx_replica,
            tx_replica,
            tx_metrics,
            rx_shutdown,
            pending_writes: BTreeMap::new(),
            last_apply_response: None,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("raft_core", id)))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn main(mut self) -> RuntimeResult<()> {
        tracing::info!("raft replica initializing");
        let initial = self
            .storage
            .get_initial_state()
            .await
            .map_err(|e| self.fatal_storage_error(e))?;
        self.last_log_id = initial.last_log_id;
        self.current_term = initial.hard_state.current_term;
        self.voted_for = initial.hard_state.voted_for;
        self.membership = initial.membership;
        self.last_applied = initial.last_applied.index;
        self.commit_index = initial.last_applied.index;
        self.reset_election_timeout();
        self.publish_metrics();

        loop {
            match self.state {
                State::Follower | State::Candidate => self.run_follower_or_candidate().await?,
                State::Leader => self.run_leader().await?,
            }
            if self.rx_shutdown.try_recv().is_ok() {
                return Ok(());
            }
        }
    }

    fn fatal_storage_error(&self, err: RuntimeError) -> RuntimeError {
        tracing::error!(?err, "fatal storage error, replica stopping");
        RuntimeError::StorageFatal(err.to_string())
    }

    fn reset_election_timeout(&mut self) {
        let delay = self.ctx.entropy.gen_range_ms(self.config.election_timeout_range());
        self.next_election_timeout = Instant::now() + delay;
    }

    fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.config.heartbeat_interval_ms)
    }

    pub(crate) fn publish_metrics(&self) {
        let metrics = RaftMetrics {
            id: self.id,
            state: self.state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership: self.membership.members.iter().copied().collect(),
        };
        let _ = self.tx_metrics.send(metrics);
    }

    /// Any role steps down to follower on observing a higher term.
    async fn step_down_if_higher_term(&mut self, term: u64) -> RuntimeResult<bool> {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.storage
                .save_hard_state(&HardState { current_term: self.current_term, voted_for: None })
                .await
                .map_err(|e| self.fatal_storage_error(e))?;
            self.become_follower();
            return Ok(true);
        }
        Ok(false)
    }

    fn become_follower(&mut self) {
        if self.state != State::Follower {
            tracing::debug!(term = self.current_term, "stepping down to follower");
        }
        self.state = State::Follower;
        self.followers.clear();
        self.tx_leader_state = None;
        self.pending_change = None;
        self.current_leader = None;
        self.fail_all_pending_writes(RuntimeError::NotLeader(None));
        self.reset_election_timeout();
        self.publish_metrics();
    }

    async fn run_follower_or_candidate(&mut self) -> RuntimeResult<()> {
        loop {
            let sleep = tokio::time::sleep_until(self.next_election_timeout);
            tokio::select! {
                _ = sleep => {
                    self.on_election_timeout().await?;
                    if self.state == State::Leader { return Ok(()); }
                }
                Some(msg) = self.rx_api.recv() => {
                    self.handle_msg(msg).await?;
                    if self.state == State::Leader { return Ok(()); }
                }
                else => return Ok(()),
            }
        }
    }

    /// Nudge every follower's replication task on the leader's own
    /// heartbeat cadence, rather than relying solely on each task's
    /// independently-ticking interval (keeps heartbeats roughly
    /// synchronized and lets a newly-added follower get one immediately).
    fn send_heartbeats(&self) {
        for f in self.followers.values() {
            f.replication.nudge();
        }
    }

    async fn run_leader(&mut self) -> RuntimeResult<()> {
        self.become_leader().await?;
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval());
        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.send_heartbeats();
                    self.check_pending_change_timeout();
                }
                Some(msg) = self.rx_api.recv() => {
                    self.handle_msg(msg).await?;
                    if self.state != State::Leader { return Ok(()); }
                }
                Some(ev) = self.rx_replica.recv() => {
                    self.handle_replica_event(ev).await?;
                    if self.state != State::Leader { return Ok(()); }
                }
                else => return Ok(()),
            }
        }
    }

    async fn handle_msg(&mut self, msg: RaftMsg) -> RuntimeResult<()> {
        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let resp = self.handle_append_entries(rpc).await?;
                let _ = tx.send(resp);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let resp = self.handle_request_vote(rpc).await?;
                let _ = tx.send(resp);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let resp = self.handle_install_snapshot(rpc).await?;
                let _ = tx.send(resp);
            }
            RaftMsg::ClientWrite { req, tx } => {
                self.handle_client_write(req, Some(tx)).await?;
            }
            RaftMsg::ClientRead { tx } => {
                let res = self.handle_client_read().await;
                let _ = tx.send(res);
            }
            RaftMsg::InitWithConfig { members, tx } => {
                let res = self.handle_init_with_config(members).await;
                let _ = tx.send(res);
            }
            RaftMsg::ChangeMembership { change, tx } => {
                self.handle_change_membership(change, tx).await?;
            }
            RaftMsg::ReportSuspicion { peer } => {
                self.record_suspicion(peer).await?;
            }
            RaftMsg::NetworkPartition { isolated } => {
                self.handle_partition(isolated);
            }
            RaftMsg::NetworkHeal => {
                tracing::debug!("network partition healed");
            }
        }
        Ok(())
    }

    /// "leader → follower when a network-partition signal indicates
    /// loss of quorum".
    fn handle_partition(&mut self, isolated: Vec<NodeId>) {
        if self.state != State::Leader {
            return;
        }
        let reachable = self.membership.members.iter().filter(|m| !isolated.contains(m)).count();
        if reachable < self.membership.quorum_size() {
            tracing::warn!("quorum lost due to partition, stepping down");
            self.become_follower();
        }
    }

    async fn handle_replica_event(&mut self, ev: ReplicaEvent) -> RuntimeResult<()> {
        match ev {
            ReplicaEvent::RevertToFollower { term } => {
                self.step_down_if_higher_term(term).await?;
            }
            ReplicaEvent::UpdateMatchIndex { target, index } => {
                self.update_match_index(target, index).await?;
            }
        }
        Ok(())
    }

    /// Create the leader-volatile broadcast channel consumed by every
    /// replication task, seeded with the leader's state at the moment it
    /// takes office.
    pub(crate) fn init_leader_state(&mut self) -> watch::Receiver<crate::raft::replication::LeaderVolatile> {
        let (tx, rx) = watch::channel(crate::raft::replication::LeaderVolatile {
            last_log_id: self.last_log_id,
            commit_index: self.commit_index,
        });
        self.tx_leader_state = Some(tx);
        rx
    }

    pub(crate) fn leader_state_receiver(&self) -> Option<watch::Receiver<crate::raft::replication::LeaderVolatile>> {
        self.tx_leader_state.as_ref().map(|tx| tx.subscribe())
    }

    pub(crate) fn tx_replica_sender(&self) -> mpsc::UnboundedSender<ReplicaEvent> {
        self.tx_replica.clone()
    }

    pub(crate) fn add_follower(&mut self, peer: NodeId, init: FollowerStateInit) {
        self.followers.insert(peer, FollowerState { next_index: init.next_index, match_index: 0, replication: init.replication });
    }

    pub(crate) fn publish_leader_state(&self) {
        if let Some(tx) = &self.tx_leader_state {
            let _ = tx.send(crate::raft::replication::LeaderVolatile {
                last_log_id: self.last_log_id,
                commit_index: self.commit_index,
            });
        }
    }

    pub(crate) fn install_followers(&mut self, init: BTreeMap<NodeId, FollowerStateInit>) {
        self.followers = init
            .into_iter()
            .map(|(id, i)| (id, FollowerState { next_index: i.next_index, match_index: 0, replication: i.replication }))
            .collect();
    }

    pub(crate) fn follower_ids(&self) -> Vec<NodeId> {
        self.followers.keys().copied().collect()
    }

    pub(crate) fn follower_next_index(&self, peer: NodeId) -> Option<u64> {
        self.followers.get(&peer).map(|f| f.next_index)
    }

    pub(crate) fn set_follower_next_index(&mut self, peer: NodeId, next_index: u64) {
        if let Some(f) = self.followers.get_mut(&peer) {
            f.next_index = next_index;
        }
    }

    pub(crate) fn follower_replication(&self, peer: NodeId) -> Option<&ReplicationHandle> {
        self.followers.get(&peer).map(|f| &f.replication)
    }

    pub(crate) fn remove_follower(&mut self, peer: NodeId) {
        self.followers.remove(&peer);
    }

    pub(crate) fn set_follower_match_index(&mut self, peer: NodeId, index: u64) {
        if let Some(f) = self.followers.get_mut(&peer) {
            f.match_index = index;
            f.next_index = f.next_index.max(index + 1);
        }
    }

    pub(crate) fn follower_match_indices(&self) -> Vec<u64> {
        self.followers.values().map(|f| f.match_index).collect()
    }

    /// Election timers reset whenever a valid `AppendEntries` arrives from
    /// the current leader.
    pub(crate) fn reset_election_timeout_for_heartbeat(&mut self) {
        self.last_heartbeat = Some(Instant::now());
        self.reset_election_timeout();
    }

    pub(crate) fn follower_count(&self) -> usize {
        self.followers.len()
    }

    pub(crate) fn pending_change_is_set(&self) -> bool {
        self.pending_change.is_some()
    }

    pub(crate) fn pending_change_target(&self) -> Option<NodeId> {
        self.pending_change.as_ref().and_then(|p| p.change.add.or(p.change.remove))
    }

    pub(crate) fn set_pending_change(
        &mut self,
        change: ConfigChange,
        tx: oneshot::Sender<Result<(), ChangeConfigError>>,
    ) {
        self.pending_change = Some(PendingChange { change, started_at: Instant::now(), tx: Some(tx) });
    }

    pub(crate) fn take_pending_change_tx(&mut self) -> Option<oneshot::Sender<Result<(), ChangeConfigError>>> {
        self.pending_change.as_mut().and_then(|p| p.tx.take())
    }

    pub(crate) fn clear_pending_change(&mut self) {
        self.pending_change = None;
    }

    pub(crate) fn check_pending_change_timeout(&mut self) {
        if let Some(p) = &self.pending_change {
            if p.started_at.elapsed() > self.config.pending_change_timeout {
                tracing::warn!("pending membership change timed out");
                if let Some(tx) = self.pending_change.as_mut().and_then(|p| p.tx.take()) {
                    let _ = tx.send(Err(ChangeConfigError::ChangeInProgress));
                }
                self.pending_change = None;
            }
        }
    }

    pub(crate) fn add_pending_write(&mut self, index: u64, write: PendingWrite) {
        self.pending_writes.insert(index, write);
    }

    pub(crate) fn take_pending_write(&mut self, index: u64) -> Option<PendingWrite> {
        self.pending_writes.remove(&index)
    }

    pub(crate) fn fail_all_pending_writes(&mut self, err: RuntimeError) {
        for (_, w) in std::mem::take(&mut self.pending_writes) {
            if let Some(tx) = w.tx {
                let _ = tx.send(Err(err.clone()));
            }
        }
    }
}
