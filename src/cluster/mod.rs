//! Cluster Manager: membership, discovery-driven reconfiguration,
//! and peer health, layered on top of a private Raft group running the
//! replicated key-value state machine.

pub mod health;
pub mod kv_machine;
pub mod raft_storage;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};

use crate::config::{ClusterConfig, RaftConfig};
use crate::context::Context;
use crate::discovery::{Discovery, NodeInfo};
use crate::error::{RuntimeError, RuntimeResult};
use crate::kv_storage::Storage as KvStorage;
use crate::metrics::RaftMetrics;
use crate::raft::network::RaftNetworkClient;
use crate::raft::types::{ConfigChange, State};
use crate::raft::Raft;
use crate::transport::Transport;
use crate::NodeId;

use health::HealthTable;
use kv_machine::{KvCommand, KvResponse, KvStateMachine};
use raft_storage::ClusterRaftStorage;

/// A point-in-time view of cluster membership and leadership, the payload
/// of `status()` and of `subscribe_state_changes()`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterStatus {
    pub node_id: NodeId,
    pub cluster_id: String,
    pub state: State,
    pub current_leader: Option<NodeId>,
    pub members: Vec<NodeId>,
}

pub struct ClusterManager<S: KvStorage> {
    node_id: NodeId,
    cluster_id: String,
    config: ClusterConfig,
    discovery: Arc<dyn Discovery>,
    transport: Arc<dyn Transport>,
    network: Arc<RaftNetworkClient>,
    verifier: Arc<dyn crate::transport::SignatureVerifier>,
    raft: Raft<ClusterRaftStorage<S>>,
    machine: Arc<KvStateMachine>,
    health: Arc<HealthTable>,
    known_peers: tokio::sync::RwLock<BTreeSet<NodeId>>,
    tx_state: broadcast::Sender<ClusterStatus>,
}

impl<S: KvStorage> ClusterManager<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        cluster_id: impl Into<String>,
        raft_config: Arc<RaftConfig>,
        cluster_config: ClusterConfig,
        ctx: Context,
        discovery: Arc<dyn Discovery>,
        transport: Arc<dyn Transport>,
        kv_storage: Arc<S>,
    ) -> Self {
        let machine = Arc::new(KvStateMachine::new());
        let raft_storage = Arc::new(ClusterRaftStorage::new(node_id, kv_storage, machine.clone()));
        let network = Arc::new(RaftNetworkClient::new(node_id, transport.clone(), Duration::from_millis(raft_config.election_timeout_min_ms)));
        let raft = Raft::new(node_id, raft_config, ctx, network.clone(), raft_storage);
        let (tx_state, _) = broadcast::channel(256);
        Self {
            node_id,
            cluster_id: cluster_id.into(),
            config: cluster_config,
            health: Arc::new(HealthTable::new(3)),
            discovery,
            transport,
            network,
            verifier: Arc::new(crate::transport::AllowAllVerifier),
            raft,
            machine,
            known_peers: tokio::sync::RwLock::new(BTreeSet::from([node_id])),
            tx_state,
        }
    }

    pub fn raft(&self) -> &Raft<ClusterRaftStorage<S>> {
        &self.raft
    }

    /// Bootstrap a brand-new cluster with exactly this node as the sole
    /// initial member; later members join via discovery + `configChange`.
    pub async fn bootstrap(&self) -> RuntimeResult<()> {
        self.raft
            .init_with_config(BTreeSet::from([self.node_id]))
            .await
            .map_err(|e| match e {
                crate::error::InitializeError::RuntimeError(e) => e,
                crate::error::InitializeError::NotAllowed => RuntimeError::Internal("already initialized".into()),
            })
    }

    pub async fn register_self(&self, address: String, port: u16) -> RuntimeResult<()> {
        self.discovery
            .register(NodeInfo {
                node_id: self.node_id,
                cluster_id: self.cluster_id.clone(),
                address,
                port,
                metadata: Default::default(),
            })
            .await
    }

    /// Poll discovery, diff against the known peer set, and propose
    /// exactly one `configChange` for the first discrepancy found (at most
    /// one pending change is allowed at a time).
    pub async fn reconcile_discovery(&self) -> RuntimeResult<()> {
        if self.raft.metrics().borrow().state != State::Leader {
            return Ok(());
        }
        let discovered: BTreeSet<NodeId> = self
            .discovery
            .discover(&self.cluster_id)
            .await?
            .into_iter()
            .map(|n| n.node_id)
            .collect();
        let known = self.known_peers.read().await.clone();

        if let Some(&joiner) = discovered.difference(&known).next() {
            if self.raft.change_membership(ConfigChange { add: Some(joiner), remove: None }).await.is_ok() {
                self.known_peers.write().await.insert(joiner);
            }
            return Ok(());
        }
        if let Some(&leaver) = known.difference(&discovered).next() {
            if leaver != self.node_id
                && self.raft.change_membership(ConfigChange { add: None, remove: Some(leaver) }).await.is_ok()
            {
                self.known_peers.write().await.remove(&leaver);
                self.health.remove(leaver);
            }
        }
        Ok(())
    }

    /// Ping every known peer; three consecutive failures proposes removal
    /// exactly once at the transition into `Unhealthy`.
    pub async fn run_health_sweep(&self) {
        let peers: Vec<NodeId> = self.known_peers.read().await.iter().copied().filter(|&p| p != self.node_id).collect();
        for peer in peers {
            let reachable = health::ping(&self.transport, self.node_id, peer).await;
            if self.health.record(peer, reachable) && self.raft.metrics().borrow().state == State::Leader {
                let _ = self.raft.change_membership(ConfigChange { add: None, remove: Some(peer) }).await;
            }
        }
    }

    /// Spawn the transport dispatch loop plus the discovery and health
    /// background loops. Intended to be called once after
    /// `bootstrap`/`init_with_config`.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        let network = self.network.clone();
        let raft = self.raft.clone();
        let verifier = self.verifier.clone();
        tokio::spawn(async move {
            crate::raft::network::run_dispatch_loop(network, raft, verifier).await;
        });

        let this = self.clone();
        let mut rx_metrics = self.raft.metrics();
        tokio::spawn(async move {
            loop {
                if rx_metrics.changed().await.is_err() {
                    return;
                }
                let _ = this.tx_state.send(this.status());
            }
        });

        let discovery_interval = self.config.discovery_interval;
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(discovery_interval);
            loop {
                tick.tick().await;
                if let Err(err) = this.reconcile_discovery().await {
                    tracing::warn!(?err, "discovery reconciliation failed");
                }
            }
        });

        let health_interval = self.config.health_check_interval;
        let this = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(health_interval);
            loop {
                tick.tick().await;
                this.run_health_sweep().await;
            }
        });
    }

    pub fn status(&self) -> ClusterStatus {
        let m = self.raft.metrics().borrow().clone();
        ClusterStatus {
            node_id: self.node_id,
            cluster_id: self.cluster_id.clone(),
            state: m.state,
            current_leader: m.current_leader,
            members: m.membership,
        }
    }

    /// Leader-only pass-through submission of an arbitrary command to the
    /// replicated map.
    pub async fn submit(&self, cmd: KvCommand) -> RuntimeResult<KvResponse> {
        let body = serde_json::to_vec(&cmd).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        let resp = self.raft.client_write(body).await.map_err(|e| match e {
            crate::error::ClientWriteError::RuntimeError(e) => e,
            crate::error::ClientWriteError::ChangeConfigError(_) => RuntimeError::Internal("unexpected".into()),
        })?;
        serde_json::from_slice(&resp.data).map_err(|e| RuntimeError::Corruption(e.to_string()))
    }

    pub async fn set(&self, key: impl Into<String>, value: Vec<u8>) -> RuntimeResult<()> {
        self.submit(KvCommand::Set { key: key.into(), value }).await.map(|_| ())
    }

    pub async fn delete(&self, key: impl Into<String>) -> RuntimeResult<()> {
        self.submit(KvCommand::Delete { key: key.into() }).await.map(|_| ())
    }

    pub async fn increment(&self, key: impl Into<String>, amount: i64) -> RuntimeResult<i64> {
        match self.submit(KvCommand::Increment { key: key.into(), amount }).await? {
            KvResponse::Counter(v) => Ok(v),
            KvResponse::Ack => Ok(0),
        }
    }

    /// Local, non-linearizable read of the replicated map, served directly
    /// from this replica's applied state rather than round-tripping Raft.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.machine.get(key)
    }

    pub fn subscribe_state_changes(&self) -> broadcast::Receiver<ClusterStatus> {
        self.tx_state.subscribe()
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.raft.metrics()
    }
}
