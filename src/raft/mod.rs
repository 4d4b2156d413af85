//! Public Raft interface. Mirrors `async-raft::raft::Raft`: a cheaply
//! `Clone`-able facade over an actor task, every method a oneshot
//! round-trip through an internal command channel.

pub mod core;
pub mod network;
pub mod replication;
pub mod storage;
pub mod types;

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::RaftConfig;
use crate::context::Context;
use crate::error::{
    ChangeConfigError, ClientReadError, ClientWriteError, InitializeError, RuntimeError, RuntimeResult,
};
use crate::metrics::RaftMetrics;
use crate::NodeId;

use self::core::{RaftCore, RaftMsg};
use self::network::RaftNetworkClient;
use self::storage::RaftStorage;
use self::types::*;

struct RaftInner {
    tx_api: mpsc::UnboundedSender<RaftMsg>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    handle: Mutex<Option<JoinHandle<RuntimeResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The Raft API. Implements `Clone`; clones share the same underlying
/// actor task and are cheap, so applications are expected to clone this
/// liberally rather than wrap it again in an `Arc`.
#[derive(Clone)]
pub struct Raft<S: RaftStorage> {
    inner: Arc<RaftInner>,
    _storage: std::marker::PhantomData<S>,
}

impl<S: RaftStorage> Raft<S> {
    #[tracing::instrument(level = "trace", skip(config, ctx, network, storage), fields(cluster = %config.cluster_name))]
    pub fn new(id: NodeId, config: Arc<RaftConfig>, ctx: Context, network: Arc<RaftNetworkClient>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let handle = RaftCore::spawn(id, config, ctx, network, storage, rx_api, tx_metrics, rx_shutdown);
        Self {
            inner: Arc::new(RaftInner {
                tx_api,
                rx_metrics,
                handle: Mutex::new(Some(handle)),
                tx_shutdown: Mutex::new(Some(tx_shutdown)),
            }),
            _storage: std::marker::PhantomData,
        }
    }

    async fn call<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> RaftMsg) -> RuntimeResult<T> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx_api.send(build(tx)).map_err(|_| RuntimeError::ShuttingDown)?;
        rx.await.map_err(|_| RuntimeError::ShuttingDown)
    }

    /// Handle an inbound `AppendEntries` RPC.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> RuntimeResult<AppendEntriesResponse> {
        self.call(|tx| RaftMsg::AppendEntries { rpc, tx }).await
    }

    /// Handle an inbound `RequestVote` RPC.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn request_vote(&self, rpc: RequestVoteRequest) -> RuntimeResult<RequestVoteResponse> {
        self.call(|tx| RaftMsg::RequestVote { rpc, tx }).await
    }

    /// Handle an inbound `InstallSnapshot` RPC.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> RuntimeResult<InstallSnapshotResponse> {
        self.call(|tx| RaftMsg::InstallSnapshot { rpc, tx }).await
    }

    /// Submit an opaque command to be replicated and applied. Leader-only;
    /// a follower rejects with `NotLeader(current_leader)`.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn client_write(&self, payload: Vec<u8>) -> Result<ClientWriteResponse, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientWrite { req: ClientWriteRequest::Normal(payload), tx })
            .map_err(|_| ClientWriteError::RuntimeError(RuntimeError::ShuttingDown))?;
        rx.await.map_err(|_| ClientWriteError::RuntimeError(RuntimeError::ShuttingDown))?.map_err(ClientWriteError::RuntimeError)
    }

    /// Confirm this node still holds leadership before a linearizable read.
    pub async fn client_read(&self) -> Result<(), ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ClientRead { tx })
            .map_err(|_| ClientReadError::RuntimeError(RuntimeError::ShuttingDown))?;
        rx.await.map_err(|_| ClientReadError::RuntimeError(RuntimeError::ShuttingDown))?
    }

    /// Bootstrap a fresh cluster with the given initial member set.
    pub async fn init_with_config(&self, members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::InitWithConfig { members, tx })
            .map_err(|_| InitializeError::RuntimeError(RuntimeError::ShuttingDown))?;
        rx.await.map_err(|_| InitializeError::RuntimeError(RuntimeError::ShuttingDown))?
    }

    /// Propose a single membership add or remove. At most one change may be
    /// in flight at a time; a second call while one is pending
    /// returns `ChangeConfigError::ChangeInProgress`.
    pub async fn change_membership(&self, change: ConfigChange) -> Result<(), ChangeConfigError> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send(RaftMsg::ChangeMembership { change, tx })
            .map_err(|_| ChangeConfigError::RuntimeError(RuntimeError::ShuttingDown))?;
        rx.await.map_err(|_| ChangeConfigError::RuntimeError(RuntimeError::ShuttingDown))?
    }

    /// Record an envelope anomaly observed from `peer` toward the
    /// suspicion/quarantine mechanism.
    pub fn report_suspicion(&self, peer: NodeId) {
        let _ = self.inner.tx_api.send(RaftMsg::ReportSuspicion { peer });
    }

    pub fn report_partition(&self, isolated: Vec<NodeId>) {
        let _ = self.inner.tx_api.send(RaftMsg::NetworkPartition { isolated });
    }

    pub fn report_heal(&self) {
        let _ = self.inner.tx_api.send(RaftMsg::NetworkHeal);
    }

    /// A live view of this replica's metrics, updated after every state change.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Shut down the Raft task and await its completion.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn shutdown(&self) -> RuntimeResult<()> {
        let tx = self.inner.tx_shutdown.lock().await.take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let handle = self.inner.handle.lock().await.take();
        if let Some(handle) = handle {
            handle.await.map_err(|e| RuntimeError::Internal(e.to_string()))??;
        }
        Ok(())
    }
}
