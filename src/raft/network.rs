//! Turns the fire-and-forget [`Transport`] collaborator into a
//! request/response client for Raft RPCs, by correlating outbound requests
//! and inbound responses via `Message::request_id`.
//!
//! This is a concrete adapter rather than a trait because the collaborator
//! shape is pinned to `send`/`recv`, not to a pluggable RPC trait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::error::{RuntimeError, RuntimeResult};
use crate::raft::storage::RaftStorage;
use crate::raft::types::{AppendEntriesRequest, InstallSnapshotRequest, RequestVoteRequest};
use crate::raft::Raft;
use crate::transport::{Message, MessageType, SignatureVerifier, Transport};
use crate::NodeId;

pub struct RaftNetworkClient {
    id: NodeId,
    transport: std::sync::Arc<dyn Transport>,
    pending: DashMap<u64, oneshot::Sender<Message>>,
    next_id: AtomicU64,
    request_timeout: Duration,
}

impl RaftNetworkClient {
    pub fn new(id: NodeId, transport: std::sync::Arc<dyn Transport>, request_timeout: Duration) -> Self {
        Self { id, transport, pending: DashMap::new(), next_id: AtomicU64::new(1), request_timeout }
    }

    /// Send a request-shaped RPC and await its correlated response, subject
    /// to a timeout. A timeout here is not fatal — it simply fails to
    /// advance replication progress for this round.
    pub async fn request(&self, to: NodeId, msg_type: MessageType, term: u64, body: Vec<u8>) -> RuntimeResult<Message> {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        let msg = Message {
            from: self.id,
            to: Some(to),
            msg_type,
            term,
            body,
            timestamp: 0,
            signature: None,
            request_id,
        };

        if self.transport.send(to, msg).await.is_err() {
            self.pending.remove(&request_id);
            return Err(RuntimeError::TransportUnavailable(format!("send to {to} failed")));
        }

        let result = timeout(self.request_timeout, rx).await;
        self.pending.remove(&request_id);
        match result {
            Ok(Ok(m)) => Ok(m),
            Ok(Err(_)) => Err(RuntimeError::TransportUnavailable(format!("connection to {to} dropped"))),
            Err(_) => Err(RuntimeError::Timeout),
        }
    }

    /// Send a one-way reply to a request, keyed by the same `request_id`.
    pub async fn reply(&self, to: NodeId, msg_type: MessageType, term: u64, body: Vec<u8>, request_id: u64) {
        let msg = Message { from: self.id, to: Some(to), msg_type, term, body, timestamp: 0, signature: None, request_id };
        let _ = self.transport.send(to, msg).await;
    }

    /// Fulfill a pending request with an inbound response message, if one
    /// is still being awaited (it may have already timed out).
    pub fn resolve(&self, msg: Message) {
        if let Some((_, tx)) = self.pending.remove(&msg.request_id) {
            let _ = tx.send(msg);
        }
    }

    pub fn transport(&self) -> &std::sync::Arc<dyn Transport> {
        &self.transport
    }
}

/// Drains the `Transport` collaborator's inbound stream and either resolves
/// a pending outbound request (by `request_id`) or dispatches an inbound
/// RPC to the local replica, replying over the same fire-and-forget
/// transport. A message that fails signature verification or fails to
/// deserialize is an envelope anomaly —
/// reported to the replica's suspicion table rather than treated as fatal,
/// since transport errors are never fatal.
///
/// Intended to be spawned once per node alongside the `Raft` actor task
/// (the `ClusterManager` does this in `spawn_background_loops`); nothing
/// about it is specific to the cluster membership Raft group, so a second
/// Raft group could reuse it with its own `RaftNetworkClient`.
pub async fn run_dispatch_loop<S: RaftStorage>(network: Arc<RaftNetworkClient>, raft: Raft<S>, verifier: Arc<dyn SignatureVerifier>) {
    loop {
        let msg = match network.transport.recv().await {
            Ok(Some(msg)) => msg,
            Ok(None) => continue,
            Err(err) => {
                tracing::debug!(?err, "transport recv failed, retrying");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        if !verifier.verify(&msg) {
            tracing::warn!(from = msg.from, "signature verification failed, quarantining sender");
            raft.report_suspicion(msg.from);
            continue;
        }

        match msg.msg_type {
            MessageType::RequestVoteResponse | MessageType::AppendEntriesResponse | MessageType::InstallSnapshotResponse => {
                network.resolve(msg);
            }
            MessageType::RequestVote => {
                let (from, term, request_id) = (msg.from, msg.term, msg.request_id);
                let Ok(rpc) = serde_json::from_slice::<RequestVoteRequest>(&msg.body) else {
                    raft.report_suspicion(from);
                    continue;
                };
                if let Ok(resp) = raft.request_vote(rpc).await {
                    let body = serde_json::to_vec(&resp).unwrap_or_default();
                    network.reply(from, MessageType::RequestVoteResponse, term, body, request_id).await;
                }
            }
            MessageType::AppendEntries => {
                let (from, term, request_id) = (msg.from, msg.term, msg.request_id);
                let Ok(rpc) = serde_json::from_slice::<AppendEntriesRequest>(&msg.body) else {
                    raft.report_suspicion(from);
                    continue;
                };
                if let Ok(resp) = raft.append_entries(rpc).await {
                    let body = serde_json::to_vec(&resp).unwrap_or_default();
                    network.reply(from, MessageType::AppendEntriesResponse, term, body, request_id).await;
                }
            }
            MessageType::InstallSnapshot => {
                let (from, term, request_id) = (msg.from, msg.term, msg.request_id);
                let Ok(rpc) = serde_json::from_slice::<InstallSnapshotRequest>(&msg.body) else {
                    raft.report_suspicion(from);
                    continue;
                };
                if let Ok(resp) = raft.install_snapshot(rpc).await {
                    let body = serde_json::to_vec(&resp).unwrap_or_default();
                    network.reply(from, MessageType::InstallSnapshotResponse, term, body, request_id).await;
                }
            }
        }
    }
}
