//! An in-memory [`Transport`] fake: a shared hub of per-node inboxes, with
//! partition simulation so tests can exercise log replication under a
//! network partition without real sockets.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{RuntimeError, RuntimeResult};
use crate::transport::{Message, Transport};
use crate::NodeId;

/// Shared switchboard every [`InMemoryTransport`] handle routes through.
#[derive(Default)]
pub struct Hub {
    inboxes: DashMap<NodeId, mpsc::UnboundedSender<Message>>,
    isolated: RwLock<HashSet<NodeId>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Isolate `node_id` from every peer: sends to or from it are dropped
    /// as if the network partitioned it away, matching the Transport
    /// collaborator's `partition(nodeSet)` event.
    pub fn isolate(&self, node_id: NodeId) {
        self.isolated.write().insert(node_id);
    }

    pub fn heal(&self, node_id: NodeId) {
        self.isolated.write().remove(&node_id);
    }

    fn is_isolated(&self, node_id: NodeId) -> bool {
        self.isolated.read().contains(&node_id)
    }
}

pub struct InMemoryTransport {
    node_id: NodeId,
    hub: Arc<Hub>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
}

impl InMemoryTransport {
    pub fn register(hub: Arc<Hub>, node_id: NodeId) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.inboxes.insert(node_id, tx);
        Self { node_id, hub, rx: tokio::sync::Mutex::new(rx) }
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: NodeId, msg: Message) -> RuntimeResult<()> {
        if self.hub.is_isolated(self.node_id) || self.hub.is_isolated(to) {
            return Err(RuntimeError::TransportUnavailable(format!("{to} is partitioned away")));
        }
        let Some(inbox) = self.hub.inboxes.get(&to) else {
            return Err(RuntimeError::TransportUnavailable(format!("no such node {to}")));
        };
        inbox.send(msg).map_err(|_| RuntimeError::TransportUnavailable(format!("{to} inbox closed")))
    }

    async fn recv(&self) -> RuntimeResult<Option<Message>> {
        Ok(self.rx.lock().await.recv().await)
    }
}
