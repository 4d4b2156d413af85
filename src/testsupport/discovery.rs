//! An in-memory [`Discovery`] fake backed by a shared registry, so tests
//! can exercise the Cluster Manager's discovery-driven reconfiguration
//! without an external service-discovery backend.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::discovery::{Discovery, NodeInfo};
use crate::error::RuntimeResult;
use crate::NodeId;

#[derive(Default)]
pub struct InMemoryDiscovery {
    nodes: DashMap<NodeId, NodeInfo>,
}

impl InMemoryDiscovery {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Discovery for InMemoryDiscovery {
    async fn register(&self, info: NodeInfo) -> RuntimeResult<()> {
        self.nodes.insert(info.node_id, info);
        Ok(())
    }

    async fn deregister(&self, node_id: NodeId) -> RuntimeResult<()> {
        self.nodes.remove(&node_id);
        Ok(())
    }

    async fn discover(&self, cluster_id: &str) -> RuntimeResult<Vec<NodeInfo>> {
        Ok(self.nodes.iter().filter(|e| e.value().cluster_id == cluster_id).map(|e| e.value().clone()).collect())
    }
}
