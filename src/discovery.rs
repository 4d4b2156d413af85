//! The Discovery collaborator, consumed only by the Cluster Manager.
//! Discovery never rewrites the peer set directly — it is diffed against
//! the known set, and the diff only takes effect once committed through
//! Raft.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::NodeId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub cluster_id: String,
    pub address: String,
    pub port: u16,
    pub metadata: std::collections::BTreeMap<String, String>,
}

#[async_trait]
pub trait Discovery: Send + Sync + 'static {
    async fn register(&self, info: NodeInfo) -> crate::error::RuntimeResult<()>;
    async fn deregister(&self, node_id: NodeId) -> crate::error::RuntimeResult<()>;
    async fn discover(&self, cluster_id: &str) -> crate::error::RuntimeResult<Vec<NodeInfo>>;
}
