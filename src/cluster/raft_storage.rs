//! `RaftStorage` implementation backing the Cluster Manager's Raft group:
//! persistent state and the log live under the `raft/<nodeId>/...` keys,
//! on top of the generic `Storage` collaborator; the attached state
//! machine is the replicated map.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{RuntimeError, RuntimeResult};
use crate::kv_storage::Storage as KvStorage;
use crate::raft::storage::RaftStorage;
use crate::raft::types::*;
use crate::NodeId;

use super::kv_machine::{KvCommand, KvStateMachine};

fn meta_key(node_id: NodeId) -> Vec<u8> {
    format!("raft/{node_id}/meta").into_bytes()
}

fn log_key(node_id: NodeId, index: u64) -> Vec<u8> {
    format!("raft/{node_id}/log/{index:020}").into_bytes()
}

fn log_prefix(node_id: NodeId) -> Vec<u8> {
    format!("raft/{node_id}/log/").into_bytes()
}

pub struct ClusterRaftStorage<S: KvStorage> {
    node_id: NodeId,
    storage: std::sync::Arc<S>,
    machine: std::sync::Arc<KvStateMachine>,
    membership: RwLock<MembershipConfig>,
}

impl<S: KvStorage> ClusterRaftStorage<S> {
    pub fn new(node_id: NodeId, storage: std::sync::Arc<S>, machine: std::sync::Arc<KvStateMachine>) -> Self {
        Self { node_id, storage, machine, membership: RwLock::new(MembershipConfig::new_initial(node_id)) }
    }
}

#[async_trait]
impl<S: KvStorage> RaftStorage for ClusterRaftStorage<S> {
    async fn get_membership_config(&self) -> RuntimeResult<MembershipConfig> {
        Ok(self.membership.read().clone())
    }

    async fn get_initial_state(&self) -> RuntimeResult<InitialState> {
        let hard_state = match self.storage.get(&meta_key(self.node_id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?,
            None => HardState::default(),
        };
        let last_log_id = self.get_last_log_id().await?;
        Ok(InitialState {
            last_log_id,
            last_applied: LogId::ZERO,
            hard_state,
            membership: self.membership.read().clone(),
        })
    }

    async fn save_hard_state(&self, hs: &HardState) -> RuntimeResult<()> {
        let bytes = serde_json::to_vec(hs).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        self.storage.put(&meta_key(self.node_id), &bytes, true).await
    }

    async fn get_log_entries(&self, start: u64, stop: u64) -> RuntimeResult<Vec<Entry>> {
        let mut out = Vec::new();
        for index in start..stop {
            if let Some(e) = self.try_get_log_entry(index).await? {
                out.push(e);
            }
        }
        Ok(out)
    }

    async fn try_get_log_entry(&self, index: u64) -> RuntimeResult<Option<Entry>> {
        match self.storage.get(&log_key(self.node_id, index)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?)),
            None => Ok(None),
        }
    }

    async fn get_last_log_id(&self) -> RuntimeResult<LogId> {
        let prefix = log_prefix(self.node_id);
        let entries = self.storage.scan_prefix(&prefix).await?;
        match entries.last() {
            Some((_, bytes)) => {
                let e: Entry = serde_json::from_slice(bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
                Ok(e.log_id)
            }
            None => Ok(LogId::ZERO),
        }
    }

    async fn delete_logs_from(&self, from: u64) -> RuntimeResult<()> {
        let prefix = log_prefix(self.node_id);
        let entries = self.storage.scan_prefix(&prefix).await?;
        for (key, bytes) in entries {
            let e: Entry = serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
            if e.log_id.index >= from {
                self.storage.delete(&key).await?;
            }
        }
        Ok(())
    }

    async fn append_to_log(&self, entries: &[Entry]) -> RuntimeResult<()> {
        for entry in entries {
            let bytes = serde_json::to_vec(entry).map_err(|e| RuntimeError::Internal(e.to_string()))?;
            self.storage.put(&log_key(self.node_id, entry.log_id.index), &bytes, true).await?;
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[Entry]) -> RuntimeResult<Vec<Vec<u8>>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            match &entry.payload {
                EntryPayload::Normal(bytes) => {
                    let cmd: KvCommand = serde_json::from_slice(bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
                    let resp = self.machine.apply(cmd);
                    out.push(serde_json::to_vec(&resp).map_err(|e| RuntimeError::Internal(e.to_string()))?);
                }
                _ => out.push(Vec::new()),
            }
        }
        Ok(out)
    }

    async fn do_log_compaction(&self) -> RuntimeResult<Snapshot> {
        let last_log_id = self.get_last_log_id().await?;
        let membership = self.membership.read().clone();
        let state = self.machine.snapshot();
        let data = serde_json::to_vec(&state).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        Ok(Snapshot { meta: SnapshotMeta { last_log_id, membership }, data })
    }

    async fn finalize_snapshot_installation(&self, meta: &SnapshotMeta, data: Vec<u8>) -> RuntimeResult<()> {
        let state = serde_json::from_slice(&data).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
        self.machine.restore(state);
        *self.membership.write() = meta.membership.clone();
        self.delete_logs_from(0).await?;
        Ok(())
    }

    async fn get_current_snapshot(&self) -> RuntimeResult<Option<Snapshot>> {
        Ok(Some(self.do_log_compaction().await?))
    }
}
