//! The built-in replicated map state machine attached to the Cluster
//! Manager's Raft group. Commands are
//! ordinary `Normal` log entries; everything else (membership) is handled
//! by the Raft core itself via `configChange` entries.

use std::collections::BTreeMap;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// A command accepted by the replicated map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvCommand {
    Set { key: String, value: Vec<u8> },
    Delete { key: String },
    Increment { key: String, amount: i64 },
}

/// The response produced by applying a [`KvCommand`]; `Increment` returns
/// the resulting counter value so callers don't need a follow-up read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KvResponse {
    Ack,
    Counter(i64),
}

/// A concurrent string→bytes map, replicated via Raft. Reads never block
/// writers thanks to `DashMap`'s per-shard locking.
#[derive(Default)]
pub struct KvStateMachine {
    map: DashMap<String, Vec<u8>>,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, cmd: KvCommand) -> KvResponse {
        match cmd {
            KvCommand::Set { key, value } => {
                self.map.insert(key, value);
                KvResponse::Ack
            }
            KvCommand::Delete { key } => {
                self.map.remove(&key);
                KvResponse::Ack
            }
            KvCommand::Increment { key, amount } => {
                let mut entry = self.map.entry(key).or_insert_with(|| 0i64.to_le_bytes().to_vec());
                let current = i64::from_le_bytes(entry.as_slice().try_into().unwrap_or_default());
                let next = current + amount;
                *entry = next.to_le_bytes().to_vec();
                KvResponse::Counter(next)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.get(key).map(|v| v.clone())
    }

    /// A stable, sorted snapshot of the whole map for Raft log compaction.
    pub fn snapshot(&self) -> BTreeMap<String, Vec<u8>> {
        self.map.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    pub fn restore(&self, state: BTreeMap<String, Vec<u8>>) {
        self.map.clear();
        for (k, v) in state {
            self.map.insert(k, v);
        }
    }
}
