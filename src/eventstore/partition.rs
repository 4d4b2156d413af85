//! Stream→partition hashing and a sharded per-stream lock manager.
//! Locks are per stream, not per partition, so unrelated streams sharing a
//! partition never contend.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::model::StreamId;

pub fn partition_index(stream_id: &str, partition_count: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    stream_id.hash(&mut hasher);
    (hasher.finish() % partition_count as u64) as u32
}

/// Lazily-created per-stream mutexes, keyed by `StreamId`. A `DashMap`
/// bounds contention on the map itself to its internal shard count, while
/// the per-entry `tokio::sync::Mutex` gives each stream a fair, async-aware
/// exclusive append lock.
#[derive(Default)]
pub struct LockManager {
    locks: DashMap<StreamId, Arc<Mutex<()>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock_for(&self, stream_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(stream_id.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}
