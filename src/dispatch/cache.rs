//! Query result cache: TTL + LRU eviction, with true single-flight per
//! key so concurrent identical lookups never run the handler more than
//! once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use crate::context::Context;

/// Stable cache key: the query type plus a sorted-keys JSON serialization
/// of its body, hashed.
pub fn cache_key(query_type: &str, body: &Value) -> String {
    let sorted = sort_keys(body);
    let mut hasher = Sha256::new();
    hasher.update(query_type.as_bytes());
    hasher.update(sorted.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), sort_keys(v));
            }
            serde_json::to_value(sorted).unwrap_or(Value::Null)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

struct Entry {
    value: Value,
    inserted_at: std::time::Instant,
    ttl: Duration,
}

impl Entry {
    fn is_expired(&self, now: std::time::Instant) -> bool {
        now.duration_since(self.inserted_at) > self.ttl
    }
}

enum Slot {
    Ready(Entry),
    /// A fetch for this key is already in flight; late arrivals subscribe
    /// to the same result instead of issuing their own fetch.
    InFlight(broadcast::Sender<Value>),
}

/// A sharded-by-key LRU+TTL cache with independent locks per shard;
/// capacity eviction walks an access-order list under the same lock that
/// guards the map, keeping per-key contention low (DashMap-style
/// striping).
pub struct QueryCache {
    shards: Vec<Mutex<ShardState>>,
    capacity_per_shard: usize,
    ctx: Context,
}

struct ShardState {
    entries: HashMap<String, Slot>,
    order: Vec<String>,
}

impl QueryCache {
    pub fn new(ctx: Context, capacity: usize) -> Self {
        let shard_count = 16;
        let shards = (0..shard_count)
            .map(|_| Mutex::new(ShardState { entries: HashMap::new(), order: Vec::new() }))
            .collect();
        Self { shards, capacity_per_shard: (capacity / shard_count).max(1), ctx }
    }

    fn shard_for(&self, key: &str) -> &Mutex<ShardState> {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let index = (digest[0] as usize) % self.shards.len();
        &self.shards[index]
    }

    /// Returns a cached value if present and unexpired, joins an in-flight
    /// fetch for the same key if one exists, or registers this caller as
    /// the one fetcher and returns `None` so it can populate the cache via
    /// [`Self::complete`].
    ///
    /// The lookup and the miss-path claim happen under one lock
    /// acquisition so two concurrent misses for the same key can never
    /// both be told to fetch: whichever caller observes the miss first
    /// inserts the `InFlight` slot before releasing the shard lock, and
    /// every later caller sees that slot instead of a second miss.
    pub async fn get_or_claim(&self, key: &str) -> CacheLookup {
        enum Outcome {
            Hit(Value),
            Join(broadcast::Receiver<Value>),
            Claim,
        }

        let outcome = {
            let mut shard = self.shard_for(key).lock();
            match shard.entries.get(key) {
                Some(Slot::Ready(entry)) if !entry.is_expired(self.ctx.clock.monotonic_now().into_std()) => {
                    Outcome::Hit(entry.value.clone())
                }
                Some(Slot::InFlight(tx)) => Outcome::Join(tx.subscribe()),
                _ => {
                    let (tx, _rx) = broadcast::channel(1);
                    shard.entries.insert(key.to_string(), Slot::InFlight(tx));
                    Outcome::Claim
                }
            }
        };

        match outcome {
            Outcome::Hit(v) => CacheLookup::Hit(v),
            Outcome::Join(mut rx) => match rx.recv().await {
                Ok(v) => CacheLookup::Hit(v),
                Err(_) => CacheLookup::Claim,
            },
            Outcome::Claim => CacheLookup::Claim,
        }
    }

    /// Populate the cache after a single-flight fetch completes, waking
    /// every caller that joined via [`Self::get_or_claim`].
    pub fn complete(&self, key: &str, value: Value, ttl: Duration) {
        let mut shard = self.shard_for(key).lock();
        if let Some(Slot::InFlight(tx)) = shard.entries.get(key) {
            let _ = tx.send(value.clone());
        }
        shard.entries.insert(key.to_string(), Slot::Ready(Entry { value, inserted_at: self.ctx.clock.monotonic_now().into_std(), ttl }));
        shard.order.retain(|k| k != key);
        shard.order.push(key.to_string());
        while shard.order.len() > self.capacity_per_shard {
            let evict = shard.order.remove(0);
            shard.entries.remove(&evict);
        }
    }

    pub fn fail(&self, key: &str) {
        let mut shard = self.shard_for(key).lock();
        shard.entries.remove(key);
    }
}

pub enum CacheLookup {
    Hit(Value),
    /// Caller owns the fetch and must call [`QueryCache::complete`] or
    /// [`QueryCache::fail`] when done.
    Claim,
}

pub type SharedQueryCache = Arc<QueryCache>;
