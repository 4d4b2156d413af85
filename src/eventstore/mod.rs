//! Event Store: a partitioned, append-only, versioned event log
//! with optimistic concurrency, snapshots, subscriptions, and projections.
//!
//! Durability is provided directly by the `Storage` collaborator under the
//! `events/<partition>/<streamId>`, `snapshots/<streamId>/<version>` and
//! `subs/<subscriptionId>` key layouts; this component does
//! not itself require Raft (ordering per stream is guaranteed by the
//! per-stream append lock, not by consensus — only the Cluster Manager's
//! membership state goes through the Raft group in this crate).

pub mod model;
pub mod partition;
pub mod projection;
pub mod subscription;
pub mod transaction;

use std::sync::Arc;

use uuid::Uuid;

use crate::config::EventStoreConfig;
use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult};
use crate::kv_storage::Storage;

use model::{Event, NewEvent, Snapshot, StreamId};
use partition::{partition_index, LockManager};
use projection::ProjectionRunner;
use subscription::{Subscription, SubscriptionMessage, SubscriptionMode, SubscriptionRegistry, SubscriptionTarget};
use transaction::Transaction;

/// A codec hook for the `compressionEnabled`/`encryptionEnabled` config
/// flags.
pub trait PayloadCodec: Send + Sync + 'static {
    fn encode(&self, bytes: Vec<u8>) -> Vec<u8>;
    fn decode(&self, bytes: Vec<u8>) -> Vec<u8>;
}

#[derive(Default)]
pub struct PassthroughCodec;

impl PayloadCodec for PassthroughCodec {
    fn encode(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }
    fn decode(&self, bytes: Vec<u8>) -> Vec<u8> {
        bytes
    }
}

fn events_prefix(partition: u32, stream_id: &str) -> Vec<u8> {
    format!("events/{partition}/{stream_id}/").into_bytes()
}

fn event_key(partition: u32, stream_id: &str, version: u64) -> Vec<u8> {
    format!("events/{partition}/{stream_id}/{version:020}").into_bytes()
}

fn meta_key(partition: u32, stream_id: &str) -> Vec<u8> {
    format!("events/{partition}/{stream_id}/_meta").into_bytes()
}

fn snapshot_prefix(stream_id: &str) -> Vec<u8> {
    format!("snapshots/{stream_id}/").into_bytes()
}

fn snapshot_key(stream_id: &str, version: u64) -> Vec<u8> {
    format!("snapshots/{stream_id}/{version:020}").into_bytes()
}

fn sub_checkpoint_key(sub_id: Uuid) -> Vec<u8> {
    format!("subs/{sub_id}").into_bytes()
}

pub struct AppendResult {
    pub new_version: u64,
    pub event_ids: Vec<Uuid>,
}

pub struct ReadStreamResult {
    pub events: Vec<Event>,
    pub next_version: u64,
    pub is_end: bool,
}

pub struct EventStore<S: Storage> {
    storage: Arc<S>,
    ctx: Context,
    config: EventStoreConfig,
    codec: Arc<dyn PayloadCodec>,
    locks: LockManager,
    subscriptions: SubscriptionRegistry,
    projections: dashmap::DashMap<String, Arc<ProjectionRunner>>,
}

impl<S: Storage> EventStore<S> {
    pub fn new(storage: Arc<S>, ctx: Context, config: EventStoreConfig) -> Self {
        Self {
            storage,
            ctx,
            config,
            codec: Arc::new(PassthroughCodec),
            locks: LockManager::new(),
            subscriptions: SubscriptionRegistry::new(),
            projections: dashmap::DashMap::new(),
        }
    }

    pub fn with_codec(mut self, codec: Arc<dyn PayloadCodec>) -> Self {
        self.codec = codec;
        self
    }

    fn partition_of(&self, stream_id: &str) -> u32 {
        partition_index(stream_id, self.config.partition_count)
    }

    async fn current_version(&self, partition: u32, stream_id: &str) -> RuntimeResult<u64> {
        match self.storage.get(&meta_key(partition, stream_id)).await? {
            Some(bytes) => Ok(u64::from_le_bytes(bytes.as_slice().try_into().map_err(|_| RuntimeError::Corruption("stream meta".into()))?)),
            None => Ok(0),
        }
    }

    fn encode_payload(&self, bytes: Vec<u8>) -> Vec<u8> {
        if self.config.compression_enabled || self.config.encryption_enabled {
            self.codec.encode(bytes)
        } else {
            bytes
        }
    }

    fn decode_payload(&self, bytes: Vec<u8>) -> Vec<u8> {
        if self.config.compression_enabled || self.config.encryption_enabled {
            self.codec.decode(bytes)
        } else {
            bytes
        }
    }

    fn timestamp_ms(&self) -> u64 {
        self.ctx.clock.wall_now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// Append: acquire the per-stream lock, validate `expected_version`
    /// (`-1` means "don't care"), assign versions, checksum, persist, and
    /// fan out to subscriptions/projections.
    #[tracing::instrument(level = "debug", skip(self, events), fields(stream_id = %stream_id))]
    pub async fn append(&self, stream_id: impl Into<StreamId>, events: Vec<NewEvent>, expected_version: i64) -> RuntimeResult<AppendResult> {
        let stream_id: StreamId = stream_id.into();
        let lock = self.locks.lock_for(&stream_id);
        let _guard = lock.lock().await;
        self.append_locked(&stream_id, events, expected_version).await
    }

    async fn append_locked(&self, stream_id: &str, events: Vec<NewEvent>, expected_version: i64) -> RuntimeResult<AppendResult> {
        let partition = self.partition_of(stream_id);
        let current = self.current_version(partition, stream_id).await?;
        if expected_version != -1 && expected_version as u64 != current {
            return Err(RuntimeError::ConcurrencyConflict { expected: expected_version, actual: current as i64 });
        }

        let mut next = current;
        let mut sealed = Vec::with_capacity(events.len());
        for mut new_event in events {
            next += 1;
            new_event.payload = self.encode_payload(new_event.payload);
            let event = Event::seal(stream_id.to_string(), next, new_event, self.timestamp_ms(), Uuid::new_v4());
            sealed.push(event);
        }

        for event in &sealed {
            let bytes = serde_json::to_vec(event).map_err(|e| RuntimeError::Internal(e.to_string()))?;
            self.storage.put(&event_key(partition, stream_id, event.version), &bytes, true).await?;
        }
        self.storage.put(&meta_key(partition, stream_id), &next.to_le_bytes(), true).await?;

        let event_ids = sealed.iter().map(|e| e.event_id).collect();
        for event in &sealed {
            self.subscriptions.fan_out(event);
            for runner in self.projections.iter() {
                runner.handle(event.version, event).await;
            }
        }

        Ok(AppendResult { new_version: next, event_ids })
    }

    /// Read: events `(fromVersion, fromVersion + maxCount]`, decoded.
    /// Readers never take the stream's append lock.
    pub async fn read_stream(&self, stream_id: &str, from_version: u64, max_count: usize) -> RuntimeResult<ReadStreamResult> {
        let partition = self.partition_of(stream_id);
        let current = self.current_version(partition, stream_id).await?;
        let mut events = Vec::new();
        let mut version = from_version;
        while events.len() < max_count && version < current {
            version += 1;
            if let Some(bytes) = self.storage.get(&event_key(partition, stream_id, version)).await? {
                let mut event: Event = serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
                if !event.verify_checksum() {
                    return Err(RuntimeError::Corruption(format!("checksum mismatch at {stream_id}@{version}")));
                }
                event.payload = self.decode_payload(event.payload);
                events.push(event);
            }
        }
        Ok(ReadStreamResult { is_end: version >= current, next_version: version, events })
    }

    /// `readAll`: merge events from the requested streams (or every
    /// stream in every partition if `stream_ids` is empty) by timestamp,
    /// ties broken by `(streamId, version)` ascending.
    pub async fn read_all(&self, stream_ids: &[StreamId], from_ts: u64, to_ts: u64, max: usize) -> RuntimeResult<Vec<Event>> {
        let mut all = Vec::new();
        if stream_ids.is_empty() {
            for partition in 0..self.config.partition_count {
                let rows = self.storage.scan_prefix(format!("events/{partition}/").as_bytes()).await?;
                self.collect_events(rows, from_ts, to_ts, &mut all)?;
            }
        } else {
            for stream_id in stream_ids {
                let partition = self.partition_of(stream_id);
                let rows = self.storage.scan_prefix(&events_prefix(partition, stream_id)).await?;
                self.collect_events(rows, from_ts, to_ts, &mut all)?;
            }
        }
        all.sort_by(|a, b| (a.timestamp_ms, &a.stream_id, a.version).cmp(&(b.timestamp_ms, &b.stream_id, b.version)));
        all.truncate(max);
        Ok(all)
    }

    fn collect_events(&self, rows: Vec<(Vec<u8>, Vec<u8>)>, from_ts: u64, to_ts: u64, out: &mut Vec<Event>) -> RuntimeResult<()> {
        for (key, bytes) in rows {
            if key.ends_with(b"_meta") {
                continue;
            }
            let mut event: Event = serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
            if event.timestamp_ms < from_ts || event.timestamp_ms > to_ts {
                continue;
            }
            event.payload = self.decode_payload(event.payload);
            out.push(event);
        }
        Ok(())
    }

    /// Snapshots: caller-driven by default (`auto_snapshot` opts into
    /// the version-interval scheduler instead).
    pub async fn create_snapshot(&self, stream_id: &str, version: u64, state: Vec<u8>) -> RuntimeResult<()> {
        let snap = Snapshot::seal(stream_id.to_string(), version, state, self.timestamp_ms());
        let bytes = serde_json::to_vec(&snap).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        self.storage.put(&snapshot_key(stream_id, version), &bytes, false).await
    }

    /// Returns the newest snapshot with `version <= max_version`, if any.
    pub async fn get_snapshot(&self, stream_id: &str, max_version: u64) -> RuntimeResult<Option<Snapshot>> {
        let rows = self.storage.scan_prefix(&snapshot_prefix(stream_id)).await?;
        let mut best: Option<Snapshot> = None;
        for (_, bytes) in rows {
            let snap: Snapshot = serde_json::from_slice(&bytes).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
            if snap.version <= max_version && best.as_ref().map(|b| snap.version > b.version).unwrap_or(true) {
                best = Some(snap);
            }
        }
        Ok(best)
    }

    /// Whether `auto_snapshot` should fire for a stream that just advanced
    /// to `new_version`, per `snapshot_interval_versions`.
    pub fn should_auto_snapshot(&self, new_version: u64) -> bool {
        self.config.auto_snapshot && self.config.snapshot_interval_versions > 0 && new_version % self.config.snapshot_interval_versions == 0
    }

    // ---- Subscriptions --------------------------------------------------

    /// Subscriptions. `catch-up` first replays stored events from
    /// `from_version` to the current tail (preserving per-stream order),
    /// then transitions to live; `live` registers immediately; `persistent`
    /// resumes from the last acknowledged checkpoint recorded under
    /// `subs/<id>`.
    ///
    /// The subscription is registered in the fan-out registry *before* the
    /// historical replay runs, so any event appended while the replay is
    /// still reading is buffered through the live path rather than missed
    /// entirely. `Subscription::deliver` dedups by checkpoint, so an event
    /// delivered once via live fan-out is skipped when the replay loop
    /// reaches the same version.
    pub async fn subscribe(&self, target: SubscriptionTarget, mode: SubscriptionMode, from_version: u64) -> RuntimeResult<(Uuid, tokio::sync::mpsc::Receiver<SubscriptionMessage>)> {
        let resume_from = if mode == SubscriptionMode::Persistent {
            match &target {
                SubscriptionTarget::Stream(s) => self.load_persistent_checkpoint(s).await?.unwrap_or(from_version),
                SubscriptionTarget::All => from_version,
            }
        } else {
            from_version
        };

        let (sub, rx) = Subscription::new(target.clone(), mode, resume_from, self.config.subscription_queue_capacity);
        let id = sub.id;
        self.subscriptions.register(sub.clone());

        if mode == SubscriptionMode::CatchUp || mode == SubscriptionMode::Persistent {
            if let SubscriptionTarget::Stream(stream_id) = &target {
                let mut version = resume_from;
                loop {
                    let page = self.read_stream(stream_id, version, 256).await?;
                    if page.events.is_empty() {
                        break;
                    }
                    for event in &page.events {
                        let _ = sub.deliver(event);
                    }
                    version = page.next_version;
                    if page.is_end {
                        break;
                    }
                }
                let _ = sub.notify_caught_up();
            }
        }

        Ok((id, rx))
    }

    pub fn cancel_subscription(&self, id: Uuid) {
        self.subscriptions.cancel(id);
    }

    async fn load_persistent_checkpoint(&self, stream_id: &str) -> RuntimeResult<Option<u64>> {
        Ok(self
            .storage
            .get(format!("subs/{stream_id}").as_bytes())
            .await?
            .map(|b| u64::from_le_bytes(b.as_slice().try_into().unwrap_or_default())))
    }

    /// Durably record a persistent subscription's checkpoint so it resumes
    /// there after restart.
    pub async fn ack_persistent(&self, sub_id: Uuid, stream_id: &str, version: u64) -> RuntimeResult<()> {
        self.storage.put(&sub_checkpoint_key(sub_id), &version.to_le_bytes(), true).await?;
        self.storage.put(format!("subs/{stream_id}").as_bytes(), &version.to_le_bytes(), true).await
    }

    // ---- Projections -----------------------------------------------------

    pub fn register_projection(&self, runner: Arc<ProjectionRunner>) {
        self.projections.insert(runner.id.clone(), runner);
    }

    pub fn projection_checkpoint(&self, id: &str) -> Option<u64> {
        self.projections.get(id).map(|r| r.checkpoint())
    }

    /// Distinct stream ids across every partition whose id starts with
    /// `prefix`. Used by recovery paths (e.g. the Saga Orchestrator
    /// replaying every `saga-*` stream on startup) that need to discover
    /// streams rather than read a known one.
    pub async fn list_streams_with_prefix(&self, prefix: &str) -> RuntimeResult<Vec<StreamId>> {
        let mut ids = std::collections::BTreeSet::new();
        for partition in 0..self.config.partition_count {
            let rows = self.storage.scan_prefix(format!("events/{partition}/{prefix}").as_bytes()).await?;
            for (key, _) in rows {
                let key = String::from_utf8_lossy(&key);
                if let Some(rest) = key.strip_prefix(&format!("events/{partition}/")) {
                    if let Some((stream_id, _)) = rest.rsplit_once('/') {
                        ids.insert(stream_id.to_string());
                    }
                }
            }
        }
        Ok(ids.into_iter().collect())
    }

    // ---- Transactions -----------------------------------------------------

    pub fn start_transaction(&self) -> Transaction {
        Transaction::start()
    }

    /// Transactions: lock every participating stream (in stream-id
    /// order to avoid cross-transaction deadlock), validate every expected
    /// version, then write all-or-nothing.
    pub async fn commit(&self, tx: Transaction) -> RuntimeResult<Vec<AppendResult>> {
        let mut guards = Vec::with_capacity(tx.writes.len());
        for stream_id in tx.writes.keys() {
            guards.push(self.locks.lock_for(stream_id).lock_owned().await);
        }

        for (stream_id, write) in &tx.writes {
            let partition = self.partition_of(stream_id);
            let current = self.current_version(partition, stream_id).await?;
            if write.expected_version != -1 && write.expected_version as u64 != current {
                return Err(RuntimeError::ConcurrencyConflict { expected: write.expected_version, actual: current as i64 });
            }
        }

        let mut results = Vec::with_capacity(tx.writes.len());
        for (stream_id, write) in tx.writes {
            results.push(self.append_locked(&stream_id, write.events, write.expected_version).await?);
        }
        Ok(results)
    }

    /// Rollback releases no locks explicitly because `commit` only takes
    /// them at commit time — an uncommitted `Transaction` simply drops.
    pub fn rollback(&self, _tx: Transaction) {}
}
