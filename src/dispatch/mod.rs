//! Command & Query Dispatchers: typed request pipelines with
//! middleware chains over a handler registry keyed by request `type`.

pub mod cache;
pub mod command;
pub mod middleware;
pub mod query;
pub mod retry;

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

/// One in-flight request, kept for observability.
#[derive(Debug, Clone)]
pub struct InFlightEntry {
    pub request_type: String,
    pub started_at: std::time::Instant,
    pub attempts: u32,
}

/// A live map of in-flight requests, shared by both dispatchers.
#[derive(Default)]
pub struct InFlightTracker {
    entries: Mutex<std::collections::HashMap<Uuid, InFlightEntry>>,
}

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, id: Uuid, request_type: String, started_at: std::time::Instant) {
        self.entries.lock().insert(id, InFlightEntry { request_type, started_at, attempts: 0 });
    }

    pub fn record_attempt(&self, id: Uuid, attempts: u32) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.attempts = attempts;
        }
    }

    pub fn finish(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A record of one slow query, appended to a bounded ring and surfaced
/// via an event.
#[derive(Debug, Clone)]
pub struct SlowQueryRecord {
    pub query_type: String,
    pub duration: Duration,
    pub timestamp_ms: u64,
}

/// A bounded FIFO ring of the most recent slow queries.
pub struct SlowQueryRing {
    capacity: usize,
    entries: Mutex<VecDeque<SlowQueryRecord>>,
}

impl SlowQueryRing {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: Mutex::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn push(&self, record: SlowQueryRecord) {
        let mut entries = self.entries.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<SlowQueryRecord> {
        self.entries.lock().iter().cloned().collect()
    }
}
