//! Core Event Store data types: streams, events, and snapshots.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type StreamId = String;

/// A uniquely-identified event appended to a stream. `checksum` covers the
/// serialized form of every other field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub stream_id: StreamId,
    pub version: u64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: std::collections::BTreeMap<String, String>,
    pub timestamp_ms: u64,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub checksum: [u8; 32],
}

/// The fields of an event supplied by a caller of `append`, before version
/// assignment and checksum computation.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub metadata: std::collections::BTreeMap<String, String>,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
}

impl Event {
    /// Builds a fully-formed, checksummed event for a given stream/version.
    pub fn seal(stream_id: StreamId, version: u64, new: NewEvent, timestamp_ms: u64, event_id: Uuid) -> Self {
        let mut event = Self {
            event_id,
            stream_id,
            version,
            event_type: new.event_type,
            payload: new.payload,
            metadata: new.metadata,
            timestamp_ms,
            correlation_id: new.correlation_id,
            causation_id: new.causation_id,
            checksum: [0u8; 32],
        };
        event.checksum = event.compute_checksum();
        event
    }

    fn compute_checksum(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.event_id.as_bytes());
        hasher.update(self.stream_id.as_bytes());
        hasher.update(self.version.to_le_bytes());
        hasher.update(self.event_type.as_bytes());
        hasher.update(&self.payload);
        for (k, v) in &self.metadata {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.update(self.timestamp_ms.to_le_bytes());
        if let Some(c) = self.correlation_id {
            hasher.update(c.as_bytes());
        }
        if let Some(c) = self.causation_id {
            hasher.update(c.as_bytes());
        }
        hasher.finalize().into()
    }

    /// Verifies `checksum` against the event's current fields; a mismatch
    /// is reported as `RuntimeError::Corruption` by callers.
    pub fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub stream_id: StreamId,
    pub version: u64,
    pub state: Vec<u8>,
    pub timestamp_ms: u64,
    pub checksum: [u8; 32],
}

impl Snapshot {
    pub fn seal(stream_id: StreamId, version: u64, state: Vec<u8>, timestamp_ms: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(stream_id.as_bytes());
        hasher.update(version.to_le_bytes());
        hasher.update(&state);
        hasher.update(timestamp_ms.to_le_bytes());
        let checksum = hasher.finalize().into();
        Self { stream_id, version, state, timestamp_ms, checksum }
    }
}
