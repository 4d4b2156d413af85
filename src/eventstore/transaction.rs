//! Multi-stream transactions: `start → add* → commit`, all appends
//! succeeding together or none at all. Implemented by pre-locking every
//! participating stream, validating all expected versions, then writing.

use std::collections::BTreeMap;

use super::model::{NewEvent, StreamId};

pub struct PendingStreamWrite {
    pub expected_version: i64,
    pub events: Vec<NewEvent>,
}

/// An in-flight transaction. Holds no locks until `commit` is called —
/// locks are acquired, in stream-id order to avoid deadlocks between
/// concurrent transactions sharing streams, only at commit time.
pub struct Transaction {
    pub(super) writes: BTreeMap<StreamId, PendingStreamWrite>,
}

impl Transaction {
    pub fn start() -> Self {
        Self { writes: BTreeMap::new() }
    }

    /// Stage events for `stream_id`. Calling this twice for the same stream
    /// within one transaction appends to the same pending write, keeping
    /// the transaction's single expected-version check for that stream.
    pub fn add(&mut self, stream_id: impl Into<StreamId>, events: Vec<NewEvent>, expected_version: i64) {
        let entry = self.writes.entry(stream_id.into()).or_insert_with(|| PendingStreamWrite { expected_version, events: Vec::new() });
        entry.events.extend(events);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}
