//! Metrics broadcast from the Raft core, and a `Wait` helper for blocking on
//! a metrics predicate. Modeled directly on `async-raft::metrics`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::timeout;

use crate::error::{RuntimeError, RuntimeResult};
use crate::raft::types::State;
use crate::NodeId;

/// A snapshot of a Raft node's state, broadcast over a `watch` channel after
/// every state mutation so callers (tests, the Cluster Manager) can observe
/// progress without polling the core task directly.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership: Vec<NodeId>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership: vec![id],
        }
    }
}

/// Blocks until a `watch::Receiver<RaftMetrics>` satisfies a predicate or a
/// deadline elapses. Used by tests and by components (e.g. the Cluster
/// Manager) that need to synchronize on "has this become leader yet".
pub struct Wait {
    pub rx: watch::Receiver<RaftMetrics>,
    pub timeout: Duration,
}

impl Wait {
    pub fn new(rx: watch::Receiver<RaftMetrics>, deadline: Duration) -> Self {
        Self { rx, timeout: deadline }
    }

    /// Wait for the metrics to satisfy `f`, returning the satisfying snapshot.
    pub async fn metrics<T>(&mut self, msg: &str, mut f: T) -> RuntimeResult<RaftMetrics>
    where
        T: FnMut(&RaftMetrics) -> bool,
    {
        let mut rx = self.rx.clone();
        let fut = async {
            loop {
                let m = rx.borrow().clone();
                if f(&m) {
                    return m;
                }
                if rx.changed().await.is_err() {
                    return m;
                }
            }
        };
        timeout(self.timeout, fut)
            .await
            .map_err(|_| RuntimeError::Internal(format!("timed out waiting for: {msg}")))
    }
}

/// Dispatch outcome counters: one increment per top-level command
/// dispatch, regardless of how many retry attempts it took to get there.
#[derive(Default)]
pub struct CommandMetrics {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl CommandMetrics {
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
