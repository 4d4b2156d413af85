//! Subscriptions: live, catch-up, and persistent fan-out of
//! appended events, each with a bounded queue whose overflow drops the
//! slow subscriber rather than the store.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use uuid::Uuid;

use super::model::{Event, StreamId};

pub type SubscriptionId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    Stream(StreamId),
    All,
}

impl SubscriptionTarget {
    fn matches(&self, stream_id: &str) -> bool {
        match self {
            SubscriptionTarget::Stream(s) => s == stream_id,
            SubscriptionTarget::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    Live,
    CatchUp,
    Persistent,
}

#[derive(Debug, Clone)]
pub enum SubscriptionMessage {
    Event(Event),
    CaughtUp,
    /// The subscriber's queue overflowed; the subscription is cancelled and
    /// this is the last message it will ever receive.
    Overflow,
}

/// One live registration in the fan-out registry. `catch-up` subscriptions
/// are registered only once their historical replay has reached the tail,
/// so by the time they appear here they behave exactly like `live`.
pub struct Subscription {
    pub id: SubscriptionId,
    pub target: SubscriptionTarget,
    pub mode: SubscriptionMode,
    tx: mpsc::Sender<SubscriptionMessage>,
    checkpoint: AtomicU64,
    cancelled: AtomicBool,
}

impl Subscription {
    pub fn new(target: SubscriptionTarget, mode: SubscriptionMode, from_version: u64, capacity: usize) -> (std::sync::Arc<Self>, mpsc::Receiver<SubscriptionMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sub = std::sync::Arc::new(Self {
            id: Uuid::new_v4(),
            target,
            mode,
            tx,
            checkpoint: AtomicU64::new(from_version),
            cancelled: AtomicBool::new(false),
        });
        (sub, rx)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(Ordering::Acquire)
    }

    pub fn ack(&self, version: u64) {
        self.checkpoint.store(version, Ordering::Release);
    }

    /// Signal a catch-up subscription that historical replay reached the
    /// tail and it has transitioned to live.
    pub(crate) fn notify_caught_up(&self) -> bool {
        self.tx.try_send(SubscriptionMessage::CaughtUp).is_ok()
    }

    /// Deliver one event if it matches this subscription's target and has
    /// not already been delivered. Returns `true` if delivery (or a
    /// deliberate skip) succeeded, `false` if the subscriber's queue
    /// overflowed and the subscription was cancelled.
    ///
    /// The checkpoint doubles as a delivery watermark: a historical replay
    /// registered ahead of itself (so concurrent live appends aren't
    /// dropped) and the live fan-out path can both call `deliver` for the
    /// same event. Claiming the version with a compare-and-swap before
    /// sending makes exactly one of the two callers win.
    pub(crate) fn deliver(&self, event: &Event) -> bool {
        if self.is_cancelled() || !self.target.matches(&event.stream_id) {
            return true;
        }
        loop {
            let last = self.checkpoint.load(Ordering::Acquire);
            if event.version <= last {
                return true;
            }
            if self
                .checkpoint
                .compare_exchange(last, event.version, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }
        match self.tx.try_send(SubscriptionMessage::Event(event.clone())) {
            Ok(()) => true,
            Err(_) => {
                self.cancelled.store(true, Ordering::Release);
                let _ = self.tx.try_send(SubscriptionMessage::Overflow);
                false
            }
        }
    }
}

/// Registry of live subscriptions, fanned out to on every append.
#[derive(Default)]
pub struct SubscriptionRegistry {
    subs: dashmap::DashMap<SubscriptionId, std::sync::Arc<Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, sub: std::sync::Arc<Subscription>) {
        self.subs.insert(sub.id, sub);
    }

    pub fn cancel(&self, id: SubscriptionId) {
        self.subs.remove(&id);
    }

    /// Fan out one appended event to every matching live subscription,
    /// pruning any that overflowed during delivery.
    pub fn fan_out(&self, event: &Event) {
        let mut dead = Vec::new();
        for entry in self.subs.iter() {
            if !entry.value().deliver(event) {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subs.remove(&id);
        }
    }
}
