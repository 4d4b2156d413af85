//! Projections: materialized views folded from events in stream
//! order, checkpointed so a handler failure never silently skips ahead.

use async_trait::async_trait;

use super::model::Event;

/// A projection's event-folding logic. Implementors own their private
/// state; the runner only tracks which event types and checkpoint it cares
/// about.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    fn handled_event_types(&self) -> &[&str];

    /// Fold one event into this projection's state. An error leaves the
    /// checkpoint unadvanced so the same event is retried after a restart.
    async fn apply(&self, event: &Event) -> crate::error::RuntimeResult<()>;
}

pub struct ProjectionRunner {
    pub id: String,
    projection: std::sync::Arc<dyn Projection>,
    checkpoint: std::sync::atomic::AtomicU64,
    running: std::sync::atomic::AtomicBool,
}

impl ProjectionRunner {
    pub fn new(id: impl Into<String>, projection: std::sync::Arc<dyn Projection>, from_checkpoint: u64) -> Self {
        Self {
            id: id.into(),
            projection,
            checkpoint: std::sync::atomic::AtomicU64::new(from_checkpoint),
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn checkpoint(&self) -> u64 {
        self.checkpoint.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.running.store(false, std::sync::atomic::Ordering::Release);
    }

    /// Deliver one event at `global_position`, applying it only if its type
    /// is handled, and advancing the checkpoint only on success.
    #[tracing::instrument(level = "trace", skip(self, event), fields(projection = %self.id))]
    pub async fn handle(&self, global_position: u64, event: &Event) {
        if !self.is_running() {
            return;
        }
        if !self.projection.handled_event_types().contains(&event.event_type.as_str()) {
            self.checkpoint.store(global_position, std::sync::atomic::Ordering::Release);
            return;
        }
        match self.projection.apply(event).await {
            Ok(()) => {
                self.checkpoint.store(global_position, std::sync::atomic::Ordering::Release);
            }
            Err(err) => {
                tracing::error!(?err, projection = %self.id, "projection handler failed, checkpoint not advanced");
            }
        }
    }
}
