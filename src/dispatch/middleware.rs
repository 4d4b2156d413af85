//! The middleware engine shared by both dispatchers.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{RuntimeError, RuntimeResult};

/// A command or query in flight through a pipeline, carrying the envelope
/// fields attached to every request: `{id, correlationId, causationId?,
/// userId?, timestamp, attempts}`.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub id: Uuid,
    pub request_type: String,
    pub body: Value,
    pub correlation_id: Uuid,
    pub causation_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub timestamp_ms: u64,
    pub attempts: u32,
}

impl Envelope {
    pub fn new(request_type: impl Into<String>, body: Value, timestamp_ms: u64) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            request_type: request_type.into(),
            body,
            correlation_id: id,
            causation_id: None,
            user_id: None,
            timestamp_ms,
            attempts: 0,
        }
    }
}

/// A bound reference to "the rest of the pipeline" handed to a middleware
/// stage, in place of a wrapping closure. `Copy` so a stage that needs to
/// invoke the remainder more than once (the retry stage) can.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    pipeline: &'a Pipeline,
    index: usize,
}

impl<'a> Next<'a> {
    pub fn call(self, req: &'a mut Envelope) -> BoxFuture<'a, RuntimeResult<Value>> {
        self.pipeline.run_from(self.index, req)
    }
}

#[async_trait::async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value>;
}

/// An ordered, indexed chain of middleware stages. The terminal stage
/// (the actual handler) is itself a `Middleware` that never calls `next`.
pub struct Pipeline {
    stages: Vec<Arc<dyn Middleware>>,
}

impl Pipeline {
    pub fn new(stages: Vec<Arc<dyn Middleware>>) -> Self {
        Self { stages }
    }

    pub async fn run(&self, req: &mut Envelope) -> RuntimeResult<Value> {
        self.run_from(0, req).await
    }

    fn run_from<'a>(&'a self, index: usize, req: &'a mut Envelope) -> BoxFuture<'a, RuntimeResult<Value>> {
        Box::pin(async move {
            let Some(stage) = self.stages.get(index) else {
                return Err(RuntimeError::Internal("pipeline exhausted without a terminal handler".into()));
            };
            let next = Next { pipeline: self, index: index + 1 };
            stage.call(req, next).await
        })
    }
}

/// Redacts fields whose key matches `password|token|secret|key` (case
/// insensitive) anywhere in a JSON value, for audit log entries.
pub fn redact(value: &Value) -> Value {
    const SENSITIVE: [&str; 4] = ["password", "token", "secret", "key"];
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                let lower = k.to_lowercase();
                if SENSITIVE.iter().any(|s| lower.contains(s)) {
                    out.insert(k.clone(), Value::String("***REDACTED***".to_string()));
                } else {
                    out.insert(k.clone(), redact(v));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}
