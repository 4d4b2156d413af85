//! Command pipeline: audit → validate → authorize → retry → handler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::DispatchConfig;
use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult};
use crate::metrics::CommandMetrics;
use crate::saga::CommandExecutor;

use super::middleware::{redact, Envelope, Middleware, Next, Pipeline};
use super::retry::RetryPolicy;
use super::InFlightTracker;

#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, body: Value) -> RuntimeResult<Value>;
}

#[async_trait]
pub trait Validator: Send + Sync + 'static {
    async fn validate(&self, body: &Value) -> bool;
}

#[async_trait]
pub trait Authorizer: Send + Sync + 'static {
    async fn authorize(&self, body: &Value, user_id: Option<&str>) -> bool;
}

pub struct CommandRegistration {
    pub handler: Arc<dyn CommandHandler>,
    pub validator: Option<Arc<dyn Validator>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
    pub retry: RetryPolicy,
    pub timeout: std::time::Duration,
}

impl CommandRegistration {
    /// A registration with the dispatcher's default retry policy (fixed
    /// backoff, `config.max_retries`/`retry_delay`) and handler timeout
    /// (`config.command_timeout`), no validator or authorizer.
    pub fn new(handler: Arc<dyn CommandHandler>, config: &DispatchConfig) -> Self {
        Self {
            handler,
            validator: None,
            authorizer: None,
            retry: RetryPolicy::new(config.max_retries, super::retry::Backoff::Fixed, config.retry_delay),
            timeout: config.command_timeout,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

struct AuditMiddleware;

#[async_trait]
impl Middleware for AuditMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        tracing::info!(id = %req.id, r#type = %req.request_type, body = %redact(&req.body), "command started");
        match next.call(req).await {
            Ok(v) => {
                tracing::info!(id = %req.id, r#type = %req.request_type, "command completed");
                Ok(v)
            }
            Err(e) => {
                tracing::warn!(id = %req.id, r#type = %req.request_type, kind = e.kind(), "command failed");
                Err(e)
            }
        }
    }
}

struct ValidateMiddleware(Option<Arc<dyn Validator>>);

#[async_trait]
impl Middleware for ValidateMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        if let Some(validator) = &self.0 {
            if !validator.validate(&req.body).await {
                return Err(RuntimeError::ValidationError(format!("validation failed for {}", req.request_type)));
            }
        }
        next.call(req).await
    }
}

struct AuthorizeMiddleware(Option<Arc<dyn Authorizer>>);

#[async_trait]
impl Middleware for AuthorizeMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        if let Some(authorizer) = &self.0 {
            if !authorizer.authorize(&req.body, req.user_id.as_deref()).await {
                return Err(RuntimeError::AuthorizationError(format!("authorization denied for {}", req.request_type)));
            }
        }
        next.call(req).await
    }
}

struct RetryMiddleware {
    policy: RetryPolicy,
    tracker: Arc<InFlightTracker>,
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        let mut attempt = 0u32;
        loop {
            req.attempts = attempt + 1;
            self.tracker.record_attempt(req.id, req.attempts);
            match next.call(req).await {
                Ok(v) => return Ok(v),
                Err(e) if attempt < self.policy.max_retries && retriable_for_retry(&e) => {
                    attempt += 1;
                    tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// "ValidationError, AuthorizationError, and HandlerNotFound are never
/// retried" — narrower than the generic `RuntimeError::retriable()`.
fn retriable_for_retry(err: &RuntimeError) -> bool {
    !matches!(
        err,
        RuntimeError::ValidationError(_) | RuntimeError::AuthorizationError(_) | RuntimeError::HandlerNotFound(_)
    )
}

struct HandlerMiddleware {
    handler: Arc<dyn CommandHandler>,
    timeout: std::time::Duration,
}

#[async_trait]
impl Middleware for HandlerMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, _next: Next<'a>) -> RuntimeResult<Value> {
        match tokio::time::timeout(self.timeout, self.handler.handle(req.body.clone())).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout),
        }
    }
}

pub struct CommandDispatcher {
    config: DispatchConfig,
    ctx: Context,
    registrations: dashmap::DashMap<String, Arc<CommandRegistration>>,
    tracker: Arc<InFlightTracker>,
    in_flight_count: AtomicUsize,
    metrics: CommandMetrics,
}

impl CommandDispatcher {
    pub fn new(config: DispatchConfig, ctx: Context) -> Self {
        Self {
            config,
            ctx,
            registrations: dashmap::DashMap::new(),
            tracker: Arc::new(InFlightTracker::new()),
            in_flight_count: AtomicUsize::new(0),
            metrics: CommandMetrics::default(),
        }
    }

    pub fn register(&self, command_type: impl Into<String>, registration: CommandRegistration) {
        self.registrations.insert(command_type.into(), Arc::new(registration));
    }

    fn timestamp_ms(&self) -> u64 {
        self.ctx.clock.wall_now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// Command pipeline entry point, plus the backpressure guard that
    /// rejects new work once the executing-count exceeds a configurable
    /// concurrency bound.
    #[tracing::instrument(level = "debug", skip(self, body), fields(command_type = %command_type))]
    pub async fn dispatch(&self, command_type: &str, body: Value, user_id: Option<String>) -> RuntimeResult<Value> {
        if self.in_flight_count.load(Ordering::Acquire) >= self.config.max_concurrent_commands {
            return Err(RuntimeError::Backpressure);
        }
        let registration = self.registrations.get(command_type).ok_or_else(|| RuntimeError::HandlerNotFound(command_type.to_string()))?.clone();

        self.in_flight_count.fetch_add(1, Ordering::AcqRel);
        let started_at = self.ctx.clock.monotonic_now();
        let mut req = Envelope::new(command_type, body, self.timestamp_ms());
        req.user_id = user_id;
        self.tracker.begin(req.id, command_type.to_string(), started_at.into_std());

        let pipeline = Pipeline::new(vec![
            Arc::new(AuditMiddleware),
            Arc::new(ValidateMiddleware(registration.validator.clone())),
            Arc::new(AuthorizeMiddleware(registration.authorizer.clone())),
            Arc::new(RetryMiddleware { policy: registration.retry.clone(), tracker: self.tracker.clone() }),
            Arc::new(HandlerMiddleware { handler: registration.handler.clone(), timeout: registration.timeout }),
        ]);

        let result = pipeline.run(&mut req).await;
        self.tracker.finish(req.id);
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);
        match &result {
            Ok(_) => self.metrics.record_success(),
            Err(_) => self.metrics.record_failure(),
        }
        result
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    pub fn metrics(&self) -> &CommandMetrics {
        &self.metrics
    }
}

#[async_trait]
impl CommandExecutor for CommandDispatcher {
    async fn execute(&self, command_type: &str, body: Value) -> RuntimeResult<Value> {
        self.dispatch(command_type, body, None).await
    }
}
