//! Query pipeline: cache → paginate → optimize → handler, with
//! weighted-random read-replica routing and slow-query tracking.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::DispatchConfig;
use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult};

use super::cache::{cache_key, CacheLookup, QueryCache};
use super::middleware::{Envelope, Middleware, Next, Pipeline};
use super::{InFlightTracker, SlowQueryRecord, SlowQueryRing};

#[async_trait]
pub trait QueryHandler: Send + Sync + 'static {
    async fn handle(&self, body: Value, replica: Option<&str>) -> RuntimeResult<Value>;
}

#[derive(Debug, Clone)]
pub struct ReadReplica {
    pub id: String,
    pub weight: f64,
    pub healthy: bool,
}

/// Picks a replica by weight among the healthy ones. Returns `None` (route to primary)
/// when no replica is configured or none is healthy.
fn select_replica(ctx: &Context, replicas: &[ReadReplica]) -> Option<String> {
    let healthy: Vec<&ReadReplica> = replicas.iter().filter(|r| r.healthy).collect();
    let total_weight: f64 = healthy.iter().map(|r| r.weight).sum();
    if healthy.is_empty() || total_weight <= 0.0 {
        return None;
    }
    let mut roll = ctx.entropy.gen_f64() * total_weight;
    for replica in &healthy {
        if roll < replica.weight {
            return Some(replica.id.clone());
        }
        roll -= replica.weight;
    }
    healthy.last().map(|r| r.id.clone())
}

pub struct QueryRegistration {
    pub handler: Arc<dyn QueryHandler>,
    pub cacheable: bool,
    pub ttl: Duration,
    pub replicas: Vec<ReadReplica>,
}

impl QueryRegistration {
    /// An uncached registration with no read replicas; `cacheable`/`ttl`
    /// and `replicas` are set separately where a query needs them.
    pub fn new(handler: Arc<dyn QueryHandler>, config: &DispatchConfig) -> Self {
        Self { handler, cacheable: false, ttl: config.cache_ttl, replicas: Vec::new() }
    }

    pub fn cacheable(mut self) -> Self {
        self.cacheable = true;
        self
    }

    pub fn with_replicas(mut self, replicas: Vec<ReadReplica>) -> Self {
        self.replicas = replicas;
        self
    }
}

/// "Optimizer reorders filters by estimated selectivity": `=` < `in`
/// < range < `like` < other. Expects `body.filters` to be an array of
/// `{field, op, ...}` objects; anything else passes through unchanged.
fn selectivity_rank(op: &str) -> u8 {
    match op {
        "eq" | "=" => 0,
        "in" => 1,
        "range" | "between" | "gt" | "gte" | "lt" | "lte" => 2,
        "like" => 3,
        _ => 4,
    }
}

fn optimize_filters(body: &mut Value) {
    let Some(filters) = body.get_mut("filters").and_then(|f| f.as_array_mut()) else { return };
    filters.sort_by_key(|f| f.get("op").and_then(|o| o.as_str()).map(selectivity_rank).unwrap_or(4));
}

struct CacheMiddleware {
    cache: Arc<QueryCache>,
    cacheable: bool,
    ttl: Duration,
}

#[async_trait]
impl Middleware for CacheMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        if !self.cacheable {
            return next.call(req).await;
        }
        let key = cache_key(&req.request_type, &req.body);
        match self.cache.get_or_claim(&key).await {
            CacheLookup::Hit(value) => Ok(value),
            CacheLookup::Claim => match next.call(req).await {
                Ok(value) => {
                    self.cache.complete(&key, value.clone(), self.ttl);
                    Ok(value)
                }
                Err(e) => {
                    self.cache.fail(&key);
                    Err(e)
                }
            },
        }
    }
}

struct PaginateMiddleware {
    default_page_size: usize,
    max_page_size: usize,
}

#[async_trait]
impl Middleware for PaginateMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        let page = req.body.get("page").and_then(|p| p.as_u64()).unwrap_or(1).max(1);
        let page_size = req
            .body
            .get("pageSize")
            .and_then(|p| p.as_u64())
            .unwrap_or(self.default_page_size as u64)
            .clamp(1, self.max_page_size as u64);
        if let Some(obj) = req.body.as_object_mut() {
            obj.insert("page".to_string(), Value::from(page));
            obj.insert("pageSize".to_string(), Value::from(page_size));
        }

        let result = next.call(req).await?;
        let total_count = match &result {
            Value::Array(items) => items.len() as u64,
            Value::Object(obj) => obj.get("totalCount").and_then(|v| v.as_u64()).unwrap_or(0),
            _ => 0,
        };
        Ok(serde_json::json!({ "data": result, "totalCount": total_count, "page": page, "pageSize": page_size }))
    }
}

struct OptimizeMiddleware;

#[async_trait]
impl Middleware for OptimizeMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, next: Next<'a>) -> RuntimeResult<Value> {
        optimize_filters(&mut req.body);
        next.call(req).await
    }
}

struct HandlerMiddleware {
    handler: Arc<dyn QueryHandler>,
    timeout: Duration,
    replica: Option<String>,
}

#[async_trait]
impl Middleware for HandlerMiddleware {
    async fn call<'a>(&'a self, req: &'a mut Envelope, _next: Next<'a>) -> RuntimeResult<Value> {
        match tokio::time::timeout(self.timeout, self.handler.handle(req.body.clone(), self.replica.as_deref())).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout),
        }
    }
}

pub struct QueryDispatcher {
    config: DispatchConfig,
    ctx: Context,
    registrations: dashmap::DashMap<String, Arc<QueryRegistration>>,
    cache: Arc<QueryCache>,
    tracker: Arc<InFlightTracker>,
    slow_queries: SlowQueryRing,
    in_flight_count: AtomicUsize,
}

impl QueryDispatcher {
    pub fn new(config: DispatchConfig, ctx: Context) -> Self {
        let slow_capacity = config.slow_query_ring_capacity;
        let cache_capacity = config.max_page_size.max(256);
        Self {
            cache: Arc::new(QueryCache::new(ctx.clone(), cache_capacity)),
            slow_queries: SlowQueryRing::new(slow_capacity),
            config,
            ctx,
            registrations: dashmap::DashMap::new(),
            tracker: Arc::new(InFlightTracker::new()),
            in_flight_count: AtomicUsize::new(0),
        }
    }

    pub fn register(&self, query_type: impl Into<String>, registration: QueryRegistration) {
        self.registrations.insert(query_type.into(), Arc::new(registration));
    }

    fn timestamp_ms(&self) -> u64 {
        self.ctx.clock.wall_now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    #[tracing::instrument(level = "debug", skip(self, body), fields(query_type = %query_type))]
    pub async fn dispatch(&self, query_type: &str, body: Value) -> RuntimeResult<Value> {
        let registration = self.registrations.get(query_type).ok_or_else(|| RuntimeError::HandlerNotFound(query_type.to_string()))?.clone();

        self.in_flight_count.fetch_add(1, Ordering::AcqRel);
        let started_at = self.ctx.clock.monotonic_now();
        let mut req = Envelope::new(query_type, body, self.timestamp_ms());
        self.tracker.begin(req.id, query_type.to_string(), started_at.into_std());

        let replica = select_replica(&self.ctx, &registration.replicas);
        let pipeline = Pipeline::new(vec![
            Arc::new(CacheMiddleware { cache: self.cache.clone(), cacheable: registration.cacheable, ttl: registration.ttl }),
            Arc::new(PaginateMiddleware { default_page_size: self.config.default_page_size, max_page_size: self.config.max_page_size }),
            Arc::new(OptimizeMiddleware),
            Arc::new(HandlerMiddleware { handler: registration.handler.clone(), timeout: self.config.query_timeout, replica }),
        ]);

        let result = pipeline.run(&mut req).await;
        self.tracker.finish(req.id);
        self.in_flight_count.fetch_sub(1, Ordering::AcqRel);

        let elapsed = self.ctx.clock.monotonic_now().into_std().saturating_duration_since(started_at.into_std());
        if elapsed > self.config.slow_query_threshold {
            self.slow_queries.push(SlowQueryRecord { query_type: query_type.to_string(), duration: elapsed, timestamp_ms: self.timestamp_ms() });
            tracing::warn!(query_type, elapsed_ms = elapsed.as_millis() as u64, "slow query");
        }

        result
    }

    pub fn slow_queries(&self) -> Vec<SlowQueryRecord> {
        self.slow_queries.snapshot()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }
}
