//! Command and Query dispatcher scenarios: retry-until-success and
//! non-retriable failures on the command side; cache/single-flight and
//! pagination defaults on the query side.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use ensemble_runtime::config::DispatchConfig;
use ensemble_runtime::context::Context;
use ensemble_runtime::dispatch::command::{CommandDispatcher, CommandHandler, CommandRegistration, Validator};
use ensemble_runtime::dispatch::query::{QueryDispatcher, QueryHandler, QueryRegistration};
use ensemble_runtime::dispatch::retry::{Backoff, RetryPolicy};
use ensemble_runtime::error::{RuntimeError, RuntimeResult};

struct FlakyHandler {
    calls: Arc<AtomicUsize>,
    succeeds_on_attempt: usize,
}

#[async_trait]
impl CommandHandler for FlakyHandler {
    async fn handle(&self, _body: Value) -> RuntimeResult<Value> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt < self.succeeds_on_attempt {
            return Err(RuntimeError::Internal(format!("transient failure on attempt {attempt}")));
        }
        Ok(json!({ "attempt": attempt }))
    }
}

#[tokio::test]
async fn command_retries_until_it_succeeds() {
    let dispatcher = CommandDispatcher::new(DispatchConfig::default(), Context::system());
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(FlakyHandler { calls: calls.clone(), succeeds_on_attempt: 3 });
    let retry = RetryPolicy::new(2, Backoff::Linear, Duration::from_millis(5));
    dispatcher.register("charge", CommandRegistration::new(handler, &DispatchConfig::default()).with_retry(retry));

    let result = dispatcher.dispatch("charge", json!({}), None).await.expect("eventually succeeds");
    assert_eq!(result, json!({ "attempt": 3 }));
    assert_eq!(calls.load(Ordering::SeqCst), 3, "handler must be called once per attempt, no more");
    assert_eq!(dispatcher.metrics().successes(), 1, "one success increment for the whole dispatch, not per attempt");
    assert_eq!(dispatcher.metrics().failures(), 0, "an eventual success must not also record a failure");
}

struct RejectAll;

#[async_trait]
impl Validator for RejectAll {
    async fn validate(&self, _body: &Value) -> bool {
        false
    }
}

struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CommandHandler for CountingHandler {
    async fn handle(&self, _body: Value) -> RuntimeResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RuntimeError::Internal("always fails".into()))
    }
}

#[tokio::test]
async fn validation_errors_are_never_retried() {
    let dispatcher = CommandDispatcher::new(DispatchConfig::default(), Context::system());
    let calls = Arc::new(AtomicUsize::new(0));
    let retry = RetryPolicy::new(5, Backoff::Fixed, Duration::from_millis(5));
    let registration = CommandRegistration::new(Arc::new(CountingHandler { calls: calls.clone() }), &DispatchConfig::default())
        .with_validator(Arc::new(RejectAll))
        .with_retry(retry);
    dispatcher.register("refund", registration);

    let err = dispatcher.dispatch("refund", json!({}), None).await.expect_err("validation must fail the dispatch");
    assert!(matches!(err, RuntimeError::ValidationError(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0, "the handler is never reached once validation rejects");
    assert_eq!(dispatcher.metrics().successes(), 0);
    assert_eq!(dispatcher.metrics().failures(), 1, "a non-retried validation failure still records one failure");
}

#[tokio::test]
async fn unregistered_command_type_is_handler_not_found() {
    let dispatcher = CommandDispatcher::new(DispatchConfig::default(), Context::system());
    let err = dispatcher.dispatch("nonexistent", json!({}), None).await.expect_err("no such registration");
    assert!(matches!(err, RuntimeError::HandlerNotFound(_)));
}

struct CountingQueryHandler {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl QueryHandler for CountingQueryHandler {
    async fn handle(&self, _body: Value, _replica: Option<&str>) -> RuntimeResult<Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!([1, 2, 3]))
    }
}

#[tokio::test]
async fn cacheable_query_is_served_from_cache_on_second_call() {
    let dispatcher = QueryDispatcher::new(DispatchConfig::default(), Context::system());
    let calls = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(CountingQueryHandler { calls: calls.clone() });
    dispatcher.register("list_orders", QueryRegistration::new(handler, &DispatchConfig::default()).cacheable());

    let first = dispatcher.dispatch("list_orders", json!({})).await.expect("first call");
    let second = dispatcher.dispatch("list_orders", json!({})).await.expect("second call hits cache");
    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "the handler runs once; the second dispatch is served from cache");
}

#[tokio::test]
async fn pagination_defaults_are_applied_and_wrapped() {
    let dispatcher = QueryDispatcher::new(DispatchConfig::default(), Context::system());
    let handler = Arc::new(CountingQueryHandler { calls: Arc::new(AtomicUsize::new(0)) });
    dispatcher.register("list_widgets", QueryRegistration::new(handler, &DispatchConfig::default()));

    let result = dispatcher.dispatch("list_widgets", json!({})).await.expect("dispatch succeeds");
    assert_eq!(result["page"], json!(1));
    assert_eq!(result["pageSize"], json!(DispatchConfig::default().default_page_size as u64));
    assert_eq!(result["totalCount"], json!(3));
    assert_eq!(result["data"], json!([1, 2, 3]));
}
