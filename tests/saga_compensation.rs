//! Saga scenario: a step fails after exhausting retries, the orchestrator
//! walks the compensation stack LIFO, and the instance ends `failed` with a
//! `SagaFailed` event on its stream.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use ensemble_runtime::config::{EventStoreConfig, SagaConfig};
use ensemble_runtime::context::Context;
use ensemble_runtime::error::{RuntimeError, RuntimeResult};
use ensemble_runtime::eventstore::EventStore;
use ensemble_runtime::saga::definition::{Compensation, SagaType, Step, StepAction, StepKind};
use ensemble_runtime::saga::instance::SagaState;
use ensemble_runtime::saga::{CommandExecutor, SagaOrchestrator};
use ensemble_runtime::testsupport::InMemoryStorage;

struct Reserve;

#[async_trait]
impl StepAction for Reserve {
    async fn run(&self, _data: &Value) -> RuntimeResult<Value> {
        Ok(json!({"reserved": true}))
    }
}

struct Unreserve(Arc<AtomicUsize>);

#[async_trait]
impl Compensation for Unreserve {
    async fn compensate(&self, _data: &Value, _step_result: &Value) -> RuntimeResult<()> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `CommandExecutor` whose `charge` command always fails, so the saga
/// exhausts its retries and enters compensation.
struct AlwaysFailingExecutor;

#[async_trait]
impl CommandExecutor for AlwaysFailingExecutor {
    async fn execute(&self, command_type: &str, _body: Value) -> RuntimeResult<Value> {
        Err(RuntimeError::Internal(format!("{command_type} always fails in this test")))
    }
}

fn order_saga_type(unreserve_calls: Arc<AtomicUsize>) -> SagaType {
    SagaType {
        name: "order".to_string(),
        trigger_event_types: Vec::new(),
        trigger_condition: None,
        steps: vec![
            Step {
                name: "reserve".to_string(),
                kind: StepKind::Action(Box::new(Reserve)),
                compensation: Some(Box::new(Unreserve(unreserve_calls))),
                wait_for_event: None,
            },
            Step {
                name: "charge".to_string(),
                kind: StepKind::Command { command_type: "charge".to_string() },
                compensation: None,
                wait_for_event: None,
            },
            Step { name: "ship".to_string(), kind: StepKind::Action(Box::new(Reserve)), compensation: None, wait_for_event: None },
        ],
        timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn failing_step_triggers_lifo_compensation_and_persists_failure() {
    let event_store = Arc::new(EventStore::new(Arc::new(InMemoryStorage::new()), Context::system(), EventStoreConfig::default()));
    let executor: Arc<dyn CommandExecutor> = Arc::new(AlwaysFailingExecutor);
    let config = SagaConfig { max_retries: 1, retry_base_delay: Duration::from_millis(5), compensation_timeout: Duration::from_secs(5), instance_timeout: Duration::from_secs(30) };
    let orchestrator = Arc::new(SagaOrchestrator::new(config, Context::system(), event_store.clone(), executor));

    let unreserve_calls = Arc::new(AtomicUsize::new(0));
    orchestrator.register_type(order_saga_type(unreserve_calls.clone()));

    let id = orchestrator.start("order", json!({"order_id": "o-1"})).await.expect("start saga");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let instance = loop {
        if let Some(instance) = orchestrator.instance_snapshot(id).await {
            if instance.state == SagaState::Failed {
                break instance;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "saga did not reach failed state in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    assert_eq!(instance.state, SagaState::Failed);
    assert_eq!(instance.completed, vec!["reserve".to_string()]);
    assert_eq!(instance.failed, vec!["charge".to_string()]);
    assert_eq!(unreserve_calls.load(Ordering::SeqCst), 1, "reserve's compensation must run exactly once");
    assert_eq!(instance.compensated.len(), 1);
    assert_eq!(instance.compensated[0].step_name, "reserve");
    assert!(instance.compensated[0].succeeded);
    assert!(instance.compensation_stack.is_empty(), "the compensation stack must be fully drained");

    let stream = event_store.read_stream(&instance.stream_id(), 0, usize::MAX).await.expect("read saga stream");
    assert!(stream.events.iter().any(|e| e.event_type == "SagaFailed"), "a SagaFailed event must be persisted");
}
