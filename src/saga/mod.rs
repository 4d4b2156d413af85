//! Saga Orchestrator: long-running process instances with forward
//! steps, compensation, retry, and timeout, persisted on the Event Store
//! so a crash can recover by replaying each instance's `saga-{id}` stream.

pub mod definition;
pub mod instance;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SagaConfig;
use crate::context::Context;
use crate::error::{RuntimeError, RuntimeResult};
use crate::eventstore::model::NewEvent;
use crate::eventstore::EventStore;
use crate::kv_storage::Storage;

use definition::{ParallelJoin, SagaType, StepKind};
use instance::{CompensationOutcome, SagaInstance, SagaState};

/// The seam through which `command`-type steps reach the Command
/// Dispatcher, kept as a trait so this module never depends on
/// `crate::dispatch` directly.
#[async_trait]
pub trait CommandExecutor: Send + Sync + 'static {
    async fn execute(&self, command_type: &str, body: Value) -> RuntimeResult<Value>;
}

const EVENT_SAGA_STATE_CHANGED: &str = "SagaStateChanged";
const EVENT_SAGA_FAILED: &str = "SagaFailed";

pub struct SagaOrchestrator<S: Storage> {
    config: SagaConfig,
    ctx: Context,
    event_store: Arc<EventStore<S>>,
    executor: Arc<dyn CommandExecutor>,
    types: dashmap::DashMap<String, Arc<SagaType>>,
    instances: dashmap::DashMap<Uuid, Arc<Mutex<SagaInstance>>>,
}

impl<S: Storage> SagaOrchestrator<S> {
    pub fn new(config: SagaConfig, ctx: Context, event_store: Arc<EventStore<S>>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { config, ctx, event_store, executor, types: dashmap::DashMap::new(), instances: dashmap::DashMap::new() }
    }

    pub fn register_type(&self, saga_type: SagaType) {
        self.types.insert(saga_type.name.clone(), Arc::new(saga_type));
    }

    fn now_ms(&self) -> u64 {
        self.ctx.clock.wall_now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    /// "Started by ... an explicit `start(type, data)`".
    pub async fn start(self: &Arc<Self>, type_name: &str, data: Value) -> RuntimeResult<Uuid> {
        let saga_type = self.types.get(type_name).ok_or_else(|| RuntimeError::ValidationError(format!("unknown saga type {type_name}")))?.clone();
        let instance = SagaInstance::new(type_name, data, self.now_ms());
        let id = instance.id;
        self.persist(&instance).await?;
        let handle = Arc::new(Mutex::new(instance));
        self.instances.insert(id, handle.clone());
        self.spawn_runner(saga_type, handle);
        Ok(id)
    }

    /// "Started by: an event matching a trigger ... or ... resumes
    /// execution from the next step" for instances in `waiting`.
    pub async fn handle_event(self: &Arc<Self>, event_type: &str, payload: Value) -> RuntimeResult<()> {
        for entry in self.instances.iter() {
            let handle = entry.value().clone();
            let mut guard = handle.lock().await;
            if guard.state != SagaState::Waiting {
                continue;
            }
            let Some(saga_type) = self.types.get(&guard.saga_type).map(|t| t.clone()) else { continue };
            let Some(step) = saga_type.steps.get(guard.current_step) else { continue };
            if step.wait_for_event.as_deref() == Some(event_type) {
                merge_json(&mut guard.data, &payload);
                guard.current_step += 1;
                guard.state = SagaState::Running;
                guard.last_activity_ms = self.now_ms();
                self.persist(&guard).await?;
                drop(guard);
                self.spawn_runner(saga_type, handle);
            }
        }

        for entry in self.types.iter() {
            let saga_type = entry.value().clone();
            if !saga_type.trigger_event_types.iter().any(|t| t == event_type) {
                continue;
            }
            if let Some(cond) = &saga_type.trigger_condition {
                if !cond.evaluate(&payload).await {
                    continue;
                }
            }
            self.start(&saga_type.name, payload.clone()).await?;
        }
        Ok(())
    }

    fn spawn_runner(self: &Arc<Self>, saga_type: Arc<SagaType>, handle: Arc<Mutex<SagaInstance>>) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.run(saga_type, handle).await {
                tracing::error!(?err, "saga runner terminated with an unrecoverable error");
            }
        });
    }

    /// Drives one instance forward from its current step until it
    /// completes, suspends waiting for an event, or fails into compensation.
    #[tracing::instrument(level = "debug", skip(self, saga_type, handle))]
    async fn run(self: &Arc<Self>, saga_type: Arc<SagaType>, handle: Arc<Mutex<SagaInstance>>) -> RuntimeResult<()> {
        loop {
            let mut guard = handle.lock().await;
            if guard.state == SagaState::Waiting || guard.state == SagaState::Completed || guard.state == SagaState::Failed {
                return Ok(());
            }
            if self.now_ms().saturating_sub(guard.start_time_ms) > saga_type.timeout.as_millis() as u64 {
                guard.record_error("instance timed out");
                drop(guard);
                self.enter_compensation(&saga_type, &handle).await?;
                return Ok(());
            }
            if guard.current_step >= saga_type.steps.len() {
                guard.state = SagaState::Completed;
                self.persist(&guard).await?;
                return Ok(());
            }
            guard.state = SagaState::Running;
            let step_index = guard.current_step;
            let data_snapshot = guard.data.clone();
            drop(guard);

            let step = &saga_type.steps[step_index];
            let result = self.execute_step(step, &data_snapshot).await;

            let mut guard = handle.lock().await;
            match result {
                Ok(StepOutcome::Advance(value)) => {
                    guard.retries = 0;
                    merge_json(&mut guard.data, &value);
                    guard.completed.push(step.name.clone());
                    if let Some(_comp) = &step.compensation {
                        guard.push_compensation(step.name.clone(), value);
                    }
                    if step.wait_for_event.is_some() {
                        guard.state = SagaState::Waiting;
                        guard.last_activity_ms = self.now_ms();
                        self.persist(&guard).await?;
                        return Ok(());
                    }
                    guard.current_step += 1;
                    guard.last_activity_ms = self.now_ms();
                    self.persist(&guard).await?;
                }
                Ok(StepOutcome::Branch(next_step_name)) => {
                    guard.current_step = saga_type.step_index(&next_step_name).unwrap_or(saga_type.steps.len());
                    guard.last_activity_ms = self.now_ms();
                    self.persist(&guard).await?;
                }
                Err(err) => {
                    guard.retries += 1;
                    guard.record_error(err.to_string());
                    if guard.retries <= self.config.max_retries {
                        guard.state = SagaState::Retrying;
                        self.persist(&guard).await?;
                        let delay = self.config.retry_base_delay * guard.retries;
                        drop(guard);
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    guard.failed.push(step.name.clone());
                    drop(guard);
                    self.enter_compensation(&saga_type, &handle).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn execute_step(&self, step: &definition::Step, data: &Value) -> RuntimeResult<StepOutcome> {
        match &step.kind {
            StepKind::Action(action) => Ok(StepOutcome::Advance(action.run(data).await?)),
            StepKind::Command { command_type } => Ok(StepOutcome::Advance(self.executor.execute(command_type, data.clone()).await?)),
            StepKind::Parallel { actions, join } => {
                let futs = actions.iter().map(|a| a.run(data));
                let results = futures::future::join_all(futs).await;
                match join {
                    ParallelJoin::WaitForAll => {
                        let mut values = Vec::with_capacity(results.len());
                        for r in results {
                            values.push(r?);
                        }
                        Ok(StepOutcome::Advance(Value::Array(values)))
                    }
                    ParallelJoin::Settled => {
                        let values: Vec<Value> = results
                            .into_iter()
                            .map(|r| match r {
                                Ok(v) => v,
                                Err(e) => serde_json::json!({"error": e.to_string()}),
                            })
                            .collect();
                        Ok(StepOutcome::Advance(Value::Array(values)))
                    }
                }
            }
            StepKind::Condition { predicate, if_true, if_false } => {
                let branch = if predicate.evaluate(data).await? { if_true } else { if_false };
                Ok(StepOutcome::Branch(branch.clone()))
            }
        }
    }

    /// Failure & compensation: invoke the compensation stack LIFO;
    /// every entry gets a recorded outcome (success or failure) even if a
    /// compensation itself fails, and failures never halt the sweep.
    async fn enter_compensation(&self, saga_type: &Arc<SagaType>, handle: &Arc<Mutex<SagaInstance>>) -> RuntimeResult<()> {
        {
            let mut guard = handle.lock().await;
            guard.state = SagaState::Compensating;
            self.persist(&guard).await?;
        }

        loop {
            let (entry, data_snapshot) = {
                let mut guard = handle.lock().await;
                match guard.pop_compensation() {
                    Some(e) => (e, guard.data.clone()),
                    None => break,
                }
            };
            let Some(step) = saga_type.steps.iter().find(|s| s.name == entry.step_name) else { continue };
            let Some(compensation) = &step.compensation else { continue };

            let outcome = tokio::time::timeout(self.config.compensation_timeout, compensation.compensate(&data_snapshot, &entry.step_result)).await;
            let recorded = match outcome {
                Ok(Ok(())) => CompensationOutcome { step_name: entry.step_name, succeeded: true, error: None },
                Ok(Err(e)) => CompensationOutcome { step_name: entry.step_name, succeeded: false, error: Some(e.to_string()) },
                Err(_) => CompensationOutcome { step_name: entry.step_name, succeeded: false, error: Some("compensation timed out".into()) },
            };
            if !recorded.succeeded {
                tracing::warn!(step = %recorded.step_name, error = ?recorded.error, "compensation failed, continuing sweep");
            }
            let mut guard = handle.lock().await;
            guard.compensated.push(recorded);
            self.persist(&guard).await?;
        }

        let mut guard = handle.lock().await;
        guard.state = SagaState::Failed;
        self.persist_failed(&guard).await?;
        Ok(())
    }

    /// Persistence: every state change becomes a `SagaStateChanged`
    /// event on the instance's own stream.
    async fn persist(&self, instance: &SagaInstance) -> RuntimeResult<()> {
        let payload = serde_json::to_vec(instance).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        let new_event = NewEvent {
            event_type: EVENT_SAGA_STATE_CHANGED.to_string(),
            payload,
            metadata: Default::default(),
            correlation_id: Some(instance.id),
            causation_id: None,
        };
        self.event_store.append(instance.stream_id(), vec![new_event], -1).await?;
        Ok(())
    }

    async fn persist_failed(&self, instance: &SagaInstance) -> RuntimeResult<()> {
        let payload = serde_json::to_vec(instance).map_err(|e| RuntimeError::Internal(e.to_string()))?;
        let new_event = NewEvent {
            event_type: EVENT_SAGA_FAILED.to_string(),
            payload,
            metadata: Default::default(),
            correlation_id: Some(instance.id),
            causation_id: None,
        };
        self.event_store.append(instance.stream_id(), vec![new_event], -1).await?;
        Ok(())
    }

    /// "enabling crash recovery by replaying that stream on startup":
    /// discover every `saga-*` stream, reconstruct the latest persisted
    /// instance, and resume any that are not already terminal.
    pub async fn recover(self: &Arc<Self>) -> RuntimeResult<usize> {
        let streams = self.event_store.list_streams_with_prefix("saga-").await?;
        let mut resumed = 0;
        for stream_id in streams {
            let read = self.event_store.read_stream(&stream_id, 0, usize::MAX).await?;
            let Some(last) = read.events.last() else { continue };
            let instance: SagaInstance = serde_json::from_slice(&last.payload).map_err(|e| RuntimeError::Corruption(e.to_string()))?;
            if matches!(instance.state, SagaState::Completed | SagaState::Failed) {
                continue;
            }
            let Some(saga_type) = self.types.get(&instance.saga_type).map(|t| t.clone()) else { continue };
            let id = instance.id;
            let handle = Arc::new(Mutex::new(instance));
            self.instances.insert(id, handle.clone());
            self.spawn_runner(saga_type, handle);
            resumed += 1;
        }
        Ok(resumed)
    }

    pub async fn instance_snapshot(&self, id: Uuid) -> Option<SagaInstance> {
        match self.instances.get(&id) {
            Some(h) => Some(h.clone().lock_owned().await.clone()),
            None => None,
        }
    }
}

enum StepOutcome {
    Advance(Value),
    Branch(String),
}

fn merge_json(target: &mut Value, patch: &Value) {
    if let (Value::Object(target_map), Value::Object(patch_map)) = (&mut *target, patch) {
        for (k, v) in patch_map {
            target_map.insert(k.clone(), v.clone());
        }
    } else if !patch.is_null() {
        *target = patch.clone();
    }
}
