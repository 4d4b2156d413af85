//! Saga type and step definitions. A saga type is a static,
//! registered description of the steps an instance will walk through; an
//! instance (see `instance.rs`) is the runtime state for one execution.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::RuntimeResult;

/// A forward action or branch condition evaluated while a saga instance
/// runs a step. Implementors close over whatever handler logic a concrete
/// saga needs; the orchestrator only ever calls these through the trait.
#[async_trait]
pub trait StepAction: Send + Sync + 'static {
    async fn run(&self, data: &Value) -> RuntimeResult<Value>;
}

#[async_trait]
pub trait Compensation: Send + Sync + 'static {
    async fn compensate(&self, data: &Value, step_result: &Value) -> RuntimeResult<()>;
}

#[async_trait]
pub trait StepCondition: Send + Sync + 'static {
    async fn evaluate(&self, data: &Value) -> RuntimeResult<bool>;
}

#[async_trait]
pub trait TriggerCondition: Send + Sync + 'static {
    async fn evaluate(&self, event_payload: &Value) -> bool;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParallelJoin {
    WaitForAll,
    Settled,
}

pub enum StepKind {
    Action(Box<dyn StepAction>),
    /// Dispatched through the Command Dispatcher by `type` name; the body
    /// is built from the saga's current data.
    Command { command_type: String },
    Parallel { actions: Vec<Box<dyn StepAction>>, join: ParallelJoin },
    Condition { predicate: Box<dyn StepCondition>, if_true: String, if_false: String },
}

pub struct Step {
    pub name: String,
    pub kind: StepKind,
    pub compensation: Option<Box<dyn Compensation>>,
    /// When set, the instance suspends in `waiting` after this step until a
    /// matching event arrives at `eventHandlers`.
    pub wait_for_event: Option<String>,
}

pub struct SagaType {
    pub name: String,
    pub trigger_event_types: Vec<String>,
    pub trigger_condition: Option<Box<dyn TriggerCondition>>,
    pub steps: Vec<Step>,
    pub timeout: std::time::Duration,
}

impl SagaType {
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }
}
