//! Saga instance state: the runtime record for one execution of
//! a [`super::definition::SagaType`], including its LIFO compensation
//! stack.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SagaState {
    Started,
    Running,
    Waiting,
    Retrying,
    Compensating,
    Completed,
    Failed,
}

/// One entry pushed when a step with a compensation completes
/// successfully; popped in reverse (LIFO) during compensation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub step_name: String,
    pub step_result: Value,
}

/// The outcome of attempting to compensate one entry, recorded in
/// `compensated` regardless of success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationOutcome {
    pub step_name: String,
    pub succeeded: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub id: Uuid,
    pub saga_type: String,
    pub data: Value,
    pub state: SagaState,
    pub current_step: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub compensated: Vec<CompensationOutcome>,
    pub compensation_stack: Vec<CompensationEntry>,
    pub retries: u32,
    pub start_time_ms: u64,
    pub last_activity_ms: u64,
    pub errors: Vec<String>,
}

impl SagaInstance {
    pub fn new(saga_type: impl Into<String>, data: Value, now_ms: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            saga_type: saga_type.into(),
            data,
            state: SagaState::Started,
            current_step: 0,
            completed: Vec::new(),
            failed: Vec::new(),
            compensated: Vec::new(),
            compensation_stack: Vec::new(),
            retries: 0,
            start_time_ms: now_ms,
            last_activity_ms: now_ms,
            errors: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> String {
        format!("saga-{}", self.id)
    }

    pub fn push_compensation(&mut self, step_name: impl Into<String>, step_result: Value) {
        self.compensation_stack.push(CompensationEntry { step_name: step_name.into(), step_result });
    }

    pub fn pop_compensation(&mut self) -> Option<CompensationEntry> {
        self.compensation_stack.pop()
    }

    pub fn record_error(&mut self, err: impl Into<String>) {
        self.errors.push(err.into());
    }
}
