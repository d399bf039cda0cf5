//! Invocation and response payloads exchanged with the orchestrator, and the
//! suspend/report step that turns a pass outcome into a response.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, StepError, serialize_error};
use crate::identity::StepKind;
use crate::memo::MemoizedRecord;

/// Canonical invocation payload produced by a framework adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationPayload {
    pub run_id: String,
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub event: Value,
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub steps: Vec<MemoizedRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_step_key: Option<String>,
    #[serde(default)]
    pub disable_immediate_execution: bool,
}

impl InvocationPayload {
    /// First invocation of a run: no memoized steps, attempt zero.
    pub fn new(run_id: impl Into<String>, event: Value) -> Self {
        Self {
            run_id: run_id.into(),
            attempt: 0,
            max_attempts: None,
            events: vec![event.clone()],
            event,
            steps: Vec::new(),
            requested_step_key: None,
            disable_immediate_execution: false,
        }
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, EngineError> {
        Ok(serde_json::from_slice(body)?)
    }

    pub fn with_steps(mut self, steps: Vec<MemoizedRecord>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_requested_step(mut self, key: impl Into<String>) -> Self {
        self.requested_step_key = Some(key.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn disable_immediate_execution(mut self) -> Self {
        self.disable_immediate_execution = true;
        self
    }
}

/// One step surfaced to the orchestrator, with its result when the engine
/// executed it in this pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub key: String,
    pub name: String,
    pub kind: StepKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl StepReport {
    pub fn has_result(&self) -> bool {
        self.data.is_some() || self.error.is_some()
    }
}

/// Result of one pass. Exactly one is produced per invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed(Value),
    StepsFound(Vec<StepReport>),
    StepRan(StepReport),
    Failed {
        error: StepError,
        retriable: bool,
        step: Option<StepReport>,
    },
}

impl ExecutionOutcome {
    pub(crate) fn from_engine_error(err: &EngineError) -> Self {
        ExecutionOutcome::Failed {
            error: err.to_step_error(),
            retriable: err.is_retriable(),
            step: None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed(_) => "completed",
            ExecutionOutcome::StepsFound(_) => "steps_found",
            ExecutionOutcome::StepRan(_) => "step_ran",
            ExecutionOutcome::Failed { .. } => "failed",
        }
    }

    /// Engine error code of a failed outcome, if any.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            ExecutionOutcome::Failed { error, .. } => error.code.as_deref(),
            _ => None,
        }
    }
}

/// Canonical response payload handed back to a framework adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum ResponsePayload {
    Completed {
        data: Value,
    },
    Failed {
        error: Value,
        retriable: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step: Option<StepReport>,
    },
    Steps {
        steps: Vec<StepReport>,
        #[serde(rename = "completionOrderHint")]
        completion_order_hint: Vec<String>,
    },
}

impl ResponsePayload {
    /// Transport status code conventionally used by adapters.
    pub fn status_code(&self) -> u16 {
        match self {
            ResponsePayload::Completed { .. } => 200,
            ResponsePayload::Steps { .. } => 206,
            ResponsePayload::Failed { .. } => 500,
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            ResponsePayload::Failed { retriable, .. } => *retriable,
            _ => true,
        }
    }
}

/// Convert a pass outcome into the response payload. `completion_order` is
/// the memo store's order; keys of steps executed in this pass are appended.
pub fn build_response(outcome: &ExecutionOutcome, completion_order: &[String]) -> ResponsePayload {
    match outcome {
        ExecutionOutcome::Completed(data) => ResponsePayload::Completed { data: data.clone() },
        ExecutionOutcome::Failed { error, retriable, step } => ResponsePayload::Failed {
            error: serialize_error(error),
            retriable: *retriable,
            step: step.clone(),
        },
        ExecutionOutcome::StepsFound(steps) => steps_response(steps.clone(), completion_order),
        ExecutionOutcome::StepRan(step) => steps_response(vec![step.clone()], completion_order),
    }
}

fn steps_response(steps: Vec<StepReport>, completion_order: &[String]) -> ResponsePayload {
    let mut hint = completion_order.to_vec();
    for s in steps.iter().filter(|s| s.has_result()) {
        if !hint.contains(&s.key) {
            hint.push(s.key.clone());
        }
    }
    ResponsePayload::Steps {
        steps,
        completion_order_hint: hint,
    }
}
