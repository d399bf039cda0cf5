#![allow(dead_code)]

use rust_dfn::identity::resolve;
use rust_dfn::{Client, ExecutionOutcome, FunctionRegistry, InvocationPayload, MemoizedRecord, StepError, StepReport};
use serde_json::{Value, json};

pub const RUN_ID: &str = "run-test-1";

pub fn client(registry: FunctionRegistry) -> Client {
    Client::builder().registry(registry).build()
}

pub fn event(data: Value) -> Value {
    json!({ "name": "test/event", "data": data })
}

/// Key of the first occurrence of a step named `name`.
pub fn key(name: &str) -> String {
    resolve(name, 0)
}

/// Successful memoized records for first occurrences of the given names.
pub fn memo(entries: &[(&str, Value)]) -> Vec<MemoizedRecord> {
    entries
        .iter()
        .map(|(name, data)| MemoizedRecord::success(key(name), data.clone()))
        .collect()
}

pub fn payload(steps: Vec<MemoizedRecord>) -> InvocationPayload {
    InvocationPayload::new(RUN_ID, event(json!({}))).with_steps(steps)
}

pub fn expect_steps_found(outcome: ExecutionOutcome) -> Vec<StepReport> {
    match outcome {
        ExecutionOutcome::StepsFound(steps) => steps,
        other => panic!("expected StepsFound, got {other:?}"),
    }
}

pub fn expect_step_ran(outcome: ExecutionOutcome) -> StepReport {
    match outcome {
        ExecutionOutcome::StepRan(step) => step,
        other => panic!("expected StepRan, got {other:?}"),
    }
}

pub fn expect_completed(outcome: ExecutionOutcome) -> Value {
    match outcome {
        ExecutionOutcome::Completed(v) => v,
        other => panic!("expected Completed, got {other:?}"),
    }
}

pub fn expect_failed(outcome: ExecutionOutcome) -> (StepError, bool, Option<StepReport>) {
    match outcome {
        ExecutionOutcome::Failed { error, retriable, step } => (error, retriable, step),
        other => panic!("expected Failed, got {other:?}"),
    }
}

pub fn names(steps: &[StepReport]) -> Vec<&str> {
    steps.iter().map(|s| s.name.as_str()).collect()
}
