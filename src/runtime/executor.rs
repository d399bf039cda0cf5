//! In-process orchestrator loop for samples and tests.
//!
//! Plays the orchestrator's side of the protocol: requests each reported
//! step, memoizes results and retries failed steps until the run finishes.
use serde_json::Value;
use std::collections::VecDeque;
use tracing::{debug, trace};

use super::Client;
use crate::error::{StepError, serialize_error};
use crate::memo::MemoizedRecord;
use crate::protocol::{ExecutionOutcome, InvocationPayload, StepReport};

/// Passes after which the executor gives up on a run.
const MAX_PASSES: usize = 1_000;

/// What a driven run produced.
#[derive(Debug, Clone)]
pub struct DriveResult {
    /// Memoized records in completion order, as the orchestrator stored them.
    pub history: Vec<MemoizedRecord>,
    /// Every pass outcome, in order; the last one is terminal.
    pub passes: Vec<ExecutionOutcome>,
}

impl DriveResult {
    pub fn outcome(&self) -> Option<&ExecutionOutcome> {
        self.passes.last()
    }

    /// The run's return value, or the error it failed with.
    pub fn output(&self) -> Result<&Value, &StepError> {
        match self.passes.last() {
            Some(ExecutionOutcome::Completed(v)) => Ok(v),
            Some(ExecutionOutcome::Failed { error, .. }) => Err(error),
            _ => Ok(&Value::Null),
        }
    }
}

pub struct Executor;

impl Executor {
    /// Drives a function by alternately running one pass and materializing
    /// what it reported, until the run completes or fails for good.
    ///
    /// Executable steps are requested back from the client one at a time.
    /// Sleeps, event waits and invokes are settled by `resolve`.
    pub async fn drive_to_completion<R>(
        client: &Client,
        function_id: &str,
        run_id: &str,
        event: Value,
        mut resolve: R,
    ) -> DriveResult
    where
        R: FnMut(&StepReport) -> Result<Value, StepError>,
    {
        let max_attempts = client.config().default_max_attempts;
        let mut history: Vec<MemoizedRecord> = Vec::new();
        let mut passes = Vec::new();
        let mut requested: VecDeque<String> = VecDeque::new();
        let mut attempt: u32 = 0;

        for pass in 0..MAX_PASSES {
            let mut payload = InvocationPayload::new(run_id, event.clone())
                .with_steps(history.clone())
                .with_attempt(attempt)
                .with_max_attempts(max_attempts);
            if let Some(key) = requested.pop_front() {
                payload = payload.with_requested_step(key);
            }
            let outcome = client.execute(function_id, payload).await;
            trace!(pass, outcome = outcome.label(), "executor pass");

            match &outcome {
                ExecutionOutcome::Completed(_) => {
                    passes.push(outcome);
                    return DriveResult { history, passes };
                }
                ExecutionOutcome::Failed { step: Some(report), .. } => {
                    // Step exhausted its retries; the handler sees the error.
                    if let Some(error) = &report.error {
                        history.push(MemoizedRecord::failure(report.key.clone(), error.clone()));
                    }
                    attempt = 0;
                }
                ExecutionOutcome::Failed { retriable, .. } => {
                    if !*retriable || attempt + 1 >= max_attempts {
                        passes.push(outcome);
                        return DriveResult { history, passes };
                    }
                    attempt += 1;
                }
                ExecutionOutcome::StepRan(report) => match (&report.data, &report.error) {
                    (_, Some(_)) => {
                        attempt += 1;
                        debug!(step = %report.name, attempt, "retrying step");
                        requested.push_front(report.key.clone());
                    }
                    (data, None) => {
                        history.push(MemoizedRecord::success(
                            report.key.clone(),
                            data.clone().unwrap_or(Value::Null),
                        ));
                        attempt = 0;
                    }
                },
                ExecutionOutcome::StepsFound(reports) => {
                    for report in reports {
                        if report.kind.is_executable() {
                            if !requested.contains(&report.key) {
                                requested.push_back(report.key.clone());
                            }
                            continue;
                        }
                        let record = match resolve(report) {
                            Ok(v) => MemoizedRecord::success(report.key.clone(), v),
                            Err(e) => MemoizedRecord::failure(report.key.clone(), serialize_error(&e)),
                        };
                        history.push(record);
                    }
                }
            }
            passes.push(outcome);
        }

        let error = StepError::non_retriable(format!("run did not finish within {MAX_PASSES} passes"))
            .with_code("PASS_LIMIT");
        passes.push(ExecutionOutcome::Failed {
            error,
            retriable: false,
            step: None,
        });
        DriveResult { history, passes }
    }
}
