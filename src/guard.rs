//! Determinism guard: traps handler behavior that replay cannot reproduce.
//!
//! Two invariants are enforced while a pass runs:
//! - once a step has been reached, the handler may only suspend on steps;
//! - a step may not be called from inside another step's callback.
//!
//! A third check compares memoized records against what the handler actually
//! reached; by default it only warns.
use std::fmt;

use crate::identity::StepId;
use crate::memo::MemoStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationCode {
    AsyncOutsideStep,
    StepNested,
    NonDeterministicReplay,
}

impl ViolationCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationCode::AsyncOutsideStep => "ASYNC_OUTSIDE_STEP",
            ViolationCode::StepNested => "STEP_NESTED",
            ViolationCode::NonDeterministicReplay => "NON_DETERMINISTIC_REPLAY",
        }
    }
}

impl fmt::Display for ViolationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub code: ViolationCode,
    pub message: String,
}

impl Violation {
    fn new(code: ViolationCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeterminismGuard {
    strict_replay: bool,
}

impl DeterminismGuard {
    pub fn new(strict_replay: bool) -> Self {
        Self { strict_replay }
    }

    /// Call when handler code reaches a step. `executing` is the step whose
    /// callback the call was made from, if any.
    pub fn check_step_call(&self, executing: Option<&StepId>, id: &StepId) -> Result<(), Violation> {
        match executing {
            Some(parent) => Err(Violation::new(
                ViolationCode::StepNested,
                format!(
                    "step \"{}\" was called inside the callback of step \"{}\"; steps cannot be nested",
                    id.name, parent.name
                ),
            )),
            None => Ok(()),
        }
    }

    /// Call when the handler suspends. `steps_seen` counts steps reached this
    /// pass and `pending_steps` those the handler may be waiting on.
    pub fn check_suspension(&self, steps_seen: usize, pending_steps: usize) -> Result<(), Violation> {
        if steps_seen > 0 && pending_steps == 0 {
            return Err(Violation::new(
                ViolationCode::AsyncOutsideStep,
                "handler awaited something other than a step after a step was reached; \
                 wrap asynchronous work in a step so replay can reproduce it",
            ));
        }
        Ok(())
    }

    /// Compare memoized records with what the handler reached.
    pub fn check_replay(&self, memo: &MemoStore) -> Result<(), Violation> {
        let unconsumed = memo.unconsumed();
        if unconsumed.is_empty() {
            return Ok(());
        }
        let message = format!(
            "{} memoized step(s) were not reached by this pass; handler code may have branched differently \
             than the run that produced them: {}",
            unconsumed.len(),
            unconsumed.join(", ")
        );
        if self.strict_replay {
            return Err(Violation::new(ViolationCode::NonDeterministicReplay, message));
        }
        tracing::warn!(code = ViolationCode::NonDeterministicReplay.as_str(), "{message}");
        Ok(())
    }
}
