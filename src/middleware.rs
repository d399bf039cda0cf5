//! Middleware pipeline: lifecycle hooks bracketing every pass.
//!
//! A `Middleware` is registered on the client and asked for a fresh set of
//! `RunHooks` at the start of each pass, so per-pass resources can be
//! acquired in an early hook and released in `finished`. Hooks never take
//! part in determinism decisions.
//!
//! Ordering is onion-shaped: `transform_input` and the "before" hooks run in
//! registration order; `transform_output`, the "after" hooks and `finished`
//! run in reverse.
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crate::context::RunInfo;
use crate::error::{EngineError, StepError};
use crate::memo::MemoizedRecord;
use crate::protocol::ExecutionOutcome;

/// Data the handler is about to see; hooks may rewrite it (e.g. decrypt).
#[derive(Debug, Clone, PartialEq)]
pub struct TransformInput {
    pub event: Value,
    pub events: Vec<Value>,
    pub steps: Vec<MemoizedRecord>,
}

/// Which result a `TransformOutput` carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    /// Result of the step with this key, executed in this pass.
    Step { key: String, name: String },
    /// The handler's return value.
    Run,
}

/// A result about to be serialized; hooks may rewrite it (e.g. encrypt).
#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub target: OutputTarget,
    pub result: Result<Value, StepError>,
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per pass before any other hook.
    async fn on_run(&self, run: &RunInfo) -> Result<Box<dyn RunHooks>, StepError>;
}

/// Per-pass hooks. Every method is optional.
#[async_trait]
pub trait RunHooks: Send {
    async fn transform_input(&mut self, _input: &mut TransformInput) -> Result<(), StepError> {
        Ok(())
    }
    async fn before_memoization(&mut self) -> Result<(), StepError> {
        Ok(())
    }
    async fn after_memoization(&mut self) -> Result<(), StepError> {
        Ok(())
    }
    async fn before_execution(&mut self) -> Result<(), StepError> {
        Ok(())
    }
    async fn after_execution(&mut self) -> Result<(), StepError> {
        Ok(())
    }
    async fn transform_output(&mut self, _output: &mut TransformOutput) -> Result<(), StepError> {
        Ok(())
    }
    async fn before_response(&mut self) -> Result<(), StepError> {
        Ok(())
    }
    /// Always runs, on every exit path.
    async fn finished(&mut self, _outcome: &ExecutionOutcome) {}
}

/// Ordered middleware registered on a client.
#[derive(Clone, Default)]
pub struct MiddlewareStack {
    layers: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, m: Arc<dyn Middleware>) {
        self.layers.push(m);
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Instantiate hooks for one pass. If a middleware fails here, hooks
    /// already created are kept so their `finished` still runs.
    pub async fn start(&self, run: &RunInfo) -> (PassHooks, Result<(), EngineError>) {
        let mut hooks = PassHooks { hooks: Vec::with_capacity(self.layers.len()) };
        for m in &self.layers {
            let created = match AssertUnwindSafe(m.on_run(run)).catch_unwind().await {
                Ok(created) => created,
                Err(panic) => Err(StepError::from_panic(panic)),
            };
            match created {
                Ok(h) => hooks.hooks.push((m.name().to_string(), h)),
                Err(source) => {
                    let err = EngineError::Middleware {
                        middleware: m.name().to_string(),
                        hook: "onRun",
                        source,
                    };
                    return (hooks, Err(err));
                }
            }
        }
        (hooks, Ok(()))
    }
}

/// Hooks instantiated for a single pass.
pub struct PassHooks {
    hooks: Vec<(String, Box<dyn RunHooks>)>,
}

fn fail(name: &str, hook: &'static str, source: StepError) -> EngineError {
    EngineError::Middleware {
        middleware: name.to_string(),
        hook,
        source,
    }
}

/// Await one hook; a panic inside it counts as that hook failing.
async fn call<F>(name: &str, hook: &'static str, fut: F) -> Result<(), EngineError>
where
    F: Future<Output = Result<(), StepError>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res.map_err(|e| fail(name, hook, e)),
        Err(panic) => Err(fail(name, hook, StepError::from_panic(panic))),
    }
}

impl PassHooks {
    pub async fn transform_input(&mut self, input: &mut TransformInput) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut() {
            call(name, "transformInput", h.transform_input(input)).await?;
        }
        Ok(())
    }

    pub async fn before_memoization(&mut self) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut() {
            call(name, "beforeMemoization", h.before_memoization()).await?;
        }
        Ok(())
    }

    pub async fn after_memoization(&mut self) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut().rev() {
            call(name, "afterMemoization", h.after_memoization()).await?;
        }
        Ok(())
    }

    pub async fn before_execution(&mut self) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut() {
            call(name, "beforeExecution", h.before_execution()).await?;
        }
        Ok(())
    }

    pub async fn after_execution(&mut self) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut().rev() {
            call(name, "afterExecution", h.after_execution()).await?;
        }
        Ok(())
    }

    pub async fn transform_output(&mut self, output: &mut TransformOutput) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut().rev() {
            call(name, "transformOutput", h.transform_output(output)).await?;
        }
        Ok(())
    }

    pub async fn before_response(&mut self) -> Result<(), EngineError> {
        for (name, h) in self.hooks.iter_mut() {
            call(name, "beforeResponse", h.before_response()).await?;
        }
        Ok(())
    }

    pub async fn finished(&mut self, outcome: &ExecutionOutcome) {
        for (name, h) in self.hooks.iter_mut().rev() {
            if let Err(panic) = AssertUnwindSafe(h.finished(outcome)).catch_unwind().await {
                let err = StepError::from_panic(panic);
                tracing::warn!(middleware = %name, error = %err, "finished hook panicked");
            }
        }
    }
}
