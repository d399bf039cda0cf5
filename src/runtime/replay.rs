//! Tick scheduler: drives one pass of a handler.
//!
//! The handler is re-run from the top. Memoized steps resolve inside the same
//! poll, so the handler races forward until every branch it is waiting on is
//! a step nobody has executed yet. Those steps form the tick; the scheduler
//! then either executes a single candidate inline or reports the whole set.
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::poll_fn;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::config::EngineConfig;
use crate::context::{DiscoveredStep, PassPhase, PassShared, PassState, RunInfo, StepContext};
use crate::error::{EngineError, ErrorRegistry, StepError, serialize_error};
use crate::guard::{DeterminismGuard, Violation};
use crate::identity::StepId;
use crate::memo::MemoStore;
use crate::middleware::{MiddlewareStack, OutputTarget, PassHooks, TransformInput, TransformOutput};
use crate::protocol::{ExecutionOutcome, InvocationPayload, ResponsePayload, StepReport, build_response};
use crate::runtime::{EventSender, FunctionHandler, FunctionInput};

type HandlerFuture = BoxFuture<'static, Result<Value, StepError>>;

/// Everything a pass needs; assembled by the client per invocation.
pub struct PassRequest {
    pub function_id: String,
    pub handler: Arc<dyn FunctionHandler>,
    pub payload: InvocationPayload,
    pub config: Arc<EngineConfig>,
    pub errors: Arc<ErrorRegistry>,
    pub middleware: MiddlewareStack,
    pub event_sender: Option<Arc<dyn EventSender>>,
    pub cancel: CancellationToken,
}

/// Outcome of a pass and the response built from it.
#[derive(Debug, Clone)]
pub struct PassResult {
    pub outcome: ExecutionOutcome,
    pub response: ResponsePayload,
}

#[async_trait]
pub trait ReplayEngine: Send + Sync {
    /// Run one pass and produce exactly one outcome.
    async fn run_pass(&self, request: PassRequest) -> PassResult;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultReplayEngine;

impl DefaultReplayEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ReplayEngine for DefaultReplayEngine {
    async fn run_pass(&self, request: PassRequest) -> PassResult {
        let max_attempts = request
            .payload
            .max_attempts
            .unwrap_or(request.config.default_max_attempts)
            .max(1);
        let run = RunInfo {
            function_id: request.function_id.clone(),
            run_id: request.payload.run_id.clone(),
            attempt: request.payload.attempt,
            max_attempts,
            disable_immediate_execution: request.payload.disable_immediate_execution,
        };
        let span = tracing::info_span!(
            "pass",
            app_id = %request.config.app_id,
            function_id = %run.function_id,
            run_id = %run.run_id,
            attempt = run.attempt
        );
        Pass::new(run).drive(request).instrument(span).await
    }
}

/// Handler continuation left pending at suspension. It is never polled
/// again; dropping it releases whatever the handler was holding.
struct Abandoned {
    _fut: HandlerFuture,
    pending_steps: usize,
}

impl Drop for Abandoned {
    fn drop(&mut self) {
        debug!(pending_steps = self.pending_steps, "abandoning suspended handler");
    }
}

enum TickEnd {
    Returned(Result<Value, StepError>),
    Suspended,
    Violation(Violation),
}

enum HandlerPoll {
    Returned(Result<Value, StepError>),
    Violation(Violation),
    Pending { discovered: usize, steps_seen: usize },
}

struct Pass {
    run: RunInfo,
    ctx: Option<StepContext>,
    memo_hooks_fired: bool,
}

impl Pass {
    fn new(run: RunInfo) -> Self {
        Self {
            run,
            ctx: None,
            memo_hooks_fired: false,
        }
    }

    async fn drive(mut self, request: PassRequest) -> PassResult {
        let (mut hooks, started) = request.middleware.start(&self.run).await;
        let mut outcome = match started {
            Ok(()) => match self.execute(&mut hooks, request).await {
                Ok(o) => o,
                Err(e) => self.fail(&e),
            },
            Err(e) => self.fail(&e),
        };
        if let Err(e) = hooks.before_response().await {
            outcome = self.fail(&e);
        }
        let completion_order = self
            .ctx
            .as_ref()
            .map(|c| c.inner.lock().memo.completion_order().to_vec())
            .unwrap_or_default();
        let response = build_response(&outcome, &completion_order);
        hooks.finished(&outcome).await;
        let mut deferred = 0;
        if let Some(ctx) = &self.ctx {
            let logs = {
                let mut st = ctx.inner.lock();
                deferred = st.deferred;
                st.take_logs()
            };
            crate::logging::flush(&self.run.run_id, &self.run.function_id, logs);
        }
        info!(outcome = outcome.label(), deferred, "pass finished");
        PassResult { outcome, response }
    }

    fn fail(&self, err: &EngineError) -> ExecutionOutcome {
        if let Some(ctx) = &self.ctx {
            ctx.inner.lock().transition(PassPhase::Failing);
        }
        warn!(code = err.code(), error = %err, "pass failed");
        ExecutionOutcome::from_engine_error(err)
    }

    async fn execute(&mut self, hooks: &mut PassHooks, request: PassRequest) -> Result<ExecutionOutcome, EngineError> {
        let PassRequest {
            handler,
            payload,
            config,
            errors,
            event_sender,
            cancel,
            ..
        } = request;

        // Initializing
        let mut input = TransformInput {
            event: payload.event,
            events: payload.events,
            steps: payload.steps,
        };
        hooks.transform_input(&mut input).await?;
        let memo = MemoStore::new(input.steps);
        let memo_was_empty = memo.is_empty();
        let state = PassState::new(memo, DeterminismGuard::new(config.strict_replay));
        let ctx = StepContext::new(
            state,
            PassShared {
                run: self.run.clone(),
                errors,
                event_sender,
            },
        );
        self.ctx = Some(ctx.clone());

        // Memoizing
        ctx.inner.lock().transition(PassPhase::Memoizing);
        hooks.before_memoization().await?;

        // Executing
        let fn_input = FunctionInput {
            event: input.event,
            events: input.events,
            run_id: self.run.run_id.clone(),
            attempt: self.run.attempt,
        };
        let handler_ctx = ctx.clone();
        let mut fut: HandlerFuture = Box::pin(async move { handler.invoke(handler_ctx, fn_input).await });
        ctx.inner.lock().transition(PassPhase::Executing);

        let tick = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            t = run_tick(&mut fut, &ctx, config.tick_drain_rounds) => t,
        };

        match tick {
            TickEnd::Violation(v) => {
                drop(fut);
                Err(EngineError::Determinism(v))
            }
            TickEnd::Returned(result) => {
                drop(fut);
                ctx.inner.lock().transition(PassPhase::Completing);
                self.memoization_done(hooks).await?;
                {
                    let st = ctx.inner.lock();
                    st.guard().check_replay(&st.memo).map_err(EngineError::Determinism)?;
                }
                hooks.after_execution().await?;
                let mut output = TransformOutput {
                    target: OutputTarget::Run,
                    result,
                };
                hooks.transform_output(&mut output).await?;
                Ok(match output.result {
                    Ok(data) => ExecutionOutcome::Completed(data),
                    Err(error) => {
                        ctx.inner.lock().transition(PassPhase::Failing);
                        let retriable = !error.is_non_retriable() && !self.run.is_final_attempt();
                        ExecutionOutcome::Failed {
                            error,
                            retriable,
                            step: None,
                        }
                    }
                })
            }
            TickEnd::Suspended => {
                let discovered = {
                    let mut st = ctx.inner.lock();
                    st.transition(PassPhase::Suspending);
                    std::mem::take(&mut st.discovered)
                };
                drop(Abandoned {
                    _fut: fut,
                    pending_steps: discovered.len(),
                });
                self.memoization_done(hooks).await?;
                {
                    let st = ctx.inner.lock();
                    st.guard().check_replay(&st.memo).map_err(EngineError::Determinism)?;
                }
                let outcome = match self.pick_candidate(&discovered, payload.requested_step_key.as_deref(), memo_was_empty) {
                    Some(idx) => {
                        let mut discovered = discovered;
                        let step = discovered.swap_remove(idx);
                        self.execute_step(&ctx, hooks, step, &cancel).await?
                    }
                    None => ExecutionOutcome::StepsFound(discovered.iter().map(report_for).collect()),
                };
                hooks.after_execution().await?;
                Ok(outcome)
            }
        }
    }

    /// Fire the memoization-complete hooks once per pass.
    async fn memoization_done(&mut self, hooks: &mut PassHooks) -> Result<(), EngineError> {
        if self.memo_hooks_fired {
            return Ok(());
        }
        self.memo_hooks_fired = true;
        hooks.after_memoization().await?;
        hooks.before_execution().await
    }

    /// Choose the step to execute inline, if any.
    ///
    /// A step requested by the orchestrator runs even when immediate
    /// execution is disabled. Otherwise a lone executable step runs only when
    /// immediate execution is enabled and the run already has memoized state;
    /// the opening plan of a run is always reported first.
    fn pick_candidate(&self, discovered: &[DiscoveredStep], requested: Option<&str>, memo_was_empty: bool) -> Option<usize> {
        if let Some(key) = requested {
            let found = discovered
                .iter()
                .position(|d| d.id.key == key && d.id.kind.is_executable());
            if found.is_none() {
                warn!(requested = key, discovered = discovered.len(), "requested step was not reached in this pass");
            }
            return found;
        }
        if self.run.disable_immediate_execution || memo_was_empty || discovered.len() != 1 {
            return None;
        }
        discovered[0].id.kind.is_executable().then_some(0)
    }

    async fn execute_step(
        &self,
        ctx: &StepContext,
        hooks: &mut PassHooks,
        step: DiscoveredStep,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut report = report_for(&step);
        debug!(step = %step.id.name, key = %step.id.key, "executing step inline");
        let result = match step.callback {
            Some(callback) => {
                let res = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(EngineError::Cancelled),
                    r = run_callback(ctx, step.id.clone(), callback) => r,
                };
                res?
            }
            None => Err(StepError::non_retriable(format!(
                "step \"{}\" has no callback to execute",
                step.id.name
            ))),
        };

        let mut output = TransformOutput {
            target: OutputTarget::Step {
                key: step.id.key.clone(),
                name: step.id.name.clone(),
            },
            result,
        };
        hooks.transform_output(&mut output).await?;
        match output.result {
            Ok(data) => {
                report.data = Some(data);
                Ok(ExecutionOutcome::StepRan(report))
            }
            Err(error) => {
                report.error = Some(serialize_error(&error));
                if error.is_non_retriable() || self.run.is_final_attempt() {
                    ctx.inner.lock().transition(PassPhase::Failing);
                    info!(step = %step.id.name, "step failed permanently");
                    Ok(ExecutionOutcome::Failed {
                        error,
                        retriable: false,
                        step: Some(report),
                    })
                } else {
                    debug!(step = %step.id.name, error = %error, "step failed; orchestrator will retry");
                    Ok(ExecutionOutcome::StepRan(report))
                }
            }
        }
    }
}

fn report_for(step: &DiscoveredStep) -> StepReport {
    StepReport {
        key: step.id.key.clone(),
        name: step.id.name.clone(),
        kind: step.id.kind,
        opts: step.opts.clone(),
        data: None,
        error: None,
    }
}

/// Poll the handler once, converting panics and guard trips.
fn poll_handler(fut: &mut HandlerFuture, ctx: &StepContext, cx: &mut Context<'_>) -> HandlerPoll {
    ctx.inner.lock().set_tick_waker(cx.waker());
    let polled = std::panic::catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(cx)));
    let mut st = ctx.inner.lock();
    if let Some(v) = st.take_violation() {
        return HandlerPoll::Violation(v);
    }
    match polled {
        Err(panic) => HandlerPoll::Returned(Err(StepError::from_panic(panic))),
        Ok(Poll::Ready(out)) => HandlerPoll::Returned(out),
        Ok(Poll::Pending) => HandlerPoll::Pending {
            discovered: st.discovered.len(),
            steps_seen: st.steps_seen,
        },
    }
}

/// Run the handler until it returns or the tick closes.
///
/// Before any step is reached the handler may await arbitrary futures; the
/// scheduler simply waits to be woken. Once steps are discovered, up to
/// `drain_rounds` yields let work on other tasks reach further steps.
async fn run_tick(fut: &mut HandlerFuture, ctx: &StepContext, drain_rounds: u32) -> TickEnd {
    let mut rounds_left = drain_rounds;
    let mut last_discovered = 0usize;
    loop {
        match poll_fn(|cx| Poll::Ready(poll_handler(fut, ctx, cx))).await {
            HandlerPoll::Returned(out) => return TickEnd::Returned(out),
            HandlerPoll::Violation(v) => return TickEnd::Violation(v),
            HandlerPoll::Pending { discovered: 0, steps_seen } => {
                let checked = ctx.inner.lock().guard().check_suspension(steps_seen, 0);
                if let Err(v) = checked {
                    return TickEnd::Violation(v);
                }
                wait_for_wake().await;
            }
            HandlerPoll::Pending { discovered, .. } => {
                if discovered == last_discovered || rounds_left == 0 {
                    return TickEnd::Suspended;
                }
                last_discovered = discovered;
                rounds_left -= 1;
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Return `Pending` once and rely on the waker the handler registered.
async fn wait_for_wake() {
    let mut yielded = false;
    poll_fn(|_| {
        if yielded {
            Poll::Ready(())
        } else {
            yielded = true;
            Poll::Pending
        }
    })
    .await
}

/// Drive a step callback, stopping early if it trips the guard. Steps polled
/// by the callback itself see `id` as their enclosing step; steps polled by
/// other tasks do not.
async fn run_callback(
    ctx: &StepContext,
    id: StepId,
    callback: crate::context::StepCallback,
) -> Result<Result<Value, StepError>, EngineError> {
    let mut fut = Box::pin(ctx.in_step(id, AssertUnwindSafe(callback()).catch_unwind()));
    poll_fn(|cx| {
        ctx.inner.lock().set_tick_waker(cx.waker());
        let polled = fut.poll_unpin(cx);
        if let Some(v) = ctx.inner.lock().take_violation() {
            return Poll::Ready(Err(EngineError::Determinism(v)));
        }
        match polled {
            Poll::Ready(Ok(result)) => Poll::Ready(Ok(result)),
            Poll::Ready(Err(panic)) => Poll::Ready(Ok(Err(StepError::from_panic(panic)))),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}
