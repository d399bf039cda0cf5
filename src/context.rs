//! Per-pass state and the user-facing `StepContext`.
//!
//! `PassState` is the only mutable state of a pass: occurrence counters, the
//! memo store, the steps discovered in the current tick and the guard's
//! bookkeeping. Step futures consult it when polled; the scheduler reads it
//! between polls of the handler.
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::future::Future;
use std::sync::Arc;
use std::task::Waker;
use std::time::Duration;

use crate::error::{ErrorRegistry, StepError};
use crate::futures::StepFuture;
use crate::guard::{DeterminismGuard, Violation};
use crate::identity::{IdentityResolver, StepId, StepKind};
use crate::logging::{LogLevel, StepLogger};
use crate::memo::{MemoStore, StepOutcome};
use crate::runtime::EventSender;

/// Identity and retry budget of the run a pass belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub function_id: String,
    pub run_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub disable_immediate_execution: bool,
}

impl RunInfo {
    /// True when a failure on this attempt will not be retried.
    pub fn is_final_attempt(&self) -> bool {
        self.attempt.saturating_add(1) >= self.max_attempts
    }
}

/// Scheduler state machine of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassPhase {
    Initializing,
    Memoizing,
    Executing,
    Suspending,
    Completing,
    Failing,
}

tokio::task_local! {
    /// Step whose callback the current task is polling, tagged with its pass.
    static EXECUTING: (usize, StepId);
}

pub(crate) type StepCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, StepError>> + Send>;

/// A step reached in the current tick whose outcome is not memoized.
pub(crate) struct DiscoveredStep {
    pub id: StepId,
    pub opts: Option<Value>,
    pub callback: Option<StepCallback>,
}

/// What a step future learns when it consults the pass.
pub(crate) enum StepPoll {
    /// Memoized: hand back the stored outcome.
    Resolved(StepOutcome),
    /// New: recorded for the tick decision; the future stays pending.
    Discovered,
    /// Reached after the pass stopped accepting steps (or rejected by the
    /// guard); never reported and never resolved in this pass.
    Deferred,
}

pub(crate) struct PassState {
    pub phase: PassPhase,
    resolver: IdentityResolver,
    pub memo: MemoStore,
    guard: DeterminismGuard,
    pub discovered: Vec<DiscoveredStep>,
    pub steps_seen: usize,
    violation: Option<Violation>,
    tick_waker: Option<Waker>,
    logging_enabled: bool,
    log_buffer: Vec<(LogLevel, String)>,
    pub deferred: usize,
}

impl PassState {
    pub fn new(memo: MemoStore, guard: DeterminismGuard) -> Self {
        Self {
            phase: PassPhase::Initializing,
            resolver: IdentityResolver::new(),
            logging_enabled: memo.is_empty(),
            memo,
            guard,
            discovered: Vec::new(),
            steps_seen: 0,
            violation: None,
            tick_waker: None,
            log_buffer: Vec::new(),
            deferred: 0,
        }
    }

    pub fn transition(&mut self, to: PassPhase) {
        tracing::trace!(from = ?self.phase, to = ?to, "pass phase transition");
        self.phase = to;
    }

    pub fn set_tick_waker(&mut self, waker: &Waker) {
        match &self.tick_waker {
            Some(w) if w.will_wake(waker) => {}
            _ => self.tick_waker = Some(waker.clone()),
        }
    }

    pub fn take_violation(&mut self) -> Option<Violation> {
        self.violation.take()
    }

    pub fn guard(&self) -> &DeterminismGuard {
        &self.guard
    }

    fn record_violation(&mut self, v: Violation) -> Option<Waker> {
        if self.violation.is_none() {
            tracing::debug!(code = v.code.as_str(), "determinism violation recorded");
            self.violation = Some(v);
        }
        self.tick_waker.clone()
    }

    /// Resolve one poll of a step future. `executing` is the step whose
    /// callback encloses this poll, if any. Returns a waker to notify once
    /// the lock is released, when the scheduler must re-examine the tick.
    pub fn poll_step(
        &mut self,
        executing: Option<&StepId>,
        id: &StepId,
        opts: &Option<Value>,
        callback: &mut Option<StepCallback>,
        first_poll: bool,
    ) -> (StepPoll, Option<Waker>) {
        if let Err(v) = self.guard.check_step_call(executing, id) {
            let wake = self.record_violation(v);
            return (StepPoll::Deferred, wake);
        }
        if self.phase != PassPhase::Executing {
            if first_poll {
                self.deferred += 1;
                tracing::debug!(step = %id.name, key = %id.key, phase = ?self.phase, "step reached after suspension; deferred");
            }
            return (StepPoll::Deferred, None);
        }
        if first_poll {
            self.steps_seen += 1;
        }
        if let Some(outcome) = self.memo.consume(&id.key) {
            if self.memo.all_consumed() {
                self.logging_enabled = true;
            }
            return (StepPoll::Resolved(outcome), None);
        }
        self.logging_enabled = true;
        if !first_poll {
            return (StepPoll::Discovered, None);
        }
        tracing::debug!(step = %id.name, key = %id.key, kind = %id.kind, "new step discovered");
        self.discovered.push(DiscoveredStep {
            id: id.clone(),
            opts: opts.clone(),
            callback: callback.take(),
        });
        (StepPoll::Discovered, self.tick_waker.clone())
    }

    /// A discovered step's future was dropped before the tick ended. The
    /// removed entries are returned so callers drop them outside the lock.
    pub fn forget_discovered(&mut self, key: &str) -> Vec<DiscoveredStep> {
        if self.phase != PassPhase::Executing {
            return Vec::new();
        }
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.discovered)
            .into_iter()
            .partition(|d| d.id.key == key);
        self.discovered = kept;
        gone
    }

    pub fn push_log(&mut self, level: LogLevel, msg: String) {
        if self.logging_enabled {
            self.log_buffer.push((level, msg));
        }
    }

    pub fn take_logs(&mut self) -> Vec<(LogLevel, String)> {
        std::mem::take(&mut self.log_buffer)
    }

    fn next_id(&mut self, name: &str, kind: StepKind) -> StepId {
        self.resolver.next(name, kind)
    }
}

/// Read-only collaborators shared by every context clone of a pass.
pub(crate) struct PassShared {
    pub run: RunInfo,
    pub errors: Arc<ErrorRegistry>,
    pub event_sender: Option<Arc<dyn EventSender>>,
}

/// Options for `StepContext::wait_for_event`.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitForEventOptions {
    /// Name of the event to wait for.
    pub event: String,
    pub timeout: Duration,
    /// Optional match expression evaluated by the orchestrator.
    pub if_expr: Option<String>,
}

/// Options for `StepContext::invoke`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOptions {
    pub function_id: String,
    pub data: Value,
    pub timeout: Option<Duration>,
}

/// Handle passed to handler code for calling steps.
#[derive(Clone)]
pub struct StepContext {
    pub(crate) inner: Arc<Mutex<PassState>>,
    pub(crate) shared: Arc<PassShared>,
}

impl StepContext {
    pub(crate) fn new(state: PassState, shared: PassShared) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            shared: Arc::new(shared),
        }
    }

    pub fn run_info(&self) -> &RunInfo {
        &self.shared.run
    }

    pub(crate) fn errors(&self) -> &ErrorRegistry {
        &self.shared.errors
    }

    /// Logger that stays quiet while memoized steps are being replayed.
    pub fn logger(&self) -> StepLogger {
        StepLogger::new(self.clone())
    }

    pub(crate) fn push_log(&self, level: LogLevel, msg: String) {
        self.inner.lock().push_log(level, msg);
    }

    fn pass_tag(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// The step of this pass whose callback is running on the current task.
    pub(crate) fn executing_step(&self) -> Option<StepId> {
        EXECUTING
            .try_with(|(pass, id)| (*pass == self.pass_tag()).then(|| id.clone()))
            .ok()
            .flatten()
    }

    /// Poll `fut` as the callback of step `id`.
    pub(crate) fn in_step<F: Future>(&self, id: StepId, fut: F) -> impl Future<Output = F::Output> {
        EXECUTING.scope((self.pass_tag(), id), fut)
    }

    fn step<T>(&self, name: &str, kind: StepKind, opts: Option<Value>, callback: Option<StepCallback>) -> StepFuture<T> {
        let id = self.inner.lock().next_id(name, kind);
        StepFuture::new(self.clone(), id, opts, callback)
    }

    /// Run a computation as a memoized step. `f` is only called when the
    /// scheduler decides to execute the step; on replay the stored result is
    /// returned instead.
    pub fn run<T, E, F, Fut>(&self, name: &str, f: F) -> StepFuture<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: Into<StepError> + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let callback: StepCallback = Box::new(move || {
            Box::pin(async move {
                let out = f().await.map_err(Into::into)?;
                serde_json::to_value(&out)
                    .map_err(|e| StepError::new(format!("could not serialize step output: {e}")))
            })
        });
        self.step(name, StepKind::Run, None, Some(callback))
    }

    /// Pause the run for `duration`. Fulfilled by the orchestrator.
    pub fn sleep(&self, name: &str, duration: Duration) -> StepFuture<()> {
        let opts = json!({ "durationMs": millis(duration) });
        self.step(name, StepKind::Sleep, Some(opts), None)
    }

    /// Pause the run until `until`. Fulfilled by the orchestrator.
    pub fn sleep_until(&self, name: &str, until: DateTime<Utc>) -> StepFuture<()> {
        let opts = json!({ "until": until.to_rfc3339_opts(SecondsFormat::Millis, true) });
        self.step(name, StepKind::Sleep, Some(opts), None)
    }

    /// Wait for an external event; resolves to `None` on timeout.
    pub fn wait_for_event<T>(&self, name: &str, opts: WaitForEventOptions) -> StepFuture<Option<T>>
    where
        T: DeserializeOwned,
    {
        let mut o = json!({
            "event": opts.event,
            "timeoutMs": millis(opts.timeout),
        });
        if let Some(expr) = opts.if_expr {
            o["if"] = Value::String(expr);
        }
        self.step(name, StepKind::WaitForEvent, Some(o), None)
    }

    /// Invoke another function and wait for its result.
    pub fn invoke<T>(&self, name: &str, opts: InvokeOptions) -> StepFuture<T>
    where
        T: DeserializeOwned,
    {
        let mut o = json!({
            "functionId": opts.function_id,
            "payload": { "data": opts.data },
        });
        if let Some(t) = opts.timeout {
            o["timeoutMs"] = json!(millis(t));
        }
        self.step(name, StepKind::Invoke, Some(o), None)
    }

    /// Emit events through the client's `EventSender`; resolves to the ids
    /// assigned to them.
    pub fn send_event(&self, name: &str, events: Vec<Value>) -> StepFuture<Vec<String>> {
        let sender = self.shared.event_sender.clone();
        let opts = json!({ "count": events.len() });
        let callback: StepCallback = Box::new(move || {
            Box::pin(async move {
                let sender =
                    sender.ok_or_else(|| StepError::non_retriable("no event sender configured on this client"))?;
                let ids = sender.send(events).await?;
                Ok(json!(ids))
            })
        });
        self.step(name, StepKind::SendEvent, Some(opts), Some(callback))
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
