//! The future returned by every step call.
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::context::{StepCallback, StepContext, StepPoll};
use crate::error::StepError;
use crate::identity::{StepId, StepKind};
use crate::memo::StepOutcome;

/// A step call. Resolves immediately when the step is memoized; otherwise it
/// registers with the pass on first poll and stays pending for the rest of
/// the pass.
///
/// Compose with `futures::join!`/`select!` like any other future. Steps
/// polled together before the handler suspends are reported together.
#[must_use = "step futures do nothing unless awaited"]
pub struct StepFuture<T> {
    ctx: StepContext,
    id: StepId,
    opts: Option<Value>,
    callback: Option<StepCallback>,
    registered: bool,
    settled: bool,
    _out: PhantomData<fn() -> T>,
}

impl<T> StepFuture<T> {
    pub(crate) fn new(ctx: StepContext, id: StepId, opts: Option<Value>, callback: Option<StepCallback>) -> Self {
        Self {
            ctx,
            id,
            opts,
            callback,
            registered: false,
            settled: false,
            _out: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.id.key
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn kind(&self) -> StepKind {
        self.id.kind
    }
}

impl<T: DeserializeOwned> Future for StepFuture<T> {
    type Output = Result<T, StepError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.settled {
            panic!("step future for \"{}\" polled after completion", this.id.name);
        }
        let first_poll = !this.registered;
        this.registered = true;
        let executing = this.ctx.executing_step();
        let (polled, wake) = {
            let mut st = this.ctx.inner.lock();
            st.poll_step(executing.as_ref(), &this.id, &this.opts, &mut this.callback, first_poll)
        };
        if let Some(w) = wake {
            w.wake();
        }
        match polled {
            StepPoll::Resolved(StepOutcome::Success(v)) => {
                this.settled = true;
                Poll::Ready(serde_json::from_value::<T>(v).map_err(|e| {
                    StepError::non_retriable(format!(
                        "could not decode memoized output of step \"{}\": {e}",
                        this.id.name
                    ))
                }))
            }
            StepPoll::Resolved(StepOutcome::Failure(e)) => {
                this.settled = true;
                Poll::Ready(Err(this.ctx.errors().deserialize(&e)))
            }
            StepPoll::Discovered | StepPoll::Deferred => Poll::Pending,
        }
    }
}

impl<T> Drop for StepFuture<T> {
    fn drop(&mut self) {
        if self.registered && !self.settled {
            let forgotten = self.ctx.inner.lock().forget_discovered(&self.id.key);
            drop(forgotten);
        }
    }
}
