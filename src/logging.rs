//! Replay-aware logging.
//!
//! Handler code re-runs from the top on every pass, so naive logging repeats
//! every message once per replay. `StepLogger` drops messages emitted while
//! the handler is still catching up on memoized steps, buffers the rest, and
//! the scheduler flushes the buffer through `tracing` when the pass ends.
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::context::StepContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Logger handed to handler code via `StepContext::logger`.
#[derive(Clone)]
pub struct StepLogger {
    ctx: StepContext,
}

impl StepLogger {
    pub(crate) fn new(ctx: StepContext) -> Self {
        Self { ctx }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.ctx.push_log(level, message.into());
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(LogLevel::Debug, message);
    }
    pub fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }
    pub fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message);
    }
    pub fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }
}

/// Emit buffered handler logs for one pass.
pub(crate) fn flush(run_id: &str, function_id: &str, logs: Vec<(LogLevel, String)>) {
    for (level, msg) in logs {
        match level {
            LogLevel::Error => tracing::error!(run_id, function_id, log = %msg, "handler log"),
            LogLevel::Warn => tracing::warn!(run_id, function_id, log = %msg, "handler log"),
            LogLevel::Debug => tracing::debug!(run_id, function_id, log = %msg, "handler log"),
            LogLevel::Info => tracing::info!(run_id, function_id, log = %msg, "handler log"),
        }
    }
}

/// Install a `fmt` subscriber filtered by `RUST_LOG` (defaulting to `info`).
/// Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_err()
    {
        tracing::debug!("global tracing subscriber already installed");
    }
}
