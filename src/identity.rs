//! Step identity resolution.
//!
//! A step's key is a pure function of its literal name and how many times
//! that name has already been used in the current pass, so the same call
//! site yields the same key on every replay of a run.
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

/// Operation kind of a step call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepKind {
    /// Run a computation in-process.
    Run,
    /// Pause for a duration or until a point in time.
    Sleep,
    /// Wait for an external event.
    WaitForEvent,
    /// Invoke another function and wait for its result.
    Invoke,
    /// Emit events through the client's event sender.
    SendEvent,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Run => "run",
            StepKind::Sleep => "sleep",
            StepKind::WaitForEvent => "waitForEvent",
            StepKind::Invoke => "invoke",
            StepKind::SendEvent => "sendEvent",
        }
    }

    /// Kinds whose work the engine performs itself; the rest are fulfilled
    /// by the orchestrator.
    pub fn is_executable(&self) -> bool {
        matches!(self, StepKind::Run | StepKind::SendEvent)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved identity of one step call.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepId {
    pub key: String,
    pub name: String,
    pub kind: StepKind,
    /// Zero-based occurrence of `name` within the pass.
    pub index: u32,
}

/// Hash `name` (first occurrence) or `name:index` into a hex key.
pub fn resolve(name: &str, index: u32) -> String {
    let mut hasher = Sha256::new();
    if index == 0 {
        hasher.update(name.as_bytes());
    } else {
        hasher.update(format!("{name}:{index}").as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Per-pass occurrence counters.
#[derive(Debug, Default)]
pub struct IdentityResolver {
    seen: HashMap<String, u32>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next identity for `name`. The kind is carried along but
    /// does not participate in the key.
    pub fn next(&mut self, name: &str, kind: StepKind) -> StepId {
        let counter = self.seen.entry(name.to_string()).or_insert(0);
        let index = *counter;
        *counter += 1;
        if index > 0 {
            tracing::trace!(step = name, index, "step name reused; disambiguating by occurrence");
        }
        StepId {
            key: resolve(name, index),
            name: name.to_string(),
            kind,
            index,
        }
    }

    /// Forget all counters; called at the start of every pass.
    pub fn reset(&mut self) {
        self.seen.clear();
    }
}
