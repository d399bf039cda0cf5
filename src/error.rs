//! Error model shared by handlers, step callbacks and the engine.
//!
//! `StepError` is what user code sees and returns. It travels to the
//! orchestrator as a `SerializedError` and comes back on the next pass as a
//! memoized failure, where the `ErrorRegistry` rebuilds recognized kinds.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::guard::Violation;

/// Marker carried by every serialized error so the orchestrator can tell an
/// error payload apart from ordinary step data.
pub const SERIALIZED_ERROR_MARKER: &str = "serialized-error";

pub const GENERIC_ERROR_NAME: &str = "Error";
pub const NON_RETRIABLE_ERROR_NAME: &str = "NonRetriableError";
pub const STEP_ERROR_NAME: &str = "StepError";
pub const DETERMINISM_ERROR_NAME: &str = "DeterminismError";

/// Retry semantics attached to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorKind {
    #[default]
    Generic,
    /// Tells the orchestrator to stop retrying the step or run.
    NonRetriable,
}

/// Error raised by handler code or a step callback.
#[derive(Debug, Clone, PartialEq)]
pub struct StepError {
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
    pub cause: Option<Box<StepError>>,
    /// Stable machine-readable code, set for engine-originated failures.
    pub code: Option<String>,
    pub kind: ErrorKind,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: GENERIC_ERROR_NAME.to_string(),
            message: message.into(),
            stack: None,
            cause: None,
            code: None,
            kind: ErrorKind::Generic,
        }
    }

    /// The non-retriable signal: however it is raised, retries stop.
    pub fn non_retriable(message: impl Into<String>) -> Self {
        Self {
            name: NON_RETRIABLE_ERROR_NAME.to_string(),
            kind: ErrorKind::NonRetriable,
            ..Self::new(message)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_cause(mut self, cause: StepError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_non_retriable(&self) -> bool {
        self.kind == ErrorKind::NonRetriable
    }

    /// Convert any std error, walking its `source()` chain into `cause`.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut out = StepError::new(err.to_string());
        if let Some(src) = err.source() {
            out.cause = Some(Box::new(StepError::from_error(src)));
        }
        out
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        StepError::new(message).with_name("Panic")
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: [{}] {}", self.name, code, self.message),
            None => write!(f, "{}: {}", self.name, self.message),
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        StepError::new(message)
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        StepError::new(message)
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::from_error(&err)
    }
}

/// Wire form of an error: `{ name, message, stack, cause?, code?, marker }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    pub name: String,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedError>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default = "default_marker")]
    pub marker: String,
}

fn default_marker() -> String {
    SERIALIZED_ERROR_MARKER.to_string()
}

impl From<&StepError> for SerializedError {
    fn from(err: &StepError) -> Self {
        SerializedError {
            name: err.name.clone(),
            message: err.message.clone(),
            stack: err.stack.clone(),
            cause: err.cause.as_deref().map(|c| Box::new(SerializedError::from(c))),
            code: err.code.clone(),
            marker: default_marker(),
        }
    }
}

/// Serialize an error to JSON without ever failing.
///
/// Falls back to a generic wrapper with a synthetic message, then to a fixed
/// "could not serialize" marker.
pub fn serialize_error(err: &StepError) -> Value {
    let wire = SerializedError::from(err);
    if let Ok(v) = serde_json::to_value(&wire) {
        return v;
    }
    let wrapped = SerializedError {
        name: GENERIC_ERROR_NAME.to_string(),
        message: format!("could not serialize error: {}", err.message),
        stack: None,
        cause: None,
        code: err.code.clone(),
        marker: default_marker(),
    };
    match serde_json::to_value(&wrapped) {
        Ok(v) => v,
        Err(_) => serde_json::json!({
            "name": GENERIC_ERROR_NAME,
            "message": "could not serialize",
            "stack": null,
            "marker": SERIALIZED_ERROR_MARKER,
        }),
    }
}

/// Decode a JSON value into a `SerializedError`, tolerating foreign shapes.
pub fn decode_serialized_error(value: &Value) -> SerializedError {
    match serde_json::from_value::<SerializedError>(value.clone()) {
        Ok(e) => e,
        Err(_) => SerializedError {
            name: GENERIC_ERROR_NAME.to_string(),
            message: match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            stack: None,
            cause: None,
            code: None,
            marker: default_marker(),
        },
    }
}

type ErrorCtor = Arc<dyn Fn(&SerializedError) -> StepError + Send + Sync>;

/// Named error constructors used to rebuild memoized failures.
///
/// Passed to the client at construction and threaded through each pass;
/// there is no process-wide registry.
#[derive(Clone)]
pub struct ErrorRegistry {
    ctors: HashMap<String, ErrorCtor>,
}

impl Default for ErrorRegistry {
    fn default() -> Self {
        let mut reg = ErrorRegistry { ctors: HashMap::new() };
        reg.register(GENERIC_ERROR_NAME, |e| rebuild(e, ErrorKind::Generic));
        reg.register(STEP_ERROR_NAME, |e| rebuild(e, ErrorKind::Generic));
        reg.register(NON_RETRIABLE_ERROR_NAME, |e| rebuild(e, ErrorKind::NonRetriable));
        reg.register(DETERMINISM_ERROR_NAME, |e| rebuild(e, ErrorKind::NonRetriable));
        reg
    }
}

fn rebuild(e: &SerializedError, kind: ErrorKind) -> StepError {
    StepError {
        name: e.name.clone(),
        message: e.message.clone(),
        stack: e.stack.clone(),
        cause: None,
        code: e.code.clone(),
        kind,
    }
}

impl ErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for errors named `name`.
    pub fn register<F>(&mut self, name: impl Into<String>, ctor: F) -> &mut Self
    where
        F: Fn(&SerializedError) -> StepError + Send + Sync + 'static,
    {
        self.ctors.insert(name.into(), Arc::new(ctor));
        self
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.ctors.contains_key(name)
    }

    pub fn serialize(&self, err: &StepError) -> Value {
        serialize_error(err)
    }

    /// Rebuild an error. Unknown names degrade to a generic error with the
    /// stack suppressed.
    pub fn deserialize(&self, wire: &SerializedError) -> StepError {
        let mut out = match self.ctors.get(&wire.name) {
            Some(ctor) => ctor(wire),
            None => StepError::new(wire.message.clone()),
        };
        if out.cause.is_none()
            && let Some(cause) = &wire.cause
        {
            out.cause = Some(Box::new(self.deserialize(cause)));
        }
        out
    }

    pub fn deserialize_value(&self, value: &Value) -> StepError {
        self.deserialize(&decode_serialized_error(value))
    }
}

impl fmt::Debug for ErrorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.ctors.keys().collect();
        names.sort();
        f.debug_struct("ErrorRegistry").field("names", &names).finish()
    }
}

/// Engine-level failures. These never belong to a single step.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("determinism violation [{}]: {}", .0.code.as_str(), .0.message)]
    Determinism(Violation),

    #[error("middleware {middleware} failed in {hook}: {source}")]
    Middleware {
        middleware: String,
        hook: &'static str,
        #[source]
        source: StepError,
    },

    #[error("function not registered: {0}")]
    FunctionNotFound(String),

    #[error("invalid invocation payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("pass cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    /// Stable code reported alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Determinism(v) => v.code.as_str(),
            EngineError::Middleware { .. } => "MIDDLEWARE_FAILED",
            EngineError::FunctionNotFound(_) => "FUNCTION_NOT_FOUND",
            EngineError::Payload(_) => "INVALID_PAYLOAD",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Config(_) => "INVALID_CONFIG",
        }
    }

    /// Only middleware failures are worth retrying; everything else is structural.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Middleware { .. })
    }

    /// Render as a user-facing error for the response payload.
    pub fn to_step_error(&self) -> StepError {
        let name = match self {
            EngineError::Determinism(_) => DETERMINISM_ERROR_NAME,
            _ if self.is_retriable() => GENERIC_ERROR_NAME,
            _ => NON_RETRIABLE_ERROR_NAME,
        };
        let message = match self {
            EngineError::Determinism(v) => v.message.clone(),
            other => other.to_string(),
        };
        let mut err = StepError::new(message).with_name(name).with_code(self.code());
        if !self.is_retriable() {
            err.kind = ErrorKind::NonRetriable;
        }
        if let EngineError::Middleware { source, .. } = self {
            err.cause = Some(Box::new(source.clone()));
        }
        err
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
