use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::StepContext;
use crate::error::{EngineError, ErrorRegistry, StepError};
use crate::middleware::{Middleware, MiddlewareStack};
use crate::protocol::{ExecutionOutcome, InvocationPayload, ResponsePayload, build_response};

pub mod executor;
pub mod registry;
pub mod replay;

pub use executor::{DriveResult, Executor};
pub use registry::{FunctionRegistry, FunctionRegistryBuilder};
pub use replay::{DefaultReplayEngine, PassRequest, PassResult, ReplayEngine};

/// Input handed to a handler on every pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionInput {
    /// The triggering event.
    pub event: Value,
    /// All events of a batch; `[event]` when not batched.
    pub events: Vec<Value>,
    pub run_id: String,
    pub attempt: u32,
}

impl FunctionInput {
    /// Decode the triggering event's `data` field.
    pub fn event_data<T: DeserializeOwned>(&self) -> Result<T, StepError> {
        let data = self.event.get("data").cloned().unwrap_or(Value::Null);
        serde_json::from_value(data).map_err(|e| StepError::non_retriable(format!("could not decode event data: {e}")))
    }
}

/// Trait implemented by function handlers that a client can run.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn invoke(&self, ctx: StepContext, input: FunctionInput) -> Result<Value, StepError>;
}

/// Function wrapper that implements `FunctionHandler`.
pub struct FnFunction<F, Fut>(pub F)
where
    F: Fn(StepContext, FunctionInput) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static;

#[async_trait]
impl<F, Fut> FunctionHandler for FnFunction<F, Fut>
where
    F: Fn(StepContext, FunctionInput) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
{
    async fn invoke(&self, ctx: StepContext, input: FunctionInput) -> Result<Value, StepError> {
        (self.0)(ctx, input).await
    }
}

/// Delivers events emitted by `send_event` steps; returns one id per event.
#[async_trait]
pub trait EventSender: Send + Sync {
    async fn send(&self, events: Vec<Value>) -> Result<Vec<String>, StepError>;
}

struct ClientInner {
    config: Arc<EngineConfig>,
    registry: FunctionRegistry,
    middleware: MiddlewareStack,
    errors: Arc<ErrorRegistry>,
    event_sender: Option<Arc<dyn EventSender>>,
    engine: Arc<dyn ReplayEngine>,
}

/// Entry point for running passes of registered functions.
///
/// Cheap to clone. Every collaborator (registry, middleware, error
/// constructors, event sender) is fixed at construction.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.inner.registry
    }

    pub fn errors(&self) -> &ErrorRegistry {
        &self.inner.errors
    }

    /// Run one pass and return its outcome.
    pub async fn execute(&self, function_id: &str, payload: InvocationPayload) -> ExecutionOutcome {
        self.run_pass(function_id, payload, CancellationToken::new())
            .await
            .outcome
    }

    /// Run one pass that aborts when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        function_id: &str,
        payload: InvocationPayload,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        self.run_pass(function_id, payload, cancel).await.outcome
    }

    /// Run one pass and return the wire response.
    pub async fn handle(&self, function_id: &str, payload: InvocationPayload) -> ResponsePayload {
        self.run_pass(function_id, payload, CancellationToken::new())
            .await
            .response
    }

    pub async fn run_pass(&self, function_id: &str, payload: InvocationPayload, cancel: CancellationToken) -> PassResult {
        let Some(handler) = self.inner.registry.get(function_id) else {
            let err = EngineError::FunctionNotFound(function_id.to_string());
            warn!(function_id, "invocation for unknown function");
            let outcome = ExecutionOutcome::from_engine_error(&err);
            let response = build_response(&outcome, &[]);
            return PassResult { outcome, response };
        };
        debug!(function_id, run_id = %payload.run_id, steps = payload.steps.len(), "starting pass");
        let request = PassRequest {
            function_id: function_id.to_string(),
            handler,
            payload,
            config: self.inner.config.clone(),
            errors: self.inner.errors.clone(),
            middleware: self.inner.middleware.clone(),
            event_sender: self.inner.event_sender.clone(),
            cancel,
        };
        self.inner.engine.run_pass(request).await
    }
}

#[derive(Default)]
pub struct ClientBuilder {
    config: Option<EngineConfig>,
    registry: FunctionRegistry,
    middleware: MiddlewareStack,
    errors: Option<ErrorRegistry>,
    event_sender: Option<Arc<dyn EventSender>>,
    engine: Option<Arc<dyn ReplayEngine>>,
}

impl ClientBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Append a middleware; hooks run in the order middleware is added.
    pub fn middleware(mut self, m: Arc<dyn Middleware>) -> Self {
        self.middleware.push(m);
        self
    }

    pub fn errors(mut self, errors: ErrorRegistry) -> Self {
        self.errors = Some(errors);
        self
    }

    pub fn event_sender(mut self, sender: Arc<dyn EventSender>) -> Self {
        self.event_sender = Some(sender);
        self
    }

    pub fn engine(mut self, engine: Arc<dyn ReplayEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn build(self) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                config: Arc::new(self.config.unwrap_or_default()),
                registry: self.registry,
                middleware: self.middleware,
                errors: Arc::new(self.errors.unwrap_or_default()),
                event_sender: self.event_sender,
                engine: self.engine.unwrap_or_else(|| Arc::new(DefaultReplayEngine::new())),
            }),
        }
    }
}
