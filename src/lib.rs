//! Replay-driven durable functions.
//!
//! A function handler is re-executed from the top on every invocation
//! ("pass"). Steps whose results the orchestrator already holds resolve
//! from memoized state; the first steps that have not run yet are either
//! executed inline or reported back so the orchestrator can schedule them.
//! The crate provides:
//!
//! - Step identity: deterministic keys from name and call occurrence
//! - A `StepContext` whose step calls return composable `StepFuture`s
//! - A tick scheduler (`runtime::replay`) with a determinism guard
//! - Wire payloads (`protocol`), error serialization, middleware hooks
//! - A `Client` that routes invocations, plus an adapter contract and an
//!   in-process `Executor` standing in for the orchestrator
//!
//! ```no_run
//! use rust_dfn::{Client, FunctionRegistry, InvocationPayload, StepError};
//! use serde_json::json;
//!
//! # async fn demo() {
//! let registry = FunctionRegistry::builder()
//!     .register("greet", |ctx, input| async move {
//!         let name: String = input.event_data()?;
//!         let greeting: String = ctx
//!             .run("build-greeting", move || async move { Ok::<_, StepError>(format!("hello {name}")) })
//!             .await?;
//!         Ok(json!(greeting))
//!     })
//!     .build();
//! let client = Client::builder().registry(registry).build();
//! let outcome = client
//!     .execute("greet", InvocationPayload::new("run-1", json!({ "data": "ada" })))
//!     .await;
//! println!("{}", outcome.label());
//! # }
//! ```

pub mod adapters;
pub mod config;
pub mod context;
pub mod error;
pub mod futures;
pub mod guard;
pub mod identity;
pub mod logging;
pub mod memo;
pub mod middleware;
pub mod protocol;
pub mod runtime;

pub use adapters::{AdapterRequest, AdapterResponse, FrameworkAdapter};
pub use config::EngineConfig;
pub use context::{InvokeOptions, PassPhase, RunInfo, StepContext, WaitForEventOptions};
pub use error::{EngineError, ErrorKind, ErrorRegistry, SerializedError, StepError};
pub use futures::StepFuture;
pub use guard::{Violation, ViolationCode};
pub use identity::{StepId, StepKind};
pub use logging::{LogLevel, StepLogger};
pub use memo::{MemoStore, MemoizedRecord, StepOutcome};
pub use middleware::{Middleware, MiddlewareStack, OutputTarget, RunHooks, TransformInput, TransformOutput};
pub use protocol::{ExecutionOutcome, InvocationPayload, ResponsePayload, StepReport, build_response};
pub use runtime::{
    Client, ClientBuilder, EventSender, Executor, FnFunction, FunctionHandler, FunctionInput, FunctionRegistry,
    FunctionRegistryBuilder,
};
