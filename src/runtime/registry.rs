use super::{FnFunction, FunctionHandler, FunctionInput};
use crate::context::StepContext;
use crate::error::StepError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Immutable map from function id to handler.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn FunctionHandler>>>,
}

impl FunctionRegistry {
    pub fn builder() -> FunctionRegistryBuilder {
        FunctionRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, function_id: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.inner.get(function_id).cloned()
    }

    pub fn contains(&self, function_id: &str) -> bool {
        self.inner.contains_key(function_id)
    }

    pub fn list_function_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

pub struct FunctionRegistryBuilder {
    map: HashMap<String, Arc<dyn FunctionHandler>>,
    errors: Vec<String>,
}

impl FunctionRegistryBuilder {
    pub fn register<F, Fut>(self, function_id: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepContext, FunctionInput) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        self.register_handler(function_id, Arc::new(FnFunction(f)))
    }

    /// Register a handler whose event data and return value are typed.
    /// The event's `data` field is decoded into `In`; a decode failure fails
    /// the run without retries.
    pub fn register_typed<In, Out, F, Fut>(self, function_id: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(StepContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, StepError>> + Send + 'static,
    {
        let wrapper = move |ctx: StepContext, input: FunctionInput| {
            let f_inner = f.clone();
            async move {
                let typed: In = input.event_data()?;
                let out = f_inner(ctx, typed).await?;
                Ok::<Value, StepError>(serde_json::to_value(&out)?)
            }
        };
        self.register(function_id, wrapper)
    }

    pub fn register_handler(mut self, function_id: impl Into<String>, handler: Arc<dyn FunctionHandler>) -> Self {
        let function_id = function_id.into();
        if self.map.contains_key(&function_id) {
            self.errors
                .push(format!("duplicate function registration: {function_id}"));
            return self;
        }
        debug!(function_id = %function_id, "function registered");
        self.map.insert(function_id, handler);
        self
    }

    /// Build, keeping the first registration of any duplicated id.
    pub fn build(self) -> FunctionRegistry {
        FunctionRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<FunctionRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}
