//! Framework adapter contract.
//!
//! Adapters translate a host framework's request into an `AdapterRequest`,
//! hand it to `Client::serve` and translate the `AdapterResponse` back. The
//! engine itself never touches a transport.
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;

use crate::error::{EngineError, serialize_error};
use crate::protocol::{InvocationPayload, ResponsePayload};
use crate::runtime::Client;

/// Query parameter naming the function to run.
pub const FUNCTION_ID_PARAM: &str = "fnId";
/// Response header telling the orchestrator not to retry.
pub const NO_RETRY_HEADER: &str = "x-no-retry";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterRequest {
    pub method: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub query: HashMap<String, String>,
}

impl AdapterRequest {
    /// POST to `fnId` carrying `payload` as JSON.
    pub fn post(function_id: impl Into<String>, payload: &InvocationPayload) -> Result<Self, EngineError> {
        let mut query = HashMap::new();
        query.insert(FUNCTION_ID_PARAM.to_string(), function_id.into());
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Ok(Self {
            method: "POST".to_string(),
            headers,
            body: serde_json::to_vec(payload)?,
            query,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl AdapterResponse {
    fn json(status: u16, body: &serde_json::Value) -> Self {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body: serde_json::to_vec(body).unwrap_or_default(),
        }
    }

    fn error(status: u16, err: &EngineError) -> Self {
        let mut resp = Self::json(status, &serialize_error(&err.to_step_error()));
        if !err.is_retriable() {
            resp.headers.insert(NO_RETRY_HEADER.to_string(), "true".to_string());
        }
        resp
    }

    fn from_payload(payload: &ResponsePayload) -> Self {
        let body = serde_json::to_value(payload).unwrap_or_else(|e| json!({ "status": "failed", "error": e.to_string() }));
        let mut resp = Self::json(payload.status_code(), &body);
        if !payload.is_retriable() {
            resp.headers.insert(NO_RETRY_HEADER.to_string(), "true".to_string());
        }
        resp
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Bridges a host framework to the engine.
#[async_trait]
pub trait FrameworkAdapter: Send + Sync {
    type Request: Send;
    type Response: Send;

    fn to_request(&self, req: Self::Request) -> AdapterRequest;
    fn from_response(&self, resp: AdapterResponse) -> Self::Response;

    async fn dispatch(&self, client: &Client, req: Self::Request) -> Self::Response {
        let resp = client.serve(self.to_request(req)).await;
        self.from_response(resp)
    }
}

impl Client {
    /// Route an adapter request to the function named by `fnId`.
    pub async fn serve(&self, req: AdapterRequest) -> AdapterResponse {
        if !req.method.eq_ignore_ascii_case("POST") {
            let mut resp = AdapterResponse::json(405, &json!({ "error": format!("method {} not allowed", req.method) }));
            resp.headers.insert("allow".to_string(), "POST".to_string());
            return resp;
        }
        let Some(function_id) = req.query.get(FUNCTION_ID_PARAM) else {
            return AdapterResponse::json(400, &json!({ "error": format!("missing {FUNCTION_ID_PARAM} query parameter") }));
        };
        if !self.registry().contains(function_id) {
            return AdapterResponse::error(404, &EngineError::FunctionNotFound(function_id.clone()));
        }
        let payload = match InvocationPayload::from_slice(&req.body) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(function_id = %function_id, error = %e, "rejecting malformed invocation");
                return AdapterResponse::error(400, &e);
            }
        };
        let response = self.handle(function_id, payload).await;
        AdapterResponse::from_payload(&response)
    }
}
