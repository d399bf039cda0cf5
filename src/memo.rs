//! Memoization store hydrated from the orchestrator's completed steps.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

use crate::error::{SerializedError, decode_serialized_error};

/// One completed step as supplied by the orchestrator. The record's position
/// in the payload's list is its position in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoizedRecord {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl MemoizedRecord {
    pub fn success(key: impl Into<String>, data: Value) -> Self {
        Self {
            key: key.into(),
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(key: impl Into<String>, error: Value) -> Self {
        Self {
            key: key.into(),
            data: None,
            error: Some(error),
        }
    }

    /// A record with neither data nor error is a successful `null` (e.g. a
    /// finished sleep).
    pub fn outcome(&self) -> StepOutcome {
        match &self.error {
            Some(e) => StepOutcome::Failure(decode_serialized_error(e)),
            None => StepOutcome::Success(self.data.clone().unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success(Value),
    Failure(SerializedError),
}

/// Read-only view over memoized records for one pass.
#[derive(Debug, Default)]
pub struct MemoStore {
    records: HashMap<String, StepOutcome>,
    order: Vec<String>,
    consumed: HashSet<String>,
}

impl MemoStore {
    pub fn new(records: Vec<MemoizedRecord>) -> Self {
        let mut store = MemoStore::default();
        for rec in records {
            let outcome = rec.outcome();
            if store.records.insert(rec.key.clone(), outcome).is_some() {
                tracing::warn!(key = %rec.key, "duplicate memoized record; keeping the later one");
                store.order.retain(|k| k != &rec.key);
            }
            store.order.push(rec.key);
        }
        store
    }

    pub fn lookup(&self, key: &str) -> Option<&StepOutcome> {
        self.records.get(key)
    }

    /// Lookup that also marks the record as re-encountered by handler code.
    pub fn consume(&mut self, key: &str) -> Option<StepOutcome> {
        let outcome = self.records.get(key)?.clone();
        self.consumed.insert(key.to_string());
        Some(outcome)
    }

    pub fn completion_order(&self) -> &[String] {
        &self.order
    }

    pub fn all_consumed(&self) -> bool {
        self.consumed.len() == self.records.len()
    }

    /// Keys never reached by the handler in this pass, in completion order.
    pub fn unconsumed(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|k| !self.consumed.contains(*k))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
