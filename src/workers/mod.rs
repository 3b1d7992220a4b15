//! Worker contract and the step-type lookup table.
//!
//! A worker performs the actual analysis for one [`StepType`]. Workers must be
//! safe to retry: the dispatcher may re-invoke a step after a crash, and it
//! abandons calls that exceed the step timeout.

mod ollama;

pub use ollama::OllamaWorker;

use crate::llm::OllamaClient;
use crate::models::{Step, StepResult, StepType, Vuln};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute `step`. `upstream` holds the results of the step's
    /// dependencies, in `depends_on` order.
    ///
    /// Failures are reported through the returned [`StepResult`], never by
    /// panicking.
    async fn invoke(&self, step: &Step, upstream: &[StepResult]) -> StepResult;
}

/// One worker per step type, selected by lookup.
#[derive(Clone, Default)]
pub struct WorkerTable {
    workers: HashMap<StepType, Arc<dyn Worker>>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `worker` for `step_type`, replacing any previous one.
    pub fn with(mut self, step_type: StepType, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(step_type, worker);
        self
    }

    /// Ollama-backed workers for every step type.
    pub fn ollama(client: OllamaClient) -> Self {
        StepType::ALL.into_iter().fold(Self::new(), |table, step_type| {
            table.with(step_type, Arc::new(OllamaWorker::new(client.clone(), step_type)))
        })
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn Worker>> {
        self.workers.get(&step_type).cloned()
    }

    /// Step types with no registered worker.
    pub fn missing(&self) -> Vec<StepType> {
        StepType::ALL
            .into_iter()
            .filter(|t| !self.workers.contains_key(t))
            .collect()
    }
}

/// Vulnerabilities carried in a worker output under `vulns`.
///
/// Entries that do not match the [`Vuln`] shape are skipped.
pub fn vulns_from_output(output: &Value) -> Vec<Vuln> {
    output
        .get("vulns")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}
