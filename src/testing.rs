//! Scripted collaborators for driving the workflow in tests.

use crate::models::{Plan, Run, Step, StepErrorKind, StepResult, StepType};
use crate::planner::{PlanBackend, PlanRequest};
use crate::report::Reporter;
use crate::workers::Worker;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

pub fn step(id: &str, step_type: StepType, stage: u32, deps: &[&str]) -> Step {
    Step {
        id: id.to_string(),
        step_type,
        title: id.to_string(),
        description: String::new(),
        target: "10.0.0.5".to_string(),
        stage,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        critical: false,
    }
}

pub fn plan_of(steps: Vec<Step>) -> Plan {
    Plan {
        reasoning: String::new(),
        steps,
        has_enough_context: false,
        finish_plan: false,
        clarification: None,
    }
}

/// Serialized plan reply, as a model would send it.
pub fn plan_reply(plan: &Plan) -> String {
    serde_json::to_string(plan).unwrap()
}

/// Plan backend replaying canned replies in order.
#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<PlanRequest>>,
}

impl ScriptedBackend {
    pub fn new(replies: impl IntoIterator<Item = String>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<PlanRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PlanBackend for ScriptedBackend {
    async fn propose(&self, request: &PlanRequest) -> anyhow::Result<String> {
        self.requests.lock().push(request.clone());
        self.replies
            .lock()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted reply left"))
    }
}

/// Succeeds after sleeping for a fixed delay.
pub struct SlowWorker {
    delay: Duration,
}

impl SlowWorker {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Worker for SlowWorker {
    async fn invoke(&self, step: &Step, _upstream: &[StepResult]) -> StepResult {
        tokio::time::sleep(self.delay).await;
        StepResult::succeeded(&step.id, json!({ "summary": format!("{} done", step.id) }))
    }
}

pub struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn invoke(&self, step: &Step, _upstream: &[StepResult]) -> StepResult {
        StepResult::failed(&step.id, StepErrorKind::Worker, "scanner unreachable")
    }
}

pub struct PanickingWorker;

#[async_trait]
impl Worker for PanickingWorker {
    async fn invoke(&self, step: &Step, _upstream: &[StepResult]) -> StepResult {
        panic!("worker for {} blew up", step.id);
    }
}

/// Succeeds immediately, recording each call and the upstream it saw.
#[derive(Default)]
pub struct CountingWorker {
    calls: Mutex<HashMap<String, usize>>,
    upstream: Mutex<HashMap<String, Vec<String>>>,
    outputs: Mutex<HashMap<String, Value>>,
}

impl CountingWorker {
    /// Return `output` whenever `step_id` runs.
    pub fn with_output(self, step_id: &str, output: Value) -> Self {
        self.outputs.lock().insert(step_id.to_string(), output);
        self
    }

    pub fn calls_for(&self, step_id: &str) -> usize {
        self.calls.lock().get(step_id).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn upstream_of(&self, step_id: &str) -> Vec<String> {
        self.upstream.lock().get(step_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Worker for CountingWorker {
    async fn invoke(&self, step: &Step, upstream: &[StepResult]) -> StepResult {
        *self.calls.lock().entry(step.id.clone()).or_default() += 1;
        self.upstream.lock().insert(
            step.id.clone(),
            upstream.iter().map(|r| r.step_id.clone()).collect(),
        );

        let output = self
            .outputs
            .lock()
            .get(&step.id)
            .cloned()
            .unwrap_or_else(|| json!({ "summary": format!("{} done", step.id) }));
        StepResult::succeeded(&step.id, output)
    }
}

/// Reporter that remembers every run it was handed.
#[derive(Default)]
pub struct RecordingReporter {
    seen: Mutex<Vec<Run>>,
}

impl RecordingReporter {
    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn last(&self) -> Option<Run> {
        self.seen.lock().last().cloned()
    }
}

#[async_trait]
impl Reporter for RecordingReporter {
    async fn report(&self, run: &Run) -> anyhow::Result<String> {
        self.seen.lock().push(run.clone());
        Ok(format!("report for {}", run.run_id))
    }
}
