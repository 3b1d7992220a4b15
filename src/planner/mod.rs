//! Plan generation.
//!
//! The planner asks a reasoning backend for a plan, validates the reply, and
//! enforces the plan-iteration ceiling. It never mutates the run; the
//! controller adopts the returned plan and bumps `plan_iterations`.

mod validate;

use validate::validate_plan;

use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::llm::{parse_lenient, OllamaClient};
use crate::models::{NormalizedContext, Plan, Run, StepType, TargetKind};
use async_trait::async_trait;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prompt pair handed to the reasoning backend.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanRequest {
    pub system: String,
    pub user: String,
}

/// Source of raw plan text.
#[async_trait]
pub trait PlanBackend: Send + Sync {
    async fn propose(&self, request: &PlanRequest) -> anyhow::Result<String>;
}

/// Plans through an Ollama chat model.
pub struct OllamaPlanBackend {
    client: OllamaClient,
}

impl OllamaPlanBackend {
    pub fn new(client: OllamaClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PlanBackend for OllamaPlanBackend {
    async fn propose(&self, request: &PlanRequest) -> anyhow::Result<String> {
        self.client.chat(&request.system, &request.user).await
    }
}

pub struct Planner {
    backend: Arc<dyn PlanBackend>,
    config: WorkflowConfig,
}

impl Planner {
    pub fn new(backend: Arc<dyn PlanBackend>, config: WorkflowConfig) -> Self {
        Self { backend, config }
    }

    /// Produce the next plan for `run`.
    ///
    /// Invalid replies are retried with the same prompt up to
    /// `max_planning_retries` times before giving up with
    /// [`WorkflowError::Planning`].
    pub async fn plan(
        &self,
        run: &Run,
        context: &NormalizedContext,
        feedback: Option<&str>,
    ) -> Result<Plan, WorkflowError> {
        let request = PlanRequest {
            system: system_prompt(self.config.max_step_num),
            user: user_prompt(run, context, feedback),
        };
        let attempts = self.config.max_planning_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            debug!(run_id = %run.run_id, attempt, "Requesting plan");

            let text = match self.backend.propose(&request).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(run_id = %run.run_id, attempt, error = %e, "Plan backend call failed");
                    last_error = e.to_string();
                    continue;
                }
            };

            let checked = parse_lenient::<Plan>(&text).and_then(|plan| {
                validate_plan(&plan, self.config.max_step_num)
                    .map(|_| plan)
                    .map_err(|defect| defect.to_string())
            });
            let plan = match checked {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(run_id = %run.run_id, attempt, error = %e, "Rejected invalid plan");
                    last_error = e;
                    continue;
                }
            };

            let plan = self.enforce_limits(run, plan);
            info!(
                run_id = %run.run_id,
                iteration = run.plan_iterations + 1,
                steps = plan.steps.len(),
                has_enough_context = plan.has_enough_context,
                finish_plan = plan.finish_plan,
                "Plan accepted"
            );
            return Ok(plan);
        }

        Err(WorkflowError::Planning {
            attempts,
            message: last_error,
        })
    }

    fn enforce_limits(&self, run: &Run, mut plan: Plan) -> Plan {
        if run.plan_iterations + 1 >= self.config.max_plan_iterations && !plan.finish_plan {
            info!(
                run_id = %run.run_id,
                max = self.config.max_plan_iterations,
                "Plan iteration ceiling reached, forcing finish_plan"
            );
            plan.finish_plan = true;
        }
        if !self.config.enable_clarification {
            plan.clarification = None;
        }
        plan
    }
}

fn system_prompt(max_steps: usize) -> String {
    let step_types = StepType::ALL
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" | ");

    format!(
        r#"You are the planner of a vulnerability analysis team.
Break the request into at most {max_steps} steps and delegate each one to a worker.

Step types:
- AssetAnalysis: inventory an asset (OS, services, versions, dependencies)
- VulnDiscovery: find known vulnerabilities affecting what was inventoried
- VulnDetail: collect CVSS scores, affected versions and references for given CVEs
- Reporting: summarize results of earlier steps

Rules:
- Steps on the same stage run concurrently and cannot see each other's results.
- Every id in depends_on must belong to a step on a strictly lower stage.
- Set has_enough_context to true only when the results so far fully answer the request.
- Set finish_plan to true when no further planning round will be needed.
- If the request is too ambiguous to plan, set clarification to a question for the user.

Respond with JSON only:
{{"reasoning": "...", "has_enough_context": false, "finish_plan": false,
  "clarification": null,
  "steps": [{{"id": "s1", "step_type": "{step_types}", "title": "...",
             "description": "...", "target": "...", "stage": 1, "depends_on": [],
             "critical": false}}]}}"#
    )
}

fn user_prompt(run: &Run, context: &NormalizedContext, feedback: Option<&str>) -> String {
    let mut prompt = String::new();

    let _ = writeln!(prompt, "Request: {}", run.user_input.trim());
    let _ = writeln!(prompt, "Intent: {}", context.intent);

    if !context.targets.is_empty() {
        prompt.push_str("\nTargets:\n");
        for kind in [TargetKind::Ip, TargetKind::Domain, TargetKind::Repository, TargetKind::Cve] {
            let values = context.targets_of(kind);
            if !values.is_empty() {
                let _ = writeln!(prompt, "- {:?}: {}", kind, values.join(", "));
            }
        }
    }

    if !context.records.is_empty() {
        prompt.push_str("\nScanner findings:\n");
        for record in &context.records {
            let _ = writeln!(
                prompt,
                "- {} [{}] on {}{}",
                record.id,
                record.severity,
                record.target,
                record.title.as_deref().map(|t| format!(": {t}")).unwrap_or_default()
            );
        }
    }

    if !run.step_results.is_empty() {
        prompt.push_str("\nResults of earlier steps:\n");
        let mut results: Vec<_> = run.step_results.values().collect();
        results.sort_by(|a, b| a.finished_at.cmp(&b.finished_at));
        for result in results {
            let detail = match &result.error {
                Some(error) => error.message.clone(),
                None => truncate(&result.output.to_string(), 1500),
            };
            let _ = writeln!(prompt, "- {} ({}): {}", result.step_id, result.status, detail);
        }
    }

    if !run.discovered_vulnerabilities.is_empty() {
        let ids: Vec<&str> = run
            .discovered_vulnerabilities
            .iter()
            .map(|v| v.id.as_str())
            .collect();
        let _ = writeln!(prompt, "\nVulnerabilities found so far: {}", ids.join(", "));
    }

    if let Some(feedback) = feedback.filter(|f| !f.trim().is_empty()) {
        let _ = writeln!(prompt, "\nFeedback from the user:\n{}", feedback.trim());
    }

    prompt
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{classify, RawInput};
    use crate::models::StepResult;
    use crate::testing::ScriptedBackend;
    use serde_json::json;

    fn config() -> WorkflowConfig {
        WorkflowConfig {
            max_plan_iterations: 3,
            max_planning_retries: 2,
            ..WorkflowConfig::default()
        }
    }

    fn context() -> NormalizedContext {
        classify(&RawInput::detect("assess 10.0.0.5 for known CVEs")).unwrap()
    }

    fn valid_plan() -> String {
        json!({
            "reasoning": "inventory first",
            "has_enough_context": false,
            "finish_plan": false,
            "steps": [
                {"id": "asset", "step_type": "AssetAnalysis", "title": "Inventory", "target": "10.0.0.5", "stage": 1},
                {"id": "cves", "step_type": "VulnDiscovery", "title": "Find CVEs", "target": "10.0.0.5", "stage": 2, "depends_on": ["asset"]}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_plan_parses_fenced_reply() {
        let backend = Arc::new(ScriptedBackend::new([format!("Here you go:\n```json\n{}\n```", valid_plan())]));
        let planner = Planner::new(backend.clone(), config());
        let run = Run::new("r1", "assess 10.0.0.5 for known CVEs");

        let plan = tokio_test::assert_ok!(planner.plan(&run, &context(), None).await);
        assert_eq!(plan.steps.len(), 2);
        assert!(!plan.finish_plan);
        assert_eq!(backend.calls(), 1);
        assert!(backend.requests()[0].user.contains("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_invalid_plan_retried_then_accepted() {
        let equal_stage = json!({
            "reasoning": "", "has_enough_context": false, "finish_plan": false,
            "steps": [
                {"id": "a", "step_type": "AssetAnalysis", "title": "a", "stage": 1},
                {"id": "b", "step_type": "VulnDiscovery", "title": "b", "stage": 1, "depends_on": ["a"]}
            ]
        })
        .to_string();
        let backend = Arc::new(ScriptedBackend::new([equal_stage, valid_plan()]));
        let planner = Planner::new(backend.clone(), config());
        let run = Run::new("r1", "x");

        tokio_test::assert_ok!(planner.plan(&run, &context(), None).await);
        assert_eq!(backend.calls(), 2);
        let requests = backend.requests();
        assert_eq!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn test_planning_error_after_retries() {
        let missing_type = json!({
            "reasoning": "", "has_enough_context": false, "finish_plan": false,
            "steps": [{"id": "a", "title": "a", "stage": 1}]
        })
        .to_string();
        let backend = Arc::new(ScriptedBackend::new(vec![missing_type; 3]));
        let planner = Planner::new(backend.clone(), config());

        let err = tokio_test::assert_err!(planner.plan(&Run::new("r1", "x"), &context(), None).await);
        assert!(matches!(err, WorkflowError::Planning { attempts: 3, .. }));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_iteration_ceiling_forces_finish() {
        let backend = Arc::new(ScriptedBackend::new([valid_plan()]));
        let planner = Planner::new(backend, config());
        let mut run = Run::new("r1", "x");
        run.plan_iterations = 2;

        let plan = planner.plan(&run, &context(), None).await.unwrap();
        assert!(plan.finish_plan);
    }

    #[tokio::test]
    async fn test_clarification_dropped_when_disabled() {
        let asking = json!({
            "reasoning": "", "has_enough_context": false, "finish_plan": false,
            "clarification": "Which environment?", "steps": []
        })
        .to_string();
        let backend = Arc::new(ScriptedBackend::new([asking]));
        let planner = Planner::new(
            backend,
            WorkflowConfig {
                enable_clarification: false,
                ..config()
            },
        );

        let plan = planner.plan(&Run::new("r1", "x"), &context(), None).await.unwrap();
        assert!(!plan.needs_clarification());
    }

    #[test]
    fn test_user_prompt_carries_feedback_and_results() {
        let mut run = Run::new("r1", "assess 10.0.0.5");
        run.step_results.insert(
            "asset".into(),
            StepResult::succeeded("asset", json!({"summary": "nginx 1.18.0"})),
        );

        let prompt = user_prompt(&run, &context(), Some("focus on the web server"));
        assert!(prompt.contains("nginx 1.18.0"));
        assert!(prompt.contains("focus on the web server"));
        assert!(prompt.contains("Ip: 10.0.0.5"));
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 2), "hé...");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
