//! Workers backed by a single Ollama chat call per step.

use super::Worker;
use crate::llm::{parse_lenient, OllamaClient};
use crate::models::{Step, StepErrorKind, StepResult, StepType, Vuln};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

pub struct OllamaWorker {
    client: OllamaClient,
    step_type: StepType,
}

impl OllamaWorker {
    pub fn new(client: OllamaClient, step_type: StepType) -> Self {
        Self { client, step_type }
    }

    fn system_prompt(&self) -> &'static str {
        match self.step_type {
            StepType::AssetAnalysis => ASSET_ANALYSIS_PROMPT,
            StepType::VulnDiscovery => VULN_DISCOVERY_PROMPT,
            StepType::VulnDetail => VULN_DETAIL_PROMPT,
            StepType::Reporting => REPORTING_STEP_PROMPT,
        }
    }
}

/// Render the task block plus upstream outputs for the user message.
fn task_prompt(step: &Step, upstream: &[StepResult]) -> String {
    let mut prompt = format!(
        "Current task:\n- Title: {}\n- Target: {}\n- Description: {}\n",
        step.title, step.target, step.description
    );

    if !upstream.is_empty() {
        prompt.push_str("\nResults from earlier steps:\n");
        for result in upstream {
            prompt.push_str(&format!(
                "### {} ({})\n{}\n",
                result.step_id, result.status, result.output
            ));
        }
    }

    prompt
}

#[derive(Debug, Deserialize)]
struct DiscoveryPayload {
    #[serde(default)]
    cve_ids: Vec<String>,
    #[serde(default)]
    summary: String,
}

/// Vulnerabilities in model output, as a JSON array, a single object, or an
/// object wrapping them under `vulns`. Unparseable output yields nothing.
fn parse_vulns(text: &str) -> Vec<Vuln> {
    let Ok(value) = parse_lenient::<Value>(text) else {
        return Vec::new();
    };

    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("vulns") {
            Some(Value::Array(items)) => items,
            Some(other) => {
                map.insert("vulns".to_string(), other);
                vec![Value::Object(map)]
            }
            None => vec![Value::Object(map)],
        },
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}

/// Shape the model's reply into the output payload for each step type.
fn build_output(step_type: StepType, content: String) -> Value {
    match step_type {
        StepType::AssetAnalysis | StepType::Reporting => json!({ "summary": content }),
        StepType::VulnDiscovery => match parse_lenient::<DiscoveryPayload>(&content) {
            Ok(payload) => json!({ "cve_ids": payload.cve_ids, "summary": payload.summary }),
            Err(_) => json!({ "cve_ids": [], "summary": content }),
        },
        StepType::VulnDetail => {
            let vulns = parse_vulns(&content);
            json!({ "execution_res": content, "vulns": vulns })
        }
    }
}

#[async_trait]
impl Worker for OllamaWorker {
    async fn invoke(&self, step: &Step, upstream: &[StepResult]) -> StepResult {
        debug!(step_id = %step.id, step_type = %self.step_type, "Invoking Ollama worker");

        match self
            .client
            .chat(self.system_prompt(), &task_prompt(step, upstream))
            .await
        {
            Ok(content) => StepResult::succeeded(&step.id, build_output(self.step_type, content)),
            Err(e) => {
                warn!(step_id = %step.id, error = %e, "Worker call failed");
                StepResult::failed(&step.id, StepErrorKind::Worker, e.to_string())
            }
        }
    }
}

const ASSET_ANALYSIS_PROMPT: &str = r#"You are a security analyst inventorying an asset.
Identify the operating system, exposed services with exact versions, and
third-party dependencies of the target. Be concrete; list versions exactly as
observed. Do not speculate about vulnerabilities yet."#;

const VULN_DISCOVERY_PROMPT: &str = r#"You are a vulnerability researcher.
Given the target and the asset information from earlier steps, find known CVEs
that affect the listed software versions.
Respond with JSON only: {"cve_ids": ["CVE-YYYY-NNNN", ...], "summary": "..."}"#;

const VULN_DETAIL_PROMPT: &str = r#"You are a vulnerability analyst.
Gather detailed information for the target vulnerabilities.
Respond with a JSON array, one object per vulnerability:
[{"id": "CVE-...", "description": "...", "published": "YYYY-MM-DD",
  "v2score": 7.5, "v31score": 9.8, "additional_info": "...",
  "impacts": [{"name": "...", "before_version": "...", "after_version": "..."}]}]"#;

const REPORTING_STEP_PROMPT: &str = r#"You are a security analyst.
Summarize the results of the earlier steps for the target: affected assets,
confirmed vulnerabilities ranked by severity, and what still needs checking."#;
