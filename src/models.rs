//! Data models for the analysis workflow.
//!
//! This module contains the core data structures shared by every component:
//! runs, plans, steps, step results, discovered vulnerabilities and the
//! normalized input context produced by the coordinator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Severity level of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Low severity - informational or hard to exploit
    Low,
    /// Medium severity - exploitable under specific conditions
    Medium,
    /// High severity - readily exploitable
    High,
    /// Critical severity - remote compromise, wormable, actively exploited
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "Low"),
            Severity::Medium => write!(f, "Medium"),
            Severity::High => write!(f, "High"),
            Severity::Critical => write!(f, "Critical"),
        }
    }
}

impl Severity {
    /// Returns an emoji representation of the severity.
    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Low => "🟢",
            Severity::Medium => "🟡",
            Severity::High => "🟠",
            Severity::Critical => "🔴",
        }
    }

    /// Parse a scanner severity label. Unknown labels yield `None`.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "low" | "info" | "informational" => Some(Severity::Low),
            "medium" | "moderate" => Some(Severity::Medium),
            "high" | "important" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// Map a CVSS base score onto the qualitative scale.
    pub fn from_cvss(score: f64) -> Self {
        if score >= 9.0 {
            Severity::Critical
        } else if score >= 7.0 {
            Severity::High
        } else if score >= 4.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Created,
    Coordinating,
    Planning,
    AwaitingFeedback,
    Dispatching,
    Reporting,
    Completed,
    Aborted,
}

impl RunStatus {
    /// Completed and Aborted runs are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Aborted)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStatus::Created => "created",
            RunStatus::Coordinating => "coordinating",
            RunStatus::Planning => "planning",
            RunStatus::AwaitingFeedback => "awaiting_feedback",
            RunStatus::Dispatching => "dispatching",
            RunStatus::Reporting => "reporting",
            RunStatus::Completed => "completed",
            RunStatus::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// The closed set of work a plan step can delegate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StepType {
    #[serde(alias = "asset_analysis")]
    AssetAnalysis,
    #[serde(alias = "vuln_discovery")]
    VulnDiscovery,
    #[serde(alias = "vuln_detail")]
    VulnDetail,
    #[serde(alias = "reporting")]
    Reporting,
}

impl StepType {
    pub const ALL: [StepType; 4] = [
        StepType::AssetAnalysis,
        StepType::VulnDiscovery,
        StepType::VulnDetail,
        StepType::Reporting,
    ];
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::AssetAnalysis => write!(f, "AssetAnalysis"),
            StepType::VulnDiscovery => write!(f, "VulnDiscovery"),
            StepType::VulnDetail => write!(f, "VulnDetail"),
            StepType::Reporting => write!(f, "Reporting"),
        }
    }
}

/// One unit of delegated work inside a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the owning plan.
    pub id: String,
    pub step_type: StepType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub target: String,
    /// Rank in the dependency DAG. Dependencies always sit on a lower stage.
    pub stage: u32,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// A failed critical step stops dispatch after the current stage barrier.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub critical: bool,
}

/// Output of one planner invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub reasoning: String,
    pub steps: Vec<Step>,
    pub has_enough_context: bool,
    pub finish_plan: bool,
    /// Question for the human reviewer when the planner cannot proceed alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<String>,
}

impl Plan {
    /// Whether the planner asked for human input.
    pub fn needs_clarification(&self) -> bool {
        self.clarification
            .as_deref()
            .is_some_and(|q| !q.trim().is_empty())
    }

    /// Look up a step by id.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }
}

/// Outcome class of one step execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Succeeded => write!(f, "succeeded"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Why a step did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The worker reported a failure.
    Worker,
    /// The worker did not return within the step timeout.
    Timeout,
    /// A dependency did not produce usable output; the worker was never invoked.
    DependencyFailed,
    /// The worker task panicked.
    Panicked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

/// Outcome of executing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    /// Worker-defined payload, shaped per step type.
    #[serde(default)]
    pub output: Value,
    /// Present iff `status` is not `Succeeded`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    /// Plan iteration the step was executed under.
    #[serde(default)]
    pub plan_iteration: u32,
    pub finished_at: DateTime<Utc>,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, output: Value) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output,
            error: None,
            plan_iteration: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn failed(step_id: impl Into<String>, kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: Value::Null,
            error: Some(StepError {
                kind,
                message: message.into(),
            }),
            plan_iteration: 0,
            finished_at: Utc::now(),
        }
    }

    /// A timed-out attempt, optionally carrying whatever partial output the
    /// worker managed to produce.
    pub fn timed_out(step_id: impl Into<String>, partial: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::TimedOut,
            output: partial.unwrap_or(Value::Null),
            error: Some(StepError {
                kind: StepErrorKind::Timeout,
                message: message.into(),
            }),
            plan_iteration: 0,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Succeeded
    }

    /// Whether a dependent step may run on top of this result.
    pub fn satisfies_dependency(&self, accept_partial_timeouts: bool) -> bool {
        match self.status {
            StepStatus::Succeeded => true,
            StepStatus::TimedOut => accept_partial_timeouts && !self.output.is_null(),
            StepStatus::Failed => false,
        }
    }
}

/// Software affected by a vulnerability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactedSoftware {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_version: Option<String>,
}

/// A vulnerability surfaced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vuln {
    /// CVE or vendor identifier.
    pub id: String,
    pub description: String,
    #[serde(default)]
    pub published: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v2score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v31score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_info: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub impacts: Vec<ImpactedSoftware>,
}

impl Vuln {
    /// Best available CVSS score, preferring v3.1.
    pub fn score(&self) -> Option<f64> {
        self.v31score.or(self.v2score)
    }

    /// Severity derived from the score; unscored entries count as Medium.
    pub fn severity(&self) -> Severity {
        self.score().map(Severity::from_cvss).unwrap_or(Severity::Medium)
    }
}

/// What the user is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    AssetCheck,
    CveCheck,
    BroadScan,
    ScannerReport,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::AssetCheck => write!(f, "asset check"),
            Intent::CveCheck => write!(f, "CVE check"),
            Intent::BroadScan => write!(f, "broad scan"),
            Intent::ScannerReport => write!(f, "scanner report ingestion"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Ip,
    Domain,
    Repository,
    Cve,
}

/// An explicit target named in the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    pub kind: TargetKind,
    pub value: String,
}

impl Target {
    pub fn new(kind: TargetKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

/// One validated record from a structured scanner report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerRecord {
    pub id: String,
    pub severity: Severity,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Coordinator output: intent plus explicit targets, no analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedContext {
    pub intent: Intent,
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub records: Vec<ScannerRecord>,
}

impl NormalizedContext {
    /// Target values of the given kind, in input order.
    pub fn targets_of(&self, kind: TargetKind) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.value.as_str())
            .collect()
    }
}

/// Human reply supplied when resuming a suspended run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    /// Approves the pending plan when the run awaits plan review.
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Feedback {
    pub fn comment(text: impl Into<String>) -> Self {
        Self {
            approved: false,
            comment: Some(text.into()),
        }
    }

    pub fn approve() -> Self {
        Self {
            approved: true,
            comment: None,
        }
    }
}

/// Why a run is suspended in `AwaitingFeedback`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AwaitingReason {
    Clarification { question: String },
    PlanReview,
}

/// One analysis session. Mutated only by the run controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    pub status: RunStatus,
    pub user_input: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<NormalizedContext>,
    pub plan_iterations: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_plan: Option<Plan>,
    /// Superseded plans, oldest first.
    #[serde(default)]
    pub plan_history: Vec<Plan>,
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
    /// Append-only during a run.
    #[serde(default)]
    pub discovered_vulnerabilities: Vec<Vuln>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_report: Option<String>,
    #[serde(default)]
    pub clarification_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub awaiting: Option<AwaitingReason>,
    /// Feedback text to inject into the next planner call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(run_id: impl Into<String>, user_input: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            status: RunStatus::Created,
            user_input: user_input.into(),
            context: None,
            plan_iterations: 0,
            current_plan: None,
            plan_history: Vec::new(),
            step_results: HashMap::new(),
            discovered_vulnerabilities: Vec::new(),
            final_report: None,
            clarification_rounds: 0,
            awaiting: None,
            pending_feedback: None,
            abort_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the current plan, moving the previous one into history.
    pub fn adopt_plan(&mut self, plan: Plan) {
        if let Some(previous) = self.current_plan.replace(plan) {
            self.plan_history.push(previous);
        }
    }

    /// Every plan this run has produced, oldest first.
    pub fn all_plans(&self) -> Vec<&Plan> {
        self.plan_history
            .iter()
            .chain(self.current_plan.iter())
            .collect()
    }

    /// Result of `step_id` if it was produced under the current plan iteration.
    pub fn current_result(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results
            .get(step_id)
            .filter(|r| r.plan_iteration == self.plan_iterations)
    }

    /// Steps of the current plan that have no result for this iteration yet.
    pub fn undispatched_steps(&self) -> Vec<&Step> {
        match &self.current_plan {
            Some(plan) => plan
                .steps
                .iter()
                .filter(|s| self.current_result(&s.id).is_none())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Append vulnerabilities not yet recorded. Returns how many were new.
    pub fn record_vulns(&mut self, vulns: impl IntoIterator<Item = Vuln>) -> usize {
        let mut added = 0;
        for vuln in vulns {
            if self.discovered_vulnerabilities.iter().any(|v| v.id == vuln.id) {
                continue;
            }
            self.discovered_vulnerabilities.push(vuln);
            added += 1;
        }
        added
    }
}
