//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.vulngraph.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = ".vulngraph.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Model settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Workflow engine settings.
    #[serde(default)]
    pub workflow: WorkflowConfig,
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Where the final report of a completed run is written.
    #[serde(default = "default_output")]
    pub output: String,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,

    /// Directory holding run checkpoints.
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            output: default_output(),
            verbose: false,
            store_dir: default_store_dir(),
        }
    }
}

fn default_output() -> String {
    "vulngraph_report.md".to_string()
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".vulngraph")
}

/// LLM model settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Default model name.
    #[serde(default = "default_model")]
    pub name: String,

    /// Ollama API URL.
    #[serde(default = "default_ollama_url")]
    pub ollama_url: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Number of retries on transport failure.
    #[serde(default = "default_retries")]
    pub retries: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: default_model(),
            ollama_url: default_ollama_url(),
            temperature: default_temperature(),
            timeout_seconds: default_timeout(),
            retries: default_retries(),
        }
    }
}

fn default_model() -> String {
    "llama3.2:latest".to_string()
}

fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_timeout() -> u64 {
    300
}

fn default_retries() -> u32 {
    3
}

/// What to do when the plan-iteration ceiling is reached while the current
/// plan still has steps that never ran.
///
/// A plan the user rejected in review is never dispatched: rejecting it at
/// the ceiling goes straight to reporting under either policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedPlanPolicy {
    /// Run the remaining steps, then report.
    #[default]
    DispatchRemaining,
    /// Report right away with whatever results exist.
    ReportImmediately,
}

/// Workflow engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Hard ceiling on planner invocations per run.
    #[serde(default = "default_max_plan_iterations")]
    pub max_plan_iterations: u32,

    /// Maximum number of steps a single plan may contain.
    #[serde(default = "default_max_step_num")]
    pub max_step_num: usize,

    /// Extra planner attempts after an invalid plan.
    #[serde(default = "default_max_planning_retries")]
    pub max_planning_retries: u32,

    /// Let the planner pause the run to ask the human a question.
    #[serde(default = "default_true")]
    pub enable_clarification: bool,

    /// Pause for human approval before dispatching each plan.
    #[serde(default)]
    pub enable_plan_review: bool,

    /// Feedback rounds before the gate forces progress.
    #[serde(default = "default_max_clarification_rounds")]
    pub max_clarification_rounds: u32,

    /// Concurrently executing steps within one stage.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Per-step worker timeout. 0 disables it.
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Treat a timed-out dependency with partial output as satisfied.
    #[serde(default = "default_true")]
    pub accept_partial_timeouts: bool,

    #[serde(default)]
    pub exhausted_plan_policy: ExhaustedPlanPolicy,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            max_plan_iterations: default_max_plan_iterations(),
            max_step_num: default_max_step_num(),
            max_planning_retries: default_max_planning_retries(),
            enable_clarification: true,
            enable_plan_review: false,
            max_clarification_rounds: default_max_clarification_rounds(),
            max_in_flight: default_max_in_flight(),
            step_timeout_seconds: default_step_timeout(),
            accept_partial_timeouts: true,
            exhausted_plan_policy: ExhaustedPlanPolicy::default(),
        }
    }
}

impl WorkflowConfig {
    pub fn step_timeout(&self) -> Option<Duration> {
        (self.step_timeout_seconds > 0).then(|| Duration::from_secs(self.step_timeout_seconds))
    }
}

fn default_true() -> bool {
    true
}

fn default_max_plan_iterations() -> u32 {
    3
}

fn default_max_step_num() -> usize {
    6
}

fn default_max_planning_retries() -> u32 {
    2
}

fn default_max_clarification_rounds() -> u32 {
    2
}

fn default_max_in_flight() -> usize {
    4
}

fn default_step_timeout() -> u64 {
    600
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref model) = args.model {
            self.model.name = model.clone();
        }
        if let Some(ref url) = args.ollama_url {
            self.model.ollama_url = url.clone();
        }
        if let Some(ref store_dir) = args.store_dir {
            self.general.store_dir = store_dir.clone();
        }
        if let Some(ref output) = args.output {
            self.general.output = output.display().to_string();
        }
        if let Some(concurrency) = args.max_in_flight {
            self.workflow.max_in_flight = concurrency;
        }
        if let Some(iterations) = args.max_plan_iterations {
            self.workflow.max_plan_iterations = iterations;
        }
        if args.plan_review {
            self.workflow.enable_plan_review = true;
        }

        // Flags always override
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Reject settings the workflow engine cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.workflow.max_plan_iterations == 0 {
            return Err("workflow.max_plan_iterations must be at least 1".to_string());
        }
        if self.workflow.max_in_flight == 0 {
            return Err("workflow.max_in_flight must be at least 1".to_string());
        }
        if self.workflow.max_step_num == 0 {
            return Err("workflow.max_step_num must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.model.temperature) {
            return Err("model.temperature must be between 0.0 and 1.0".to_string());
        }
        if !self.model.ollama_url.starts_with("http://")
            && !self.model.ollama_url.starts_with("https://")
        {
            return Err("model.ollama_url must start with 'http://' or 'https://'".to_string());
        }
        Ok(())
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
