//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// vulngraph - plan-then-execute vulnerability analysis with local AI
///
/// Classifies the request, plans analysis steps with an Ollama model,
/// runs them stage by stage, and pauses for human feedback when the plan
/// needs it. Every run is checkpointed and can be resumed.
///
/// Examples:
///   vulngraph run "assess 10.0.0.5 for known CVEs"
///   vulngraph run --file scanner_report.json
///   vulngraph resume 6f1c... --feedback "only the public web servers"
///   vulngraph resume 6f1c... --approve
///   vulngraph list
///   vulngraph --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Ollama model to use for planning and analysis
    #[arg(short, long, global = true, env = "VULNGRAPH_MODEL")]
    pub model: Option<String>,

    /// Ollama API endpoint URL
    #[arg(long, global = true, env = "OLLAMA_URL")]
    pub ollama_url: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .vulngraph.toml in the current directory
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Directory holding run checkpoints
    #[arg(long, global = true, value_name = "DIR")]
    pub store_dir: Option<PathBuf>,

    /// Output file path for the final report
    #[arg(short, long, global = true, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Maximum number of concurrently executing steps per stage
    #[arg(long, global = true, value_name = "NUM")]
    pub max_in_flight: Option<usize>,

    /// Hard ceiling on planner invocations per run
    #[arg(long, global = true, value_name = "NUM")]
    pub max_plan_iterations: Option<u32>,

    /// Pause for approval before each plan is dispatched
    #[arg(long, global = true)]
    pub plan_review: bool,

    /// Enable verbose logging output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Generate a default .vulngraph.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start a new analysis run
    Run {
        /// Free-text request, e.g. "assess 10.0.0.5 for known CVEs"
        #[arg(required_unless_present = "file", conflicts_with = "file")]
        input: Option<String>,

        /// Read the input from a file (free text or scanner report JSON)
        #[arg(short, long, value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Resume a suspended or interrupted run
    Resume {
        run_id: String,

        /// Answer to the planner's question, or review comment
        #[arg(long, value_name = "TEXT")]
        feedback: Option<String>,

        /// Approve the plan awaiting review
        #[arg(long)]
        approve: bool,
    },

    /// List stored runs, most recent first
    List {
        #[arg(long, default_value = "20", value_name = "COUNT")]
        limit: usize,
    },

    /// Show the latest checkpoint of a run
    Show {
        run_id: String,

        #[arg(long, default_value = "markdown", value_name = "FORMAT")]
        format: OutputFormat,
    },

    /// Remove all stored runs
    Clear,
}

/// Output format for `show`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        let Some(ref command) = self.command else {
            return Err("A command is required (run, resume, list, show, clear)".to_string());
        };

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(ref url) = self.ollama_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("Ollama URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.max_in_flight == Some(0) {
            return Err("--max-in-flight must be at least 1".to_string());
        }

        if self.max_plan_iterations == Some(0) {
            return Err("--max-plan-iterations must be at least 1".to_string());
        }

        match command {
            Command::Run {
                input: Some(input), ..
            } if input.trim().is_empty() => Err("Input must not be empty".to_string()),
            Command::Run {
                file: Some(path), ..
            } if !path.is_file() => Err(format!("Input file does not exist: {}", path.display())),
            Command::Resume { run_id, .. } | Command::Show { run_id, .. } if run_id.trim().is_empty() => {
                Err("Run id must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
