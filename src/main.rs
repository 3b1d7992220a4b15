//! vulngraph - plan-then-execute vulnerability analysis
//!
//! A CLI that classifies a request or scanner report, plans analysis steps
//! with an Ollama model, executes them stage by stage, and checkpoints every
//! transition so runs can be suspended for human feedback and resumed.
//!
//! Exit codes:
//!   0 - Run completed, is awaiting feedback, or the command succeeded
//!   1 - Runtime error (invalid input, planning failure, store failure, etc.)

mod analysis;
mod cli;
mod config;
mod controller;
mod coordinator;
mod dispatch;
mod error;
mod feedback;
mod llm;
mod models;
mod planner;
mod report;
mod store;
#[cfg(test)]
mod testing;
mod workers;

use anyhow::{Context, Result};
use cli::{Args, Command, OutputFormat};
use config::Config;
use controller::RunController;
use indicatif::{ProgressBar, ProgressStyle};
use models::{AwaitingReason, Feedback, Run, RunStatus};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use store::{CheckpointStore, FileCheckpointStore};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("vulngraph v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run_command(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .vulngraph.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(config::DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            config::DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", config::DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", config::DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize the model, planning limits, and concurrency.");
    Ok(())
}

/// Initialize logging; `RUST_LOG` overrides the verbosity flags.
fn init_logging(args: &Args) {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("vulngraph={}", level).to_lowercase()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

async fn run_command(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    let store: Arc<dyn CheckpointStore> = Arc::new(
        FileCheckpointStore::new(&config.general.store_dir).with_context(|| {
            format!(
                "Failed to open checkpoint store at {}",
                config.general.store_dir.display()
            )
        })?,
    );

    match args.command {
        Some(Command::Run { input, file }) => {
            let input = match (input, file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read input file: {}", path.display()))?,
                (None, None) => anyhow::bail!("No input given"),
            };

            println!("🔎 Starting analysis...");
            println!("   Model: {}", config.model.name);
            println!("   Ollama: {}", config.model.ollama_url);

            let controller = build_controller(&config, store)?;
            let started = Instant::now();
            let outcome = with_spinner(&controller, controller.start(&input)).await;
            finish_run(outcome, &config, started)
        }
        Some(Command::Resume {
            run_id,
            feedback,
            approve,
        }) => {
            let feedback = match (feedback, approve) {
                (None, false) => None,
                (None, true) => Some(Feedback::approve()),
                (Some(text), false) => Some(Feedback::comment(text)),
                (Some(text), true) => Some(Feedback {
                    approved: true,
                    comment: Some(text),
                }),
            };

            println!("⏯️  Resuming run {}", run_id);
            let controller = build_controller(&config, store)?;
            let started = Instant::now();
            let outcome = with_spinner(&controller, controller.resume(&run_id, feedback)).await;
            finish_run(outcome, &config, started)
        }
        Some(Command::List { limit }) => {
            list_runs(store.as_ref(), limit)?;
            Ok(0)
        }
        Some(Command::Show { run_id, format }) => {
            show_run(store.as_ref(), &run_id, format)?;
            Ok(0)
        }
        Some(Command::Clear) => {
            let removed = store.clear().context("Failed to clear checkpoint store")?;
            println!("🧹 Removed {} stored run(s).", removed);
            Ok(0)
        }
        None => anyhow::bail!("No command given"),
    }
}

/// Wire the Ollama-backed planner, workers and reporter into a controller.
fn build_controller(config: &Config, store: Arc<dyn CheckpointStore>) -> Result<RunController> {
    let client = llm::OllamaClient::new(config.model.clone())?;

    let backend = Arc::new(planner::OllamaPlanBackend::new(client.clone()));
    let workers = workers::WorkerTable::ollama(client.clone());
    let reporter = Arc::new(report::MarkdownReporter::new(client.model_name()));

    Ok(RunController::new(
        config.workflow.clone(),
        backend,
        workers,
        reporter,
        store,
    ))
}

/// Drive `work` behind a spinner. Ctrl-C requests cancellation at the next
/// stage boundary.
async fn with_spinner<F>(controller: &RunController, work: F) -> F::Output
where
    F: Future,
{
    let cancel = controller.cancel_signal();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current stage");
            cancel.cancel("interrupted by user");
        }
    });

    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message("Running workflow...");
    spinner.enable_steady_tick(Duration::from_millis(120));

    let output = work.await;

    spinner.finish_and_clear();
    watcher.abort();
    output
}

/// Report the state a run ended in and write the final report, if any.
fn finish_run(
    outcome: std::result::Result<Run, error::WorkflowError>,
    config: &Config,
    started: Instant,
) -> Result<i32> {
    let run = outcome?;
    let duration = started.elapsed().as_secs_f64();

    match run.status {
        RunStatus::AwaitingFeedback => {
            println!("\n⏸️  Run {} is waiting for your input.", run.run_id);
            match run.awaiting {
                Some(AwaitingReason::Clarification { ref question }) => {
                    println!("\n❓ {}\n", question);
                    println!("   Answer with: vulngraph resume {} --feedback \"...\"", run.run_id);
                }
                Some(AwaitingReason::PlanReview) | None => {
                    if let Some(ref plan) = run.current_plan {
                        println!("\n{}", report::format_plan_markdown(plan));
                    }
                    println!("   Approve with: vulngraph resume {} --approve", run.run_id);
                    println!("   Or revise:    vulngraph resume {} --feedback \"...\"", run.run_id);
                }
            }
            Ok(0)
        }
        RunStatus::Completed => {
            let summary = analysis::VulnSummary::from_vulns(&run.discovered_vulnerabilities);
            let tally = analysis::StepTally::from_results(run.step_results.values());

            if let Some(ref report) = run.final_report {
                std::fs::write(&config.general.output, report).with_context(|| {
                    format!("Failed to write report to {}", config.general.output)
                })?;
            }

            println!("\n📊 Analysis Summary:");
            println!("   Run: {}", run.run_id);
            println!("   Plan iterations: {}", run.plan_iterations);
            println!(
                "   Steps: {} succeeded | {} failed | {} timed out",
                tally.succeeded, tally.failed, tally.timed_out
            );
            println!("   Vulnerabilities: {}", summary.total);
            println!(
                "   - 🔴 Critical: {} | 🟠 High: {} | 🟡 Medium: {} | 🟢 Low: {}",
                summary.critical, summary.high, summary.medium, summary.low
            );
            println!("   Duration: {:.1}s", duration);
            println!(
                "\n✅ Analysis complete! Report saved to: {}",
                config.general.output
            );
            Ok(0)
        }
        status => {
            warn!(run_id = %run.run_id, %status, "Run returned in unexpected state");
            println!("\nRun {} stopped in state {}.", run.run_id, status);
            Ok(1)
        }
    }
}

fn list_runs(store: &dyn CheckpointStore, limit: usize) -> Result<()> {
    let runs = store.list_runs().context("Failed to list runs")?;

    if runs.is_empty() {
        println!("No stored runs.");
        return Ok(());
    }

    println!("{:<38} {:<18} {:>5} {:<20} INPUT", "RUN", "STATUS", "CKPT", "UPDATED");
    for summary in runs.iter().rev().take(limit) {
        let mut input: String = summary.user_input.split_whitespace().collect::<Vec<_>>().join(" ");
        if input.chars().count() > 60 {
            input = format!("{}...", input.chars().take(57).collect::<String>());
        }
        println!(
            "{:<38} {:<18} {:>5} {:<20} {}",
            summary.run_id,
            summary.status.to_string(),
            summary.sequence_number,
            summary.updated_at.format("%Y-%m-%d %H:%M:%S"),
            input
        );
    }
    Ok(())
}

fn show_run(store: &dyn CheckpointStore, run_id: &str, format: OutputFormat) -> Result<()> {
    let checkpoint = store
        .latest(run_id)
        .with_context(|| format!("Failed to read checkpoint for run {}", run_id))?
        .ok_or_else(|| error::WorkflowError::RunNotFound(run_id.to_string()))?;
    let run = &checkpoint.state;

    match format {
        OutputFormat::Json => println!("{}", report::generate_json_report(run)?),
        OutputFormat::Markdown => {
            println!(
                "Run {} ({}), checkpoint #{} at {}\n",
                run.run_id,
                run.status,
                checkpoint.sequence_number,
                checkpoint.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
            );
            if let Some(ref reason) = run.abort_reason {
                println!("Aborted: {}\n", reason);
            }
            match (&run.final_report, &run.current_plan) {
                (Some(report), _) => println!("{}", report),
                (None, Some(plan)) => println!("{}", report::format_plan_markdown(plan)),
                (None, None) => println!("No plan yet."),
            }
        }
    }
    Ok(())
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", config::DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
