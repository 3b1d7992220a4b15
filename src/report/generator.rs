//! Markdown and JSON report generation.
//!
//! This module renders a run's merged step results, plan history and
//! discovered vulnerabilities as a Markdown report, and renders single plans
//! for human review.

use crate::analysis::{generate_summary_text, sort_vulns_by_severity, StepTally, VulnSummary};
use crate::models::{Plan, Run, Severity, StepResult, StepType, Vuln};
use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

/// Generate a complete Markdown report for `run`.
pub fn generate_markdown_report(run: &Run, model: &str) -> String {
    let mut output = String::new();

    output.push_str("# Vulnerability Analysis Report\n\n");
    output.push_str(&generate_metadata_section(run, model));
    output.push_str(&generate_table_of_contents(run));
    output.push_str(&generate_summary_section(run));
    output.push_str(&generate_findings_section(&run.discovered_vulnerabilities));
    output.push_str(&generate_steps_section(run));
    output.push_str(&generate_plans_section(run));
    output.push_str(&generate_footer());

    output
}

/// Generate the metadata section.
fn generate_metadata_section(run: &Run, model: &str) -> String {
    let mut section = String::new();

    section.push_str("## Metadata\n\n");
    section.push_str(&format!("- **Run:** `{}`\n", run.run_id));
    section.push_str(&format!("- **Request:** {}\n", run.user_input.trim()));
    if let Some(ref context) = run.context {
        section.push_str(&format!("- **Intent:** {}\n", context.intent));
        if !context.targets.is_empty() {
            let targets: Vec<&str> = context.targets.iter().map(|t| t.value.as_str()).collect();
            section.push_str(&format!("- **Targets:** {}\n", targets.join(", ")));
        }
    }
    section.push_str(&format!(
        "- **Started:** {}\n",
        run.created_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!(
        "- **Generated:** {}\n",
        Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    ));
    section.push_str(&format!("- **Model Used:** `{}`\n", model));
    section.push_str(&format!("- **Plan Iterations:** {}\n", run.plan_iterations));
    section.push('\n');

    section
}

fn generate_table_of_contents(run: &Run) -> String {
    let mut toc = String::new();

    toc.push_str("## Table of Contents\n\n");
    toc.push_str("- [Metadata](#metadata)\n");
    toc.push_str("- [Summary](#summary)\n");
    toc.push_str("- [Vulnerabilities](#vulnerabilities)\n");
    toc.push_str("- [Step Results](#step-results)\n");
    if !run.all_plans().is_empty() {
        toc.push_str("- [Plan History](#plan-history)\n");
    }
    toc.push('\n');

    toc
}

/// Generate the summary section: analyst notes, severity table, step tally.
fn generate_summary_section(run: &Run) -> String {
    let mut section = String::new();
    let summary = VulnSummary::from_vulns(&run.discovered_vulnerabilities);
    let tally = StepTally::from_results(run.step_results.values());

    section.push_str("## Summary\n\n");

    let notes = analyst_notes(run);
    if !notes.is_empty() {
        section.push_str("### Analyst Notes\n\n");
        for note in notes {
            section.push_str(note.trim());
            section.push_str("\n\n");
        }
    }

    section.push_str("### Vulnerability Severity Breakdown\n\n");
    section.push_str(&format!(
        "| {} Critical | {} High | {} Medium | {} Low | **Total** |\n",
        Severity::Critical.emoji(),
        Severity::High.emoji(),
        Severity::Medium.emoji(),
        Severity::Low.emoji(),
    ));
    section.push_str("|:---:|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | {} | **{}** |\n\n",
        summary.critical, summary.high, summary.medium, summary.low, summary.total
    ));

    section.push_str("### Steps\n\n");
    section.push_str("| Succeeded | Failed | Timed Out | **Total** |\n");
    section.push_str("|:---:|:---:|:---:|:---:|\n");
    section.push_str(&format!(
        "| {} | {} | {} | **{}** |\n\n",
        tally.succeeded,
        tally.failed,
        tally.timed_out,
        tally.total()
    ));

    section
}

/// Summaries written by Reporting steps, oldest first.
fn analyst_notes(run: &Run) -> Vec<&str> {
    let mut reporting: Vec<&StepResult> = run
        .step_results
        .values()
        .filter(|r| r.is_success())
        .filter(|r| {
            run.all_plans()
                .iter()
                .filter_map(|p| p.step(&r.step_id))
                .any(|s| s.step_type == StepType::Reporting)
        })
        .collect();
    reporting.sort_by_key(|r| r.finished_at);

    reporting
        .into_iter()
        .filter_map(|r| r.output.get("summary").and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
        .collect()
}

fn generate_findings_section(vulns: &[Vuln]) -> String {
    let mut section = String::new();

    section.push_str("## Vulnerabilities\n\n");

    if vulns.is_empty() {
        section.push_str("No vulnerabilities were confirmed during this run.\n\n");
        return section;
    }

    section.push_str(&generate_summary_text(&VulnSummary::from_vulns(vulns)));
    section.push_str("\n\n");

    for vuln in sort_vulns_by_severity(vulns) {
        section.push_str(&generate_vuln_block(vuln));
    }

    section
}

/// Generate a single vulnerability block.
fn generate_vuln_block(vuln: &Vuln) -> String {
    let mut block = String::new();
    let severity = vuln.severity();

    block.push_str(&format!(
        "### {} **{}** {}\n\n",
        severity.emoji(),
        severity.to_string().to_uppercase(),
        vuln.id
    ));

    if let Some(score) = vuln.score() {
        block.push_str(&format!("**CVSS:** {:.1}", score));
        if vuln.v31score.is_some() && vuln.v2score.is_some() {
            block.push_str(&format!(" (v2: {:.1})", vuln.v2score.unwrap_or_default()));
        }
        block.push_str("\n\n");
    }
    if !vuln.published.is_empty() {
        block.push_str(&format!("**Published:** {}\n\n", vuln.published));
    }
    if !vuln.description.is_empty() {
        block.push_str(&format!("**Description:** {}\n\n", vuln.description));
    }

    if !vuln.impacts.is_empty() {
        block.push_str("| Software | Affected From | Fixed In |\n");
        block.push_str("|:---|:---|:---|\n");
        for impact in &vuln.impacts {
            block.push_str(&format!(
                "| {} | {} | {} |\n",
                impact.name,
                impact.after_version.as_deref().unwrap_or("-"),
                impact.before_version.as_deref().unwrap_or("-"),
            ));
        }
        block.push('\n');
    }

    if let Some(ref info) = vuln.additional_info {
        block.push_str(&format!("> {}\n\n", info));
    }

    block.push_str("---\n\n");

    block
}

fn generate_steps_section(run: &Run) -> String {
    let mut section = String::new();

    section.push_str("## Step Results\n\n");

    if run.step_results.is_empty() {
        section.push_str("No steps were executed.\n\n");
        return section;
    }

    section.push_str("| Step | Iteration | Status | Detail |\n");
    section.push_str("|:---|:---:|:---|:---|\n");

    let mut results: Vec<&StepResult> = run.step_results.values().collect();
    results.sort_by(|a, b| {
        a.plan_iteration
            .cmp(&b.plan_iteration)
            .then_with(|| a.finished_at.cmp(&b.finished_at))
    });

    for result in results {
        let detail = match result.error {
            Some(ref error) => error.message.replace('|', "\\|"),
            None => String::new(),
        };
        section.push_str(&format!(
            "| `{}` | {} | {} | {} |\n",
            result.step_id, result.plan_iteration, result.status, detail
        ));
    }
    section.push('\n');

    section
}

fn generate_plans_section(run: &Run) -> String {
    let plans = run.all_plans();
    if plans.is_empty() {
        return String::new();
    }

    let mut section = String::new();
    section.push_str("## Plan History\n\n");

    for (i, plan) in plans.into_iter().enumerate() {
        section.push_str(&format!("### Iteration {}\n\n", i + 1));
        section.push_str(&format_plan_markdown(plan));
    }

    section
}

fn generate_footer() -> String {
    let mut footer = String::new();

    footer.push_str("---\n\n");
    footer.push_str(&format!(
        "*Report generated by vulngraph v{}*\n",
        env!("CARGO_PKG_VERSION")
    ));

    footer
}

/// Render a plan for review: reasoning, flags and one line per step.
pub fn format_plan_markdown(plan: &Plan) -> String {
    let mut out = String::new();

    if !plan.reasoning.trim().is_empty() {
        out.push_str(&format!("{}\n\n", plan.reasoning.trim()));
    }
    out.push_str(&format!(
        "- **Has enough context:** {}\n- **Finish plan:** {}\n",
        plan.has_enough_context, plan.finish_plan
    ));
    if let Some(question) = plan.clarification.as_deref().filter(|_| plan.needs_clarification()) {
        out.push_str(&format!("- **Question:** {}\n", question.trim()));
    }
    out.push('\n');

    if plan.steps.is_empty() {
        out.push_str("*No steps.*\n\n");
        return out;
    }

    let mut steps: Vec<_> = plan.steps.iter().collect();
    steps.sort_by_key(|s| s.stage);

    for step in steps {
        out.push_str(&format!(
            "{}. **{}** `{}` ({}){}\n",
            step.stage,
            step.title,
            step.id,
            step.step_type,
            if step.critical { " *critical*" } else { "" }
        ));
        if !step.target.is_empty() {
            out.push_str(&format!("   - Target: {}\n", step.target));
        }
        if !step.depends_on.is_empty() {
            let deps: Vec<&str> = step.depends_on.iter().map(String::as_str).collect();
            out.push_str(&format!("   - Depends on: {}\n", deps.join(", ")));
        }
        if !step.description.is_empty() {
            out.push_str(&format!("   - {}\n", step.description));
        }
    }
    out.push('\n');

    out
}

#[derive(Serialize)]
struct JsonReport<'a> {
    run_id: &'a str,
    status: String,
    user_input: &'a str,
    plan_iterations: u32,
    summary: VulnSummary,
    vulnerabilities: Vec<&'a Vuln>,
    step_results: Vec<&'a StepResult>,
    plans: Vec<&'a Plan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    abort_reason: Option<&'a str>,
}

/// Generate a JSON report.
pub fn generate_json_report(run: &Run) -> Result<String> {
    let mut step_results: Vec<&StepResult> = run.step_results.values().collect();
    step_results.sort_by(|a, b| a.step_id.cmp(&b.step_id));

    let report = JsonReport {
        run_id: &run.run_id,
        status: run.status.to_string(),
        user_input: &run.user_input,
        plan_iterations: run.plan_iterations,
        summary: VulnSummary::from_vulns(&run.discovered_vulnerabilities),
        vulnerabilities: sort_vulns_by_severity(&run.discovered_vulnerabilities),
        step_results,
        plans: run.all_plans(),
        abort_reason: run.abort_reason.as_deref(),
    };

    serde_json::to_string_pretty(&report).map_err(Into::into)
}
