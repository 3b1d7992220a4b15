//! Human-in-the-loop gate between planning and dispatch.
//!
//! The gate decides whether a freshly adopted plan suspends the run for
//! clarification or review, and how feedback supplied on resume routes the
//! run afterwards. Suspension is bounded by `max_clarification_rounds`; once
//! the budget is spent the gate forces progress instead of asking again.

use crate::config::WorkflowConfig;
use crate::models::{AwaitingReason, Feedback, Plan, Run, RunStatus};
use tracing::{info, warn};

/// Where the run goes after planning.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// Park the run in `AwaitingFeedback`.
    Suspend(AwaitingReason),
    /// Move on to `Dispatching` or `Reporting`.
    Proceed(RunStatus),
}

/// What a resume with feedback leads to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resumption {
    pub next: RunStatus,
    /// Text to inject into the next planner call.
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FeedbackGate {
    max_rounds: u32,
    plan_review: bool,
}

impl FeedbackGate {
    pub fn new(config: &WorkflowConfig) -> Self {
        Self {
            max_rounds: config.max_clarification_rounds,
            plan_review: config.enable_plan_review,
        }
    }

    pub fn evaluate(&self, run: &Run, plan: &Plan) -> GateDecision {
        if plan.has_enough_context {
            return GateDecision::Proceed(RunStatus::Reporting);
        }

        let rounds_left = run.clarification_rounds < self.max_rounds;

        if let Some(question) = plan.clarification.as_deref().filter(|_| plan.needs_clarification()) {
            if rounds_left {
                info!(run_id = %run.run_id, round = run.clarification_rounds + 1, "Plan needs clarification");
                return GateDecision::Suspend(AwaitingReason::Clarification {
                    question: question.trim().to_string(),
                });
            }
            warn!(
                run_id = %run.run_id,
                rounds = run.clarification_rounds,
                "Clarification rounds exhausted, forcing progress"
            );
        } else if self.plan_review && !plan.steps.is_empty() {
            if rounds_left {
                info!(run_id = %run.run_id, steps = plan.steps.len(), "Plan awaiting review");
                return GateDecision::Suspend(AwaitingReason::PlanReview);
            }
            warn!(
                run_id = %run.run_id,
                rounds = run.clarification_rounds,
                "Review rounds exhausted, auto-approving plan"
            );
        }

        if plan.steps.is_empty() {
            GateDecision::Proceed(RunStatus::Reporting)
        } else {
            GateDecision::Proceed(RunStatus::Dispatching)
        }
    }

    /// Route a suspended run once feedback arrives.
    pub fn resume(&self, reason: &AwaitingReason, feedback: &Feedback) -> Resumption {
        let comment = feedback
            .comment
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(String::from);

        match reason {
            AwaitingReason::PlanReview if feedback.approved => Resumption {
                next: RunStatus::Dispatching,
                feedback: None,
            },
            AwaitingReason::PlanReview => Resumption {
                next: RunStatus::Planning,
                feedback: Some(comment.unwrap_or_else(|| "The plan was rejected. Propose a different one.".to_string())),
            },
            AwaitingReason::Clarification { question } => Resumption {
                next: RunStatus::Planning,
                feedback: comment.map(|answer| format!("Q: {}\nA: {}", question, answer)),
            },
        }
    }
}
