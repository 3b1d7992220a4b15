//! Run lifecycle state machine.
//!
//! The controller owns the [`Run`] and is the only component that mutates
//! it outside the dispatcher's result merging. Every state transition is
//! followed by a checkpoint before the next state is entered, so a run can be
//! resumed from the store after any interruption.

use crate::config::{ExhaustedPlanPolicy, WorkflowConfig};
use crate::coordinator::{classify, RawInput};
use crate::dispatch::{CancelSignal, DispatchOutcome, Dispatcher};
use crate::error::{StoreError, WorkflowError};
use crate::feedback::{FeedbackGate, GateDecision, Resumption};
use crate::models::{AwaitingReason, Feedback, Run, RunStatus, StepType};
use crate::planner::{PlanBackend, Planner};
use crate::report::Reporter;
use crate::store::CheckpointStore;
use crate::workers::{vulns_from_output, WorkerTable};
use chrono::Utc;
use std::io;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub struct RunController {
    config: WorkflowConfig,
    planner: Planner,
    gate: FeedbackGate,
    dispatcher: Dispatcher,
    reporter: Arc<dyn Reporter>,
    store: Arc<dyn CheckpointStore>,
    cancel: CancelSignal,
}

impl RunController {
    pub fn new(
        config: WorkflowConfig,
        backend: Arc<dyn PlanBackend>,
        workers: WorkerTable,
        reporter: Arc<dyn Reporter>,
        store: Arc<dyn CheckpointStore>,
    ) -> Self {
        Self {
            planner: Planner::new(backend, config.clone()),
            gate: FeedbackGate::new(&config),
            dispatcher: Dispatcher::new(workers, &config),
            reporter,
            store,
            cancel: CancelSignal::default(),
            config,
        }
    }

    /// Handle for requesting cooperative cancellation from another task.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Start a new run under a fresh id.
    pub async fn start(&self, input: &str) -> Result<Run, WorkflowError> {
        self.start_with_id(&Uuid::new_v4().to_string(), input).await
    }

    /// Start a new run and drive it until it completes or suspends.
    pub async fn start_with_id(&self, run_id: &str, input: &str) -> Result<Run, WorkflowError> {
        let mut run = Run::new(run_id, input);
        info!(run_id = %run.run_id, "Starting run");

        if let Err(e) = self.checkpoint(&run).await {
            self.abort(&mut run, &e).await;
            return Err(e);
        }
        self.drive(run).await
    }

    /// Continue a stored run from its latest checkpoint.
    ///
    /// A run suspended in `AwaitingFeedback` stays suspended unless
    /// `feedback` is given. Any other non-terminal run picks up at its
    /// recorded state.
    pub async fn resume(&self, run_id: &str, feedback: Option<Feedback>) -> Result<Run, WorkflowError> {
        let checkpoint = self
            .store
            .latest(run_id)
            .map_err(|source| WorkflowError::CheckpointRead {
                run_id: run_id.to_string(),
                source,
            })?
            .ok_or_else(|| WorkflowError::RunNotFound(run_id.to_string()))?;

        let mut run = checkpoint.state;
        info!(
            run_id = %run.run_id,
            status = %run.status,
            sequence = checkpoint.sequence_number,
            "Resuming run"
        );

        if run.status.is_terminal() {
            return Err(WorkflowError::InvalidResume {
                run_id: run.run_id,
                status: run.status,
            });
        }

        if run.status == RunStatus::AwaitingFeedback {
            let Some(feedback) = feedback else {
                debug!(run_id = %run.run_id, "No feedback supplied, run stays suspended");
                return Ok(run);
            };

            let reason = run.awaiting.take();
            let mut resumption = match reason {
                Some(ref reason) => self.gate.resume(reason, &feedback),
                None => Resumption {
                    next: RunStatus::Planning,
                    feedback: feedback.comment.clone(),
                },
            };

            // a rejected plan is never dispatched once no new plan can replace it
            let rejected = matches!(reason, Some(AwaitingReason::PlanReview)) && !feedback.approved;
            if rejected && run.plan_iterations >= self.config.max_plan_iterations {
                warn!(
                    run_id = %run.run_id,
                    iterations = run.plan_iterations,
                    "Plan rejected at the iteration ceiling, reporting without dispatch"
                );
                resumption = Resumption {
                    next: RunStatus::Reporting,
                    feedback: None,
                };
            }
            run.pending_feedback = resumption.feedback;

            if let Err(e) = self.transition(&mut run, resumption.next).await {
                self.abort(&mut run, &e).await;
                return Err(e);
            }
        } else if let Some(comment) = feedback.and_then(|f| f.comment) {
            warn!(run_id = %run.run_id, status = %run.status, "Run is not awaiting feedback, keeping it for the next plan");
            run.pending_feedback = Some(comment);
        }

        self.drive(run).await
    }

    async fn drive(&self, mut run: Run) -> Result<Run, WorkflowError> {
        loop {
            if run.status.is_terminal() || run.status == RunStatus::AwaitingFeedback {
                return Ok(run);
            }

            if self.cancel.is_cancelled() {
                let e = WorkflowError::Cancelled {
                    run_id: run.run_id.clone(),
                    reason: self.cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
                };
                self.abort(&mut run, &e).await;
                return Err(e);
            }

            if let Err(e) = self.advance(&mut run).await {
                self.abort(&mut run, &e).await;
                return Err(e);
            }
        }
    }

    /// Execute the work of the current state and move to the next one.
    async fn advance(&self, run: &mut Run) -> Result<(), WorkflowError> {
        match run.status {
            RunStatus::Created => self.transition(run, RunStatus::Coordinating).await,
            RunStatus::Coordinating => {
                let context = classify(&RawInput::detect(&run.user_input))?;
                info!(
                    run_id = %run.run_id,
                    intent = %context.intent,
                    targets = context.targets.len(),
                    "Input normalized"
                );
                run.context = Some(context);
                self.transition(run, RunStatus::Planning).await
            }
            RunStatus::Planning => self.plan(run).await,
            RunStatus::Dispatching => self.dispatch(run).await,
            RunStatus::Reporting => {
                if run.final_report.is_none() {
                    let report = self
                        .reporter
                        .report(run)
                        .await
                        .map_err(|e| WorkflowError::Report(e.to_string()))?;
                    run.final_report = Some(report);
                }
                self.transition(run, RunStatus::Completed).await
            }
            RunStatus::AwaitingFeedback | RunStatus::Completed | RunStatus::Aborted => Ok(()),
        }
    }

    async fn plan(&self, run: &mut Run) -> Result<(), WorkflowError> {
        if run.plan_iterations >= self.config.max_plan_iterations {
            let remaining = run.undispatched_steps().len();
            let next = match self.config.exhausted_plan_policy {
                ExhaustedPlanPolicy::DispatchRemaining if remaining > 0 => RunStatus::Dispatching,
                _ => RunStatus::Reporting,
            };
            warn!(
                run_id = %run.run_id,
                iterations = run.plan_iterations,
                remaining,
                next = %next,
                "Plan iterations exhausted"
            );
            run.pending_feedback = None;
            return self.transition(run, next).await;
        }

        let context = match run.context.clone() {
            Some(context) => context,
            None => classify(&RawInput::detect(&run.user_input))?,
        };
        let feedback = run.pending_feedback.clone();
        let plan = self.planner.plan(run, &context, feedback.as_deref()).await?;

        run.pending_feedback = None;
        run.context = Some(context);
        run.plan_iterations += 1;
        run.adopt_plan(plan.clone());

        match self.gate.evaluate(run, &plan) {
            GateDecision::Suspend(reason) => {
                run.clarification_rounds += 1;
                run.awaiting = Some(reason);
                self.transition(run, RunStatus::AwaitingFeedback).await
            }
            GateDecision::Proceed(next) => self.transition(run, next).await,
        }
    }

    async fn dispatch(&self, run: &mut Run) -> Result<(), WorkflowError> {
        let outcome = self
            .dispatcher
            .execute(run, &self.cancel, |snapshot| self.persist(snapshot))
            .await?;

        match outcome {
            DispatchOutcome::Completed => {}
            DispatchOutcome::Halted { step_id } => {
                warn!(run_id = %run.run_id, %step_id, "Dispatch halted by critical step failure");
            }
            DispatchOutcome::Cancelled { reason } => {
                return Err(WorkflowError::Cancelled {
                    run_id: run.run_id.clone(),
                    reason,
                });
            }
        }

        let added = collect_vulns(run);
        if added > 0 {
            info!(run_id = %run.run_id, added, total = run.discovered_vulnerabilities.len(), "Recorded vulnerabilities");
        }

        let finished = run.current_plan.as_ref().map_or(true, |p| p.finish_plan)
            || run.plan_iterations >= self.config.max_plan_iterations;
        let next = if finished {
            RunStatus::Reporting
        } else {
            RunStatus::Planning
        };
        self.transition(run, next).await
    }

    async fn transition(&self, run: &mut Run, next: RunStatus) -> Result<(), WorkflowError> {
        let from = run.status;
        run.status = next;
        run.updated_at = Utc::now();
        info!(run_id = %run.run_id, from = %from, to = %next, "Run transition");
        self.checkpoint(run).await
    }

    async fn checkpoint(&self, run: &Run) -> Result<(), WorkflowError> {
        self.persist(run.clone()).await
    }

    /// Write a snapshot on the blocking pool; file stores fsync every write.
    async fn persist(&self, snapshot: Run) -> Result<(), WorkflowError> {
        let store = Arc::clone(&self.store);
        let run_id = snapshot.run_id.clone();
        let status = snapshot.status;

        let written = tokio::task::spawn_blocking(move || store.put(&snapshot.run_id, &snapshot))
            .await
            .map_err(|e| StoreError::Io(io::Error::new(io::ErrorKind::Other, e)))
            .and_then(|put| put);
        let checkpoint = written.map_err(|source| WorkflowError::CheckpointWrite {
            run_id: run_id.clone(),
            source,
        })?;

        debug!(
            run_id = %run_id,
            sequence = checkpoint.sequence_number,
            status = %status,
            "Checkpoint written"
        );
        Ok(())
    }

    /// Mark the run aborted and persist that, best effort.
    async fn abort(&self, run: &mut Run, cause: &WorkflowError) {
        error!(run_id = %run.run_id, status = %run.status, error = %cause, "Aborting run");
        run.status = RunStatus::Aborted;
        run.abort_reason = Some(cause.to_string());
        run.updated_at = Utc::now();

        if let Err(e) = self.checkpoint(run).await {
            error!(run_id = %run.run_id, error = %e, "Could not persist aborted state");
        }
    }
}

/// Append vulnerabilities carried by this iteration's discovery and detail
/// results. Returns how many were new.
fn collect_vulns(run: &mut Run) -> usize {
    let Some(plan) = run.current_plan.as_ref() else {
        return 0;
    };

    let mut found = Vec::new();
    for step in &plan.steps {
        if !matches!(step.step_type, StepType::VulnDiscovery | StepType::VulnDetail) {
            continue;
        }
        if let Some(result) = run.current_result(&step.id) {
            found.extend(vulns_from_output(&result.output));
        }
    }

    run.record_vulns(found)
}
