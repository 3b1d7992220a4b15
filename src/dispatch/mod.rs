//! Staged, dependency-aware step execution.
//!
//! Steps are grouped by stage and stages run in ascending order. Inside a
//! stage every ready step runs concurrently, bounded by `max_in_flight`, and
//! the stage ends only when each launched step has produced a result.

use crate::analysis::ResultAggregator;
use crate::config::WorkflowConfig;
use crate::error::WorkflowError;
use crate::models::{Plan, Run, Step, StepErrorKind, StepResult};
use crate::workers::WorkerTable;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// How a dispatch cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every stage ran.
    Completed,
    /// A critical step failed; later stages were skipped.
    Halted { step_id: String },
    /// Cancellation was requested between stages.
    Cancelled { reason: String },
}

/// Cooperative cancellation flag, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelSignal {
    pub fn cancel(&self, reason: impl Into<String>) {
        *self.reason.lock() = Some(reason.into());
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}

/// Steps of `plan` grouped by stage, ascending.
pub fn stages(plan: &Plan) -> BTreeMap<u32, Vec<&Step>> {
    let mut grouped: BTreeMap<u32, Vec<&Step>> = BTreeMap::new();
    for step in &plan.steps {
        grouped.entry(step.stage).or_default().push(step);
    }
    grouped
}

pub struct Dispatcher {
    workers: WorkerTable,
    max_in_flight: usize,
    step_timeout: Option<Duration>,
    accept_partial_timeouts: bool,
}

impl Dispatcher {
    pub fn new(workers: WorkerTable, config: &WorkflowConfig) -> Self {
        for step_type in workers.missing() {
            warn!(%step_type, "No worker registered; steps of this type will fail");
        }
        Self {
            workers,
            max_in_flight: config.max_in_flight.max(1),
            step_timeout: config.step_timeout(),
            accept_partial_timeouts: config.accept_partial_timeouts,
        }
    }

    /// Execute the steps of the run's current plan that have no result for
    /// the current iteration yet.
    ///
    /// `on_barrier` receives a snapshot of the run after each stage that
    /// launched work; an error from it stops dispatch and is returned.
    ///
    /// A critical step that already failed in this iteration halts dispatch
    /// before any later stage starts, including when the failure was
    /// recorded before a resume.
    pub async fn execute<F, Fut>(
        &self,
        run: &mut Run,
        cancel: &CancelSignal,
        mut on_barrier: F,
    ) -> Result<DispatchOutcome, WorkflowError>
    where
        F: FnMut(Run) -> Fut,
        Fut: Future<Output = Result<(), WorkflowError>>,
    {
        let Some(plan) = run.current_plan.clone() else {
            return Ok(DispatchOutcome::Completed);
        };

        for (stage, steps) in stages(&plan) {
            if let Some(step_id) = failed_critical_step(run, &plan) {
                warn!(run_id = %run.run_id, %step_id, stage, "Critical step failed, halting dispatch");
                return Ok(DispatchOutcome::Halted { step_id });
            }

            let pending: Vec<&Step> = steps
                .into_iter()
                .filter(|s| run.current_result(&s.id).is_none())
                .collect();
            if pending.is_empty() {
                continue;
            }

            if cancel.is_cancelled() {
                let reason = cancel.reason().unwrap_or_else(|| "cancelled".to_string());
                info!(run_id = %run.run_id, stage, %reason, "Dispatch cancelled before stage");
                return Ok(DispatchOutcome::Cancelled { reason });
            }

            info!(run_id = %run.run_id, stage, steps = pending.len(), "Starting stage");
            self.run_stage(run, &pending).await;
            info!(run_id = %run.run_id, stage, "Stage barrier reached");

            on_barrier(run.clone()).await?;
        }

        match failed_critical_step(run, &plan) {
            Some(step_id) => {
                warn!(run_id = %run.run_id, %step_id, "Critical step failed in the last stage");
                Ok(DispatchOutcome::Halted { step_id })
            }
            None => Ok(DispatchOutcome::Completed),
        }
    }

    /// Launch every step of one stage and wait for all of them.
    async fn run_stage(&self, run: &mut Run, steps: &[&Step]) {
        let iteration = run.plan_iterations;
        let aggregator = Arc::new(ResultAggregator::new(std::mem::take(&mut run.step_results)));
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let mut handles = Vec::with_capacity(steps.len());

        for step in steps {
            let upstream = match self.upstream_for(run, &aggregator, step).await {
                Ok(upstream) => upstream,
                Err(blocked) => {
                    aggregator.merge(stamp(blocked, iteration)).await;
                    continue;
                }
            };

            let Some(worker) = self.workers.get(step.step_type) else {
                error!(step_id = %step.id, step_type = %step.step_type, "No worker registered");
                let result = StepResult::failed(
                    &step.id,
                    StepErrorKind::Worker,
                    format!("no worker registered for {}", step.step_type),
                );
                aggregator.merge(stamp(result, iteration)).await;
                continue;
            };

            let step = (*step).clone();
            let aggregator = Arc::clone(&aggregator);
            let semaphore = Arc::clone(&semaphore);
            let timeout = self.step_timeout;
            let step_id = step.id.clone();

            let handle = tokio::spawn(async move {
                // closed only when the semaphore is dropped, which cannot happen here
                let _permit = semaphore.acquire_owned().await.ok();
                debug!(step_id = %step.id, step_type = %step.step_type, "Invoking worker");

                let result = match timeout {
                    Some(limit) => match tokio::time::timeout(limit, worker.invoke(&step, &upstream)).await {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(step_id = %step.id, timeout_secs = limit.as_secs(), "Step timed out");
                            StepResult::timed_out(
                                &step.id,
                                None,
                                format!("worker did not finish within {}s", limit.as_secs()),
                            )
                        }
                    },
                    None => worker.invoke(&step, &upstream).await,
                };

                let mut result = stamp(result, iteration);
                result.step_id = step.id.clone();
                if !result.is_success() {
                    warn!(step_id = %step.id, status = %result.status, "Step did not succeed");
                }
                aggregator.merge(result).await;
            });
            handles.push((step_id, handle));
        }

        let (ids, handles): (Vec<String>, Vec<_>) = handles.into_iter().unzip();
        for (step_id, joined) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(e) = joined {
                error!(step_id = %step_id, error = %e, "Worker task panicked");
                let result = StepResult::failed(&step_id, StepErrorKind::Panicked, e.to_string());
                aggregator.merge(stamp(result, iteration)).await;
            }
        }

        run.step_results = aggregator.snapshot().await;
    }

    /// Dependency results for `step`, or the failed result recording why it
    /// cannot run.
    async fn upstream_for(
        &self,
        run: &Run,
        aggregator: &ResultAggregator,
        step: &Step,
    ) -> Result<Vec<StepResult>, StepResult> {
        let results = aggregator.snapshot().await;
        let mut upstream = Vec::with_capacity(step.depends_on.len());

        for dependency in &step.depends_on {
            match results
                .get(dependency)
                .filter(|r| r.plan_iteration == run.plan_iterations)
            {
                Some(result) if result.satisfies_dependency(self.accept_partial_timeouts) => {
                    upstream.push(result.clone());
                }
                other => {
                    let why = match other {
                        Some(result) => format!("dependency `{}` {}", dependency, result.status),
                        None => format!("dependency `{}` has no result", dependency),
                    };
                    debug!(step_id = %step.id, %why, "Skipping step");
                    return Err(StepResult::failed(&step.id, StepErrorKind::DependencyFailed, why));
                }
            }
        }

        Ok(upstream)
    }
}

/// First critical step of `plan` whose current result is not a success.
fn failed_critical_step(run: &Run, plan: &Plan) -> Option<String> {
    plan.steps
        .iter()
        .filter(|s| s.critical)
        .find(|s| run.current_result(&s.id).is_some_and(|r| !r.is_success()))
        .map(|s| s.id.clone())
}

fn stamp(mut result: StepResult, iteration: u32) -> StepResult {
    result.plan_iteration = iteration;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{StepStatus, StepType};
    use crate::testing::{plan_of, step, CountingWorker, FailingWorker, PanickingWorker, SlowWorker};
    use serde_json::json;
    use std::future::ready;
    use tokio::time::Instant;

    fn config(max_in_flight: usize) -> WorkflowConfig {
        WorkflowConfig {
            max_in_flight,
            step_timeout_seconds: 10,
            ..WorkflowConfig::default()
        }
    }

    fn run_with(steps: Vec<Step>) -> Run {
        let mut run = Run::new("r1", "assess 10.0.0.5");
        run.plan_iterations = 1;
        run.adopt_plan(plan_of(steps));
        run
    }

    fn slow_table() -> WorkerTable {
        WorkerTable::new()
            .with(StepType::AssetAnalysis, Arc::new(SlowWorker::new(Duration::from_secs(3))))
            .with(StepType::VulnDiscovery, Arc::new(SlowWorker::new(Duration::from_secs(1))))
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_stage_steps_run_concurrently() {
        let dispatcher = Dispatcher::new(slow_table(), &config(4));
        let mut run = run_with(vec![
            step("a", StepType::AssetAnalysis, 1, &[]),
            step("b", StepType::VulnDiscovery, 1, &[]),
        ]);

        let started = Instant::now();
        let outcome = dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(3));
        assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
        assert_eq!(run.step_results.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_in_flight_bounds_concurrency() {
        let dispatcher = Dispatcher::new(slow_table(), &config(1));
        let mut run = run_with(vec![
            step("a", StepType::AssetAnalysis, 1, &[]),
            step("b", StepType::VulnDiscovery, 1, &[]),
        ]);

        let started = Instant::now();
        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_synthesizes_result() {
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, Arc::new(SlowWorker::new(Duration::from_secs(60))));
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![step("a", StepType::AssetAnalysis, 1, &[])]);

        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        let result = &run.step_results["a"];
        assert_eq!(result.status, StepStatus::TimedOut);
        assert_eq!(result.plan_iteration, 1);
    }

    #[tokio::test]
    async fn test_failed_sibling_does_not_block_stage() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, Arc::new(FailingWorker))
            .with(StepType::VulnDiscovery, counter.clone())
            .with(StepType::Reporting, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![
            step("bad", StepType::AssetAnalysis, 1, &[]),
            step("good", StepType::VulnDiscovery, 1, &[]),
            step("after-bad", StepType::Reporting, 2, &["bad"]),
            step("after-good", StepType::Reporting, 2, &["good"]),
        ]);

        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        assert_eq!(run.step_results["bad"].status, StepStatus::Failed);
        assert!(run.step_results["good"].is_success());
        assert!(run.step_results["after-good"].is_success());

        let blocked = &run.step_results["after-bad"];
        assert_eq!(blocked.status, StepStatus::Failed);
        assert_eq!(
            blocked.error.as_ref().map(|e| e.kind),
            Some(StepErrorKind::DependencyFailed)
        );
        // the blocked step's worker is never called
        assert_eq!(counter.calls_for("after-bad"), 0);
        assert_eq!(counter.calls_for("after-good"), 1);
    }

    #[tokio::test]
    async fn test_upstream_results_passed_to_worker() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, counter.clone())
            .with(StepType::VulnDiscovery, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![
            step("asset", StepType::AssetAnalysis, 1, &[]),
            step("cves", StepType::VulnDiscovery, 2, &["asset"]),
        ]);

        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        assert_eq!(counter.upstream_of("cves"), vec!["asset".to_string()]);
    }

    #[tokio::test]
    async fn test_partial_timeout_satisfies_dependency() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new().with(StepType::VulnDiscovery, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![
            step("asset", StepType::AssetAnalysis, 1, &[]),
            step("cves", StepType::VulnDiscovery, 2, &["asset"]),
        ]);
        let mut partial = StepResult::timed_out("asset", Some(json!({"summary": "half"})), "slow");
        partial.plan_iteration = 1;
        run.step_results.insert("asset".into(), partial);

        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();
        assert!(run.step_results["cves"].is_success());
    }

    #[tokio::test]
    async fn test_existing_results_not_reinvoked() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, counter.clone())
            .with(StepType::VulnDiscovery, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![
            step("asset", StepType::AssetAnalysis, 1, &[]),
            step("cves", StepType::VulnDiscovery, 2, &["asset"]),
        ]);
        let mut done = StepResult::succeeded("asset", json!({"summary": "cached"}));
        done.plan_iteration = 1;
        run.step_results.insert("asset".into(), done);

        let mut barriers = 0;
        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| {
                barriers += 1;
                ready(Ok(()))
            })
            .await
            .unwrap();

        assert_eq!(counter.calls_for("asset"), 0);
        assert_eq!(counter.calls_for("cves"), 1);
        assert_eq!(barriers, 1);
        assert_eq!(run.step_results["asset"].output["summary"], "cached");
    }

    #[tokio::test]
    async fn test_panicking_worker_recorded() {
        let table = WorkerTable::new().with(StepType::AssetAnalysis, Arc::new(PanickingWorker));
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![step("boom", StepType::AssetAnalysis, 1, &[])]);

        dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        let result = &run.step_results["boom"];
        assert_eq!(result.error.as_ref().map(|e| e.kind), Some(StepErrorKind::Panicked));
        assert_eq!(result.plan_iteration, 1);
    }

    #[tokio::test]
    async fn test_critical_failure_halts_after_barrier() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, Arc::new(FailingWorker))
            .with(StepType::VulnDiscovery, counter.clone())
            .with(StepType::Reporting, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut critical = step("asset", StepType::AssetAnalysis, 1, &[]);
        critical.critical = true;
        let mut run = run_with(vec![
            critical,
            step("sibling", StepType::VulnDiscovery, 1, &[]),
            step("later", StepType::Reporting, 2, &[]),
        ]);

        let outcome = dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Halted { step_id: "asset".into() });
        assert!(run.step_results["sibling"].is_success());
        assert!(!run.step_results.contains_key("later"));
    }

    #[tokio::test]
    async fn test_recorded_critical_failure_halts_on_resume() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, counter.clone())
            .with(StepType::Reporting, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut critical = step("asset", StepType::AssetAnalysis, 1, &[]);
        critical.critical = true;
        let mut run = run_with(vec![critical, step("later", StepType::Reporting, 2, &[])]);
        // state as left by the barrier checkpoint of stage 1
        let mut failed = StepResult::failed("asset", StepErrorKind::Worker, "scanner unreachable");
        failed.plan_iteration = 1;
        run.step_results.insert("asset".into(), failed);

        let mut barriers = 0;
        let outcome = dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| {
                barriers += 1;
                ready(Ok(()))
            })
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Halted { step_id: "asset".into() });
        assert_eq!(counter.total_calls(), 0);
        assert_eq!(barriers, 0);
        assert!(!run.step_results.contains_key("later"));
    }

    #[tokio::test]
    async fn test_critical_failure_from_older_iteration_ignored() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new().with(StepType::AssetAnalysis, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut critical = step("asset", StepType::AssetAnalysis, 1, &[]);
        critical.critical = true;
        let mut run = run_with(vec![critical]);
        run.plan_iterations = 2;
        let mut stale = StepResult::failed("asset", StepErrorKind::Worker, "scanner unreachable");
        stale.plan_iteration = 1;
        run.step_results.insert("asset".into(), stale);

        let outcome = dispatcher
            .execute(&mut run, &CancelSignal::default(), |_| ready(Ok(())))
            .await
            .unwrap();

        assert_eq!(outcome, DispatchOutcome::Completed);
        assert_eq!(counter.calls_for("asset"), 1);
    }

    #[tokio::test]
    async fn test_cancel_between_stages() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, counter.clone())
            .with(StepType::VulnDiscovery, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![
            step("asset", StepType::AssetAnalysis, 1, &[]),
            step("cves", StepType::VulnDiscovery, 2, &["asset"]),
        ]);

        let cancel = CancelSignal::default();
        let outcome = dispatcher
            .execute(&mut run, &cancel, |_| {
                cancel.cancel("operator stop");
                ready(Ok(()))
            })
            .await
            .unwrap();

        assert_eq!(
            outcome,
            DispatchOutcome::Cancelled {
                reason: "operator stop".into()
            }
        );
        assert!(run.step_results.contains_key("asset"));
        assert!(!run.step_results.contains_key("cves"));
    }

    #[tokio::test]
    async fn test_barrier_error_stops_dispatch() {
        let counter = Arc::new(CountingWorker::default());
        let table = WorkerTable::new()
            .with(StepType::AssetAnalysis, counter.clone())
            .with(StepType::VulnDiscovery, counter.clone());
        let dispatcher = Dispatcher::new(table, &config(4));
        let mut run = run_with(vec![
            step("asset", StepType::AssetAnalysis, 1, &[]),
            step("cves", StepType::VulnDiscovery, 2, &["asset"]),
        ]);

        let result = dispatcher
            .execute(&mut run, &CancelSignal::default(), |run| {
                ready(Err(WorkflowError::RunNotFound(run.run_id)))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(counter.calls_for("cves"), 0);
    }

    #[test]
    fn test_stage_partition_is_ascending() {
        let plan = plan_of(vec![
            step("c", StepType::Reporting, 3, &[]),
            step("a", StepType::AssetAnalysis, 1, &[]),
            step("b", StepType::VulnDiscovery, 2, &[]),
            step("a2", StepType::AssetAnalysis, 1, &[]),
        ]);
        let grouped = stages(&plan);
        assert_eq!(grouped.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(grouped[&1].len(), 2);
    }
}
