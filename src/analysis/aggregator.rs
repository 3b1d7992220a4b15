//! Result aggregation and statistics.
//!
//! [`ResultAggregator`] merges step results produced by concurrently running
//! workers into one mapping. The free functions summarize merged results and
//! discovered vulnerabilities for reporting.

use crate::models::{Severity, StepResult, StepStatus, Vuln};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Single-writer-at-a-time sink for step results.
///
/// Readers only look at the mapping between stage barriers, after every
/// writer of the stage has finished.
pub struct ResultAggregator {
    results: Mutex<HashMap<String, StepResult>>,
}

impl ResultAggregator {
    /// Start from the results already recorded on the run.
    pub fn new(existing: HashMap<String, StepResult>) -> Self {
        Self {
            results: Mutex::new(existing),
        }
    }

    /// Record `result`, replacing any earlier attempt for the same step.
    pub async fn merge(&self, result: StepResult) {
        let mut results = self.results.lock().await;
        debug!(step_id = %result.step_id, status = %result.status, "Merging step result");
        results.insert(result.step_id.clone(), result);
    }

    /// Copy of the current mapping.
    pub async fn snapshot(&self) -> HashMap<String, StepResult> {
        self.results.lock().await.clone()
    }
}

/// Count of step outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepTally {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl StepTally {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a StepResult>) -> Self {
        let mut tally = Self::default();
        for result in results {
            match result.status {
                StepStatus::Succeeded => tally.succeeded += 1,
                StepStatus::Failed => tally.failed += 1,
                StepStatus::TimedOut => tally.timed_out += 1,
            }
        }
        tally
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Summary of discovered vulnerabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VulnSummary {
    pub total: usize,
    pub critical: usize,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl VulnSummary {
    pub fn from_vulns(vulns: &[Vuln]) -> Self {
        let mut summary = Self {
            total: vulns.len(),
            ..Self::default()
        };

        for vuln in vulns {
            match vuln.severity() {
                Severity::Critical => summary.critical += 1,
                Severity::High => summary.high += 1,
                Severity::Medium => summary.medium += 1,
                Severity::Low => summary.low += 1,
            }
        }

        summary
    }
}

/// Vulnerabilities ordered most severe first, then by score, then by id.
pub fn sort_vulns_by_severity(vulns: &[Vuln]) -> Vec<&Vuln> {
    let mut sorted: Vec<&Vuln> = vulns.iter().collect();
    sorted.sort_by(|a, b| {
        b.severity()
            .cmp(&a.severity())
            .then_with(|| {
                b.score()
                    .unwrap_or(0.0)
                    .partial_cmp(&a.score().unwrap_or(0.0))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
    sorted
}

/// Generate a text summary of vulnerability statistics.
pub fn generate_summary_text(summary: &VulnSummary) -> String {
    let mut lines = Vec::new();

    lines.push(format!("Total Vulnerabilities: {}", summary.total));
    lines.push(format!(
        "- {} Critical: {}",
        Severity::Critical.emoji(),
        summary.critical
    ));
    lines.push(format!("- {} High: {}", Severity::High.emoji(), summary.high));
    lines.push(format!(
        "- {} Medium: {}",
        Severity::Medium.emoji(),
        summary.medium
    ));
    lines.push(format!("- {} Low: {}", Severity::Low.emoji(), summary.low));

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StepErrorKind;
    use serde_json::json;
    use std::sync::Arc;

    fn vuln(id: &str, score: Option<f64>) -> Vuln {
        Vuln {
            id: id.to_string(),
            description: "test".to_string(),
            published: String::new(),
            v2score: None,
            v31score: score,
            additional_info: None,
            impacts: vec![],
        }
    }

    #[tokio::test]
    async fn test_concurrent_merges_are_all_recorded() {
        let aggregator = Arc::new(ResultAggregator::new(HashMap::new()));

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let aggregator = Arc::clone(&aggregator);
                tokio::spawn(async move {
                    aggregator
                        .merge(StepResult::succeeded(format!("step-{i}"), json!({ "n": i })))
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let results = aggregator.snapshot().await;
        assert_eq!(results.len(), 32);
        assert_eq!(results["step-7"].output["n"], 7);
    }

    #[tokio::test]
    async fn test_merge_overwrites_retry() {
        let aggregator = ResultAggregator::new(HashMap::new());
        aggregator
            .merge(StepResult::failed("a", StepErrorKind::Worker, "flaky"))
            .await;
        aggregator.merge(StepResult::succeeded("a", json!({}))).await;

        let results = aggregator.snapshot().await;
        assert_eq!(results.len(), 1);
        assert!(results["a"].is_success());
    }

    #[test]
    fn test_step_tally() {
        let results = vec![
            StepResult::succeeded("a", json!({})),
            StepResult::failed("b", StepErrorKind::Worker, "x"),
            StepResult::timed_out("c", None, "slow"),
            StepResult::succeeded("d", json!({})),
        ];
        let tally = StepTally::from_results(&results);
        assert_eq!(tally.succeeded, 2);
        assert_eq!(tally.failed, 1);
        assert_eq!(tally.timed_out, 1);
        assert_eq!(tally.total(), 4);
    }

    #[test]
    fn test_vuln_summary_and_sorting() {
        let vulns = vec![
            vuln("CVE-B", Some(5.0)),
            vuln("CVE-A", Some(9.8)),
            vuln("CVE-C", None),
            vuln("CVE-D", Some(7.5)),
        ];

        let summary = VulnSummary::from_vulns(&vulns);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.critical, 1);
        assert_eq!(summary.high, 1);
        assert_eq!(summary.medium, 2);

        let sorted = sort_vulns_by_severity(&vulns);
        assert_eq!(sorted[0].id, "CVE-A");
        assert_eq!(sorted[1].id, "CVE-D");
        assert_eq!(sorted[2].id, "CVE-B");
        assert_eq!(sorted[3].id, "CVE-C");
    }

    #[test]
    fn test_summary_text() {
        let text = generate_summary_text(&VulnSummary {
            total: 3,
            critical: 1,
            high: 1,
            medium: 0,
            low: 1,
        });
        assert!(text.contains("Total Vulnerabilities: 3"));
        assert!(text.contains("Critical: 1"));
    }
}
