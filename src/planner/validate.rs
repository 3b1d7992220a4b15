//! Structural checks on a plan returned by the reasoning backend.

use crate::models::Plan;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Why a plan was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanDefect {
    #[error("plan has {count} steps, the limit is {max}")]
    TooManySteps { count: usize, max: usize },

    #[error("step #{index} has an empty id")]
    EmptyId { index: usize },

    #[error("duplicate step id `{0}`")]
    DuplicateId(String),

    #[error("step `{step}` depends on unknown step `{dependency}`")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error(
        "step `{step}` (stage {stage}) depends on `{dependency}` (stage {dependency_stage}); dependencies must sit on an earlier stage"
    )]
    StageOrder {
        step: String,
        stage: u32,
        dependency: String,
        dependency_stage: u32,
    },
}

/// Check ids, dependency references, acyclicity and stage ordering.
pub fn validate_plan(plan: &Plan, max_steps: usize) -> Result<(), PlanDefect> {
    if plan.steps.len() > max_steps {
        return Err(PlanDefect::TooManySteps {
            count: plan.steps.len(),
            max: max_steps,
        });
    }

    let mut stages: HashMap<&str, u32> = HashMap::with_capacity(plan.steps.len());
    for (index, step) in plan.steps.iter().enumerate() {
        if step.id.trim().is_empty() {
            return Err(PlanDefect::EmptyId { index });
        }
        if stages.insert(step.id.as_str(), step.stage).is_some() {
            return Err(PlanDefect::DuplicateId(step.id.clone()));
        }
    }

    for step in &plan.steps {
        for dependency in &step.depends_on {
            if !stages.contains_key(dependency.as_str()) {
                return Err(PlanDefect::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }

    if let Some(cycle) = find_cycle(plan) {
        return Err(PlanDefect::Cycle(cycle));
    }

    for step in &plan.steps {
        for dependency in &step.depends_on {
            let dependency_stage = stages[dependency.as_str()];
            if dependency_stage >= step.stage {
                return Err(PlanDefect::StageOrder {
                    step: step.id.clone(),
                    stage: step.stage,
                    dependency: dependency.clone(),
                    dependency_stage,
                });
            }
        }
    }

    Ok(())
}

/// Depth-first search over `depends_on` edges. Returns the ids along the
/// first cycle found, closing back on its starting id.
fn find_cycle(plan: &Plan) -> Option<Vec<String>> {
    let edges: HashMap<&str, Vec<&str>> = plan
        .steps
        .iter()
        .map(|s| (s.id.as_str(), s.depends_on.iter().map(String::as_str).collect()))
        .collect();

    let mut done: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();

    fn visit<'a>(
        node: &'a str,
        edges: &HashMap<&'a str, Vec<&'a str>>,
        done: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        if let Some(pos) = path.iter().position(|n| *n == node) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if done.contains(node) {
            return None;
        }

        path.push(node);
        for next in edges.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(cycle) = visit(*next, edges, done, path) {
                return Some(cycle);
            }
        }
        path.pop();
        done.insert(node);
        None
    }

    for step in &plan.steps {
        if let Some(cycle) = visit(step.id.as_str(), &edges, &mut done, &mut path) {
            return Some(cycle);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Step, StepType};

    fn step(id: &str, stage: u32, deps: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            step_type: StepType::VulnDiscovery,
            title: id.to_string(),
            description: String::new(),
            target: "10.0.0.5".to_string(),
            stage,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            critical: false,
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            reasoning: String::new(),
            steps,
            has_enough_context: false,
            finish_plan: false,
            clarification: None,
        }
    }

    #[test]
    fn test_valid_three_stage_plan() {
        let p = plan(vec![
            step("asset", 1, &[]),
            step("discover", 2, &["asset"]),
            step("report", 3, &["discover"]),
        ]);
        assert_eq!(validate_plan(&p, 6), Ok(()));
    }

    #[test]
    fn test_equal_stage_dependency_rejected() {
        let p = plan(vec![step("a", 1, &[]), step("b", 1, &["a"])]);
        assert!(matches!(
            validate_plan(&p, 6),
            Err(PlanDefect::StageOrder { dependency_stage: 1, stage: 1, .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let p = plan(vec![step("a", 0, &[]), step("a", 1, &[])]);
        assert_eq!(validate_plan(&p, 6), Err(PlanDefect::DuplicateId("a".into())));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let p = plan(vec![step("a", 1, &["ghost"])]);
        assert!(matches!(
            validate_plan(&p, 6),
            Err(PlanDefect::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_reported_before_stage_order() {
        let p = plan(vec![step("a", 2, &["b"]), step("b", 1, &["a"])]);
        match validate_plan(&p, 6) {
            Err(PlanDefect::Cycle(ids)) => {
                assert_eq!(ids.first(), ids.last());
                assert!(ids.contains(&"a".to_string()));
                assert!(ids.contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }

        let p = plan(vec![step("self", 1, &["self"])]);
        assert!(matches!(validate_plan(&p, 6), Err(PlanDefect::Cycle(_))));
    }

    #[test]
    fn test_step_limit_and_empty_id() {
        let p = plan((0..4).map(|i| step(&format!("s{i}"), 0, &[])).collect());
        assert_eq!(
            validate_plan(&p, 3),
            Err(PlanDefect::TooManySteps { count: 4, max: 3 })
        );

        let p = plan(vec![step(" ", 0, &[])]);
        assert_eq!(validate_plan(&p, 3), Err(PlanDefect::EmptyId { index: 0 }));
    }

    #[test]
    fn test_empty_plan_is_valid() {
        assert_eq!(validate_plan(&plan(vec![]), 1), Ok(()));
    }
}
