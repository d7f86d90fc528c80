//! Publish-time validation of a definition's step graph.
//!
//! Every `on_*` reference and decision route must resolve, every step must be
//! reachable from the entry step, and the graph must terminate: cycles are
//! rejected unless every cycle passes through a step with a declared
//! `max_visits` loop bound (which the coordinator enforces at runtime).

use std::collections::{HashMap, HashSet};

use super::template::{DefinitionDraft, StepDefinition, StepType, TransitionTarget};
use crate::error::{ConductorError, Result};

/// Validate a draft before it is frozen into a published version
pub fn validate_draft(draft: &DefinitionDraft) -> Result<()> {
    if draft.name.trim().is_empty() {
        return Err(ConductorError::ValidationError(
            "definition name must not be empty".to_string(),
        ));
    }
    if draft.steps.is_empty() {
        return Err(ConductorError::ValidationError(format!(
            "definition '{}' declares no steps",
            draft.name
        )));
    }

    let mut ids = HashSet::new();
    for step in &draft.steps {
        if !ids.insert(step.step_id.as_str()) {
            return Err(ConductorError::ValidationError(format!(
                "duplicate step id '{}'",
                step.step_id
            )));
        }
    }

    let entry = draft.entry().ok_or_else(|| {
        ConductorError::ValidationError("definition has no entry step".to_string())
    })?;
    if !ids.contains(entry) {
        return Err(ConductorError::ValidationError(format!(
            "entry step '{entry}' does not exist"
        )));
    }

    for step in &draft.steps {
        validate_step(step, &ids)?;
    }

    let adjacency = build_adjacency(&draft.steps);
    check_reachability(entry, &adjacency, &ids)?;
    check_termination(draft, entry, &adjacency)?;

    Ok(())
}

fn validate_step(step: &StepDefinition, ids: &HashSet<&str>) -> Result<()> {
    let sid = &step.step_id;

    if sid.trim().is_empty() {
        return Err(ConductorError::ValidationError(
            "step id must not be empty".to_string(),
        ));
    }

    match (step.step_type.requires_handler(), &step.handler) {
        (true, None) => {
            return Err(ConductorError::ValidationError(format!(
                "step '{sid}' ({:?}) requires a handler reference",
                step.step_type
            )))
        }
        (true, Some(handler)) if handler.trim().is_empty() => {
            return Err(ConductorError::ValidationError(format!(
                "step '{sid}' declares an empty handler reference"
            )))
        }
        (false, Some(_)) => {
            return Err(ConductorError::ValidationError(format!(
                "step '{sid}' ({:?}) must not declare a handler",
                step.step_type
            )))
        }
        _ => {}
    }

    if step.step_type == StepType::Wait && step.wait_ms.is_none() {
        return Err(ConductorError::ValidationError(format!(
            "wait step '{sid}' must declare wait_ms"
        )));
    }
    if step.step_type == StepType::Decision && step.routes.is_empty() {
        return Err(ConductorError::ValidationError(format!(
            "decision step '{sid}' must declare at least one route"
        )));
    }

    if step.timeout_ms == 0 {
        return Err(ConductorError::ValidationError(format!(
            "step '{sid}' declares a zero timeout"
        )));
    }

    let policy = &step.retry_policy;
    if policy.max_attempts == 0 {
        return Err(ConductorError::ValidationError(format!(
            "step '{sid}' declares max_attempts = 0"
        )));
    }
    if policy.initial_delay_ms > policy.max_delay_ms {
        return Err(ConductorError::ValidationError(format!(
            "step '{sid}' declares initial_delay_ms greater than max_delay_ms"
        )));
    }
    for class in &policy.retry_on_classes {
        if !class.is_auto_recoverable() {
            return Err(ConductorError::ValidationError(format!(
                "step '{sid}' lists non-recoverable class {class} in retry_on_classes"
            )));
        }
    }

    for (label, target) in [
        ("on_success", &step.on_success),
        ("on_failure", &step.on_failure),
        ("on_timeout", &step.on_timeout),
    ] {
        if let Some(TransitionTarget::Step(next)) = target {
            if !ids.contains(next.as_str()) {
                return Err(ConductorError::ValidationError(format!(
                    "step '{sid}' {label} references unknown step '{next}'"
                )));
            }
        }
    }
    for (route, next) in &step.routes {
        if !ids.contains(next.as_str()) {
            return Err(ConductorError::ValidationError(format!(
                "decision step '{sid}' route '{route}' references unknown step '{next}'"
            )));
        }
    }

    Ok(())
}

fn build_adjacency(steps: &[StepDefinition]) -> HashMap<&str, Vec<&str>> {
    let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        let edges = adjacency.entry(step.step_id.as_str()).or_default();
        for target in [&step.on_success, &step.on_failure, &step.on_timeout]
            .into_iter()
            .flatten()
        {
            if let Some(next) = target.step_id() {
                edges.push(next);
            }
        }
        for next in step.routes.values() {
            edges.push(next.as_str());
        }
    }
    adjacency
}

fn check_reachability(
    entry: &str,
    adjacency: &HashMap<&str, Vec<&str>>,
    ids: &HashSet<&str>,
) -> Result<()> {
    let mut seen = HashSet::new();
    let mut stack = vec![entry];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if let Some(edges) = adjacency.get(node) {
            for &next in edges {
                stack.push(next);
            }
        }
    }

    for id in ids {
        if !seen.contains(id) {
            return Err(ConductorError::ValidationError(format!(
                "step '{id}' is unreachable from the entry step"
            )));
        }
    }
    Ok(())
}

/// Reject required cycles: every cycle must pass through a bounded step
fn check_termination(
    draft: &DefinitionDraft,
    entry: &str,
    adjacency: &HashMap<&str, Vec<&str>>,
) -> Result<()> {
    let bounded: HashSet<&str> = draft
        .steps
        .iter()
        .filter(|s| s.max_visits.is_some_and(|n| n >= 2))
        .map(|s| s.step_id.as_str())
        .collect();

    let mut visited = HashSet::new();
    let mut on_path: Vec<&str> = Vec::new();
    dfs_cycles(entry, adjacency, &bounded, &mut visited, &mut on_path)
}

fn dfs_cycles<'a>(
    node: &'a str,
    adjacency: &HashMap<&'a str, Vec<&'a str>>,
    bounded: &HashSet<&str>,
    visited: &mut HashSet<&'a str>,
    on_path: &mut Vec<&'a str>,
) -> Result<()> {
    if let Some(pos) = on_path.iter().position(|n| *n == node) {
        let cycle = &on_path[pos..];
        if cycle.iter().any(|n| bounded.contains(n)) {
            return Ok(());
        }
        return Err(ConductorError::ValidationError(format!(
            "unbounded cycle through steps: {}",
            cycle.join(" -> ")
        )));
    }
    if visited.contains(node) {
        return Ok(());
    }

    on_path.push(node);
    if let Some(edges) = adjacency.get(node) {
        for &next in edges {
            dfs_cycles(next, adjacency, bounded, visited, on_path)?;
        }
    }
    on_path.pop();
    visited.insert(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::template::{DefinitionDraft, StepDefinition, TransitionTarget};
    use std::collections::HashMap;

    fn linear_draft() -> DefinitionDraft {
        DefinitionDraft::new(
            "billing",
            vec![
                StepDefinition::task("issue_invoice", "invoices").then("notify_client"),
                StepDefinition::task("notify_client", "mailer"),
            ],
        )
    }

    #[test]
    fn test_valid_linear_draft() {
        assert!(validate_draft(&linear_draft()).is_ok());
    }

    #[test]
    fn test_empty_draft_rejected() {
        let draft = DefinitionDraft::new("empty", vec![]);
        assert!(validate_draft(&draft).is_err());
    }

    #[test]
    fn test_duplicate_step_ids_rejected() {
        let draft = DefinitionDraft::new(
            "dup",
            vec![
                StepDefinition::task("a", "h1"),
                StepDefinition::task("a", "h2"),
            ],
        );
        let err = validate_draft(&draft).unwrap_err();
        assert!(err.to_string().contains("duplicate step id"));
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut draft = linear_draft();
        draft.steps[1].on_failure = Some(TransitionTarget::Step("missing".to_string()));
        let err = validate_draft(&draft).unwrap_err();
        assert!(err.to_string().contains("unknown step 'missing'"));
    }

    #[test]
    fn test_unreachable_step_rejected() {
        let mut draft = linear_draft();
        draft.steps.push(StepDefinition::task("orphan", "noop"));
        let err = validate_draft(&draft).unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_missing_handler_rejected() {
        let mut draft = linear_draft();
        draft.steps[0].handler = None;
        assert!(validate_draft(&draft).is_err());
    }

    #[test]
    fn test_wait_step_requires_delay() {
        let mut step = StepDefinition::wait("cooldown", 100);
        step.wait_ms = None;
        let draft = DefinitionDraft::new("waits", vec![step]);
        assert!(validate_draft(&draft).is_err());
    }

    #[test]
    fn test_decision_routes_must_resolve() {
        let mut routes = HashMap::new();
        routes.insert("small".to_string(), "missing".to_string());
        let draft = DefinitionDraft::new(
            "route",
            vec![StepDefinition::decision("triage", "triager", routes)],
        );
        assert!(validate_draft(&draft).is_err());
    }

    #[test]
    fn test_unbounded_cycle_rejected() {
        let draft = DefinitionDraft::new(
            "loops",
            vec![
                StepDefinition::task("a", "h").then("b"),
                StepDefinition::task("b", "h").then("a"),
            ],
        );
        let err = validate_draft(&draft).unwrap_err();
        assert!(err.to_string().contains("unbounded cycle"));
    }

    #[test]
    fn test_bounded_cycle_allowed() {
        let mut polling = StepDefinition::task("poll", "poller").then("check");
        polling.max_visits = Some(5);
        let draft = DefinitionDraft::new(
            "poll_loop",
            vec![polling, StepDefinition::task("check", "checker").then("poll")],
        );
        assert!(validate_draft(&draft).is_ok());
    }

    #[test]
    fn test_non_recoverable_retry_class_rejected() {
        let mut draft = linear_draft();
        draft.steps[0]
            .retry_policy
            .retry_on_classes
            .push(crate::classifier::ErrorClass::NonRetryable);
        assert!(validate_draft(&draft).is_err());
    }
}
