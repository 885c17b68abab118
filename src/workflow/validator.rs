//! Workflow Validation
//!
//! Structural checks run after parsing:
//! - Workflow is not empty
//! - Step IDs are unique
//! - Run-until dependencies reference existing steps (and not the step itself)
//!
//! Policy combinations that are legal but suspicious are reported as warnings.

use std::collections::HashSet;

use log::{debug, info, warn};

use super::model::{Step, Workflow};
use crate::error::ConfigError;

/// Validates the entire workflow structure.
///
/// Declaration order is preserved; it is the dispatch order.
pub fn validate_workflow(workflow: &Workflow) -> Result<(), ConfigError> {
    info!("Validating workflow with {} steps", workflow.len());

    if workflow.is_empty() {
        return Err(ConfigError::EmptyWorkflow);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in &workflow.steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ConfigError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in &workflow.steps {
        for reference in &step.run_until.depends_on {
            if *reference == step.id {
                return Err(ConfigError::SelfDependency(step.id.clone()));
            }
            if !seen_ids.contains(reference.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    step: step.id.clone(),
                    reference: reference.clone(),
                });
            }
        }

        warn_on_policy(step);
    }

    info!(
        "Workflow validated: {} steps ({} background)",
        workflow.len(),
        workflow.background_steps().count()
    );
    Ok(())
}

/// Logs policy combinations that are accepted but likely unintended.
fn warn_on_policy(step: &Step) {
    let policy = &step.run_until;

    if !step.execute_in_background {
        if policy.loop_limit > 0 || !policy.depends_on.is_empty() || !policy.end_of_life {
            warn!(
                "Step '{}': run_until is ignored for foreground steps",
                step.id
            );
        }
        return;
    }

    match step.max_time_out {
        None if !policy.end_of_life => {
            warn!(
                "Step '{}': end_of_life is false and no max_time_out is set; it will relaunch forever",
                step.id
            );
        }
        Some(max) if policy.min_time_out > max => {
            warn!(
                "Step '{}': min_time_out {:?} exceeds max_time_out {:?}; max_time_out wins",
                step.id, policy.min_time_out, max
            );
        }
        _ => {}
    }

    if policy.depends_on.is_empty() {
        debug!("Step '{}' has no run_until dependencies", step.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ExecutableDescriptor, RunUntilPolicy};
    use std::time::Duration;

    fn unit() -> ExecutableDescriptor {
        ExecutableDescriptor::new("builtin.timer", "Sleep", "run")
    }

    fn depending_on(id: &str, deps: &[&str]) -> Step {
        Step::new(id, unit()).in_background().with_run_until(RunUntilPolicy {
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            ..RunUntilPolicy::default()
        })
    }

    #[test]
    fn test_validate_empty_workflow() {
        let err = validate_workflow(&Workflow::new()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyWorkflow));
    }

    #[test]
    fn test_validate_duplicate_ids() {
        let workflow = Workflow::from_steps(vec![Step::new("a", unit()), Step::new("a", unit())]);
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStepId(id) if id == "a"));
    }

    #[test]
    fn test_validate_unknown_dependency() {
        let workflow = Workflow::from_steps(vec![depending_on("a", &["ghost"])]);
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(err.to_string().contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_validate_self_dependency() {
        let workflow = Workflow::from_steps(vec![depending_on("a", &["a"])]);
        let err = validate_workflow(&workflow).unwrap_err();
        assert!(matches!(err, ConfigError::SelfDependency(_)));
    }

    #[test]
    fn test_validate_forward_dependency_allowed() {
        // Dependencies may point at steps declared later.
        let workflow = Workflow::from_steps(vec![
            depending_on("a", &["b"]),
            Step::new("b", unit()).in_background(),
        ]);
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn test_validate_conflicting_timeouts_is_not_an_error() {
        let step = Step::new("a", unit())
            .in_background()
            .with_max_time_out(Duration::from_secs(60))
            .with_run_until(RunUntilPolicy {
                min_time_out: Duration::from_secs(300),
                ..RunUntilPolicy::default()
            });
        assert!(validate_workflow(&Workflow::from_steps(vec![step])).is_ok());
    }
}
