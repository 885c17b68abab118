//! crossflow - Run-Until Workflow Orchestrator
//!
//! Runs a declarative list of steps, each invoking one or more executable
//! units. Foreground steps run inline and block; background steps run on a
//! bounded worker pool and are relaunched or retired by their run-until
//! policy until every step is terminal.
//!
//! # Architecture
//!
//! - [`workflow`]: step model, document parsing and validation
//! - [`executables`]: the unit contract, the registry and built-in units
//! - [`execution`]: dispatcher, worker pool, run-until rules and scheduler
//! - [`monitoring`]: execution timeline
//! - [`config`]: runtime settings from the environment
//! - [`error`]: error taxonomy
//!
//! # Example
//!
//! ```rust,no_run
//! use crossflow::config::Settings;
//! use crossflow::executables::ExecutableRegistry;
//! use crossflow::{load_workflow, Scheduler};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let workflow = load_workflow("Seamless_new.json")?;
//!
//!     let mut scheduler = Scheduler::new(workflow, ExecutableRegistry::with_builtins());
//!     scheduler.apply_settings(&Settings::from_env());
//!
//!     let summary = scheduler.run()?;
//!     for step in summary.failures() {
//!         eprintln!("{} failed", step.step_id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod executables;
pub mod execution;
pub mod monitoring;
pub mod workflow;

// Re-export commonly used types
pub use error::OrchestratorError;
pub use execution::scheduler::Scheduler;
pub use execution::summary::RunSummary;
pub use workflow::model::{Step, Workflow};
pub use workflow::parser::load_workflow;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "crossflow";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executables::ExecutableRegistry;
    use crate::workflow::ExecutableDescriptor;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    const DOCUMENT: &str = r#"[
  { "step_id": "boot", "executable": { "current_executable": [
      { "executable_path": "builtin.timer", "class_name": "Sleep", "entry_method_name": "run", "arguments": ["0"] } ] } },
  { "step_id": "soak", "execute_in_background": true, "executable": { "current_executable": [
      { "executable_path": "builtin.timer", "class_name": "Sleep", "entry_method_name": "run", "arguments": ["0"] } ] } }
]"#;

    #[test]
    fn test_app_name() {
        assert_eq!(APP_NAME, "crossflow");
    }

    #[test]
    fn test_module_exports_step() {
        let step = Step::new("boot", ExecutableDescriptor::new("builtin.timer", "Sleep", "run"));
        assert_eq!(step.id, "boot");
        assert!(!step.execute_in_background);
    }

    #[test]
    fn test_module_exports_workflow() {
        let workflow = Workflow::new();
        assert!(workflow.is_empty());
    }

    #[test]
    fn test_load_workflow_and_run_scheduler() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("workflow.json");
        fs::write(&path, DOCUMENT).unwrap();

        let workflow = load_workflow(&path).unwrap();
        assert_eq!(workflow.len(), 2);

        let mut scheduler = Scheduler::new(workflow, ExecutableRegistry::with_builtins());
        scheduler.set_tick_interval(Duration::from_millis(10));
        let summary: RunSummary = scheduler.run().unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.steps.len(), 2);
        assert!(summary.get("soak").unwrap().background);
    }

    #[test]
    fn test_load_workflow_missing_file() {
        let dir = tempdir().unwrap();
        let err = OrchestratorError::from(load_workflow(dir.path().join("absent.json")).unwrap_err());
        assert!(matches!(err, OrchestratorError::Config(_)));
    }
}
