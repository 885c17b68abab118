//! Error Types
//!
//! The orchestrator distinguishes five failure families:
//!
//! - [`ConfigError`]: the workflow document is malformed
//! - [`DependencyError`]: an executable descriptor cannot be resolved
//! - [`ExecutionError`]: a unit failed inside `prepare()` or its entry method
//! - [`TimeoutTermination`]: a step was killed on `max_time_out`
//! - [`ProcessLivenessError`]: a handle's state could not be determined
//!
//! [`OrchestratorError`] wraps the ones that can abort a run.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::workflow::Phase;

/// Malformed workflow document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read workflow file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse workflow document: {0}")]
    Parse(String),

    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Step #{index} has no step_id")]
    MissingStepId { index: usize },

    #[error("Duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    #[error("Step '{0}' has no current_executable entry")]
    MissingCurrentExecutable(String),

    #[error("Step '{step}': {phase} executable #{index} is missing '{field}'")]
    IncompleteDescriptor {
        step: String,
        phase: Phase,
        index: usize,
        field: &'static str,
    },

    #[error("Step '{step}': invalid {field} value '{value}' (expected minutes)")]
    InvalidDuration {
        step: String,
        field: &'static str,
        value: String,
    },

    #[error("Step '{step}' references unknown step '{reference}'")]
    UnknownDependency { step: String, reference: String },

    #[error("Step '{0}' cannot depend on itself")]
    SelfDependency(String),
}

/// An executable descriptor that does not resolve to a registered unit.
#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("Step '{step}': no executable registered for class '{class_name}' in '{path}'")]
    UnknownClass {
        step: String,
        path: String,
        class_name: String,
    },

    #[error("Step '{step}': class '{class_name}' has no entry method '{method}'")]
    UnknownMethod {
        step: String,
        class_name: String,
        method: String,
    },
}

/// A failure raised by a unit while it was being constructed, prepared or run.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("Step '{step_id}' failed in {phase} {class_name}.{method}: {message}")]
pub struct ExecutionError {
    pub step_id: String,
    pub phase: Phase,
    pub class_name: String,
    pub method: String,
    pub message: String,
}

/// Forced termination of a step that outlived its `max_time_out`.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("Step '{step_id}' terminated after {elapsed:?} (max_time_out {max_time_out:?})")]
pub struct TimeoutTermination {
    pub step_id: String,
    pub elapsed: Duration,
    pub max_time_out: Duration,
}

/// A handle whose running state cannot be observed.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[error("Cannot determine liveness of step '{step_id}': {reason}")]
pub struct ProcessLivenessError {
    pub step_id: String,
    pub reason: String,
}

/// Failure recorded on a step without aborting the run.
#[derive(Debug, Clone, Error, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    #[error(transparent)]
    Execution(ExecutionError),

    #[error(transparent)]
    Liveness(ProcessLivenessError),
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Dependency(#[from] DependencyError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("Failed to start worker pool: {0}")]
    WorkerPool(#[source] std::io::Error),

    #[error("Failed to write run report '{path}': {source}")]
    Report {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
