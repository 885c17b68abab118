//! Run Summary
//!
//! The per-step outcome table produced when a run finishes, and its JSON
//! report form.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Local};
use log::info;
use serde::Serialize;

use super::registry::{ProcessRecord, RunState};
use crate::error::{OrchestratorError, StepError, TimeoutTermination};

/// Final outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Completed,
    Failed,
    TimeoutTerminated,
    EndOfLifeTerminated,
    /// The run stopped before the step reached a terminal state.
    Interrupted,
}

impl StepOutcome {
    fn from_state(state: RunState) -> Self {
        match state {
            RunState::Completed => StepOutcome::Completed,
            RunState::Failed => StepOutcome::Failed,
            RunState::MaxTimeoutTerminated => StepOutcome::TimeoutTerminated,
            RunState::EndOfLifeTerminated => StepOutcome::EndOfLifeTerminated,
            RunState::Running | RunState::WaitingOnDependency => StepOutcome::Interrupted,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            StepOutcome::Completed => "COMPLETED",
            StepOutcome::Failed => "FAILED",
            StepOutcome::TimeoutTerminated => "MAX_TIMEOUT_TERMINATED",
            StepOutcome::EndOfLifeTerminated => "END_OF_LIFE_TERMINATED",
            StepOutcome::Interrupted => "INTERRUPTED",
        }
    }
}

/// One row of the summary.
#[derive(Debug, Clone, Serialize)]
pub struct StepSummary {
    pub step_id: String,
    pub background: bool,
    pub required: bool,
    pub outcome: StepOutcome,
    pub started_at: DateTime<Local>,
    pub loop_counter: u32,
    pub launches: u32,
    pub error_count: u32,
    pub last_error: Option<StepError>,
    pub timeout: Option<TimeoutTermination>,
}

impl StepSummary {
    pub(crate) fn from_record(record: &ProcessRecord, background: bool, required: bool) -> Self {
        Self {
            step_id: record.step_id().to_string(),
            background,
            required,
            outcome: StepOutcome::from_state(record.state()),
            started_at: record.started_at(),
            loop_counter: record.loop_counter(),
            launches: record.launches(),
            error_count: record.error_count(),
            last_error: record.last_error().cloned(),
            timeout: record.timeout().cloned(),
        }
    }

    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub duration: Duration,
    pub steps: Vec<StepSummary>,
}

impl RunSummary {
    pub fn get(&self, step_id: &str) -> Option<&StepSummary> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Steps that recorded an error.
    pub fn failures(&self) -> impl Iterator<Item = &StepSummary> {
        self.steps.iter().filter(|s| s.has_error())
    }

    /// False when a required step recorded an error.
    pub fn is_success(&self) -> bool {
        !self.steps.iter().any(|s| s.required && s.has_error())
    }

    /// Writes the summary as pretty-printed JSON.
    pub fn write_report(&self, path: &Path) -> Result<(), OrchestratorError> {
        let report_error = |source| OrchestratorError::Report {
            path: path.display().to_string(),
            source,
        };

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| report_error(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        fs::write(path, json).map_err(report_error)?;

        info!("Run report written to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutionError;
    use crate::workflow::Phase;
    use tempfile::tempdir;

    fn row(step_id: &str, required: bool, error: Option<&str>) -> StepSummary {
        StepSummary {
            step_id: step_id.to_string(),
            background: true,
            required,
            outcome: StepOutcome::EndOfLifeTerminated,
            started_at: Local::now(),
            loop_counter: 0,
            launches: 1,
            error_count: u32::from(error.is_some()),
            last_error: error.map(|message| {
                StepError::Execution(ExecutionError {
                    step_id: step_id.to_string(),
                    phase: Phase::Current,
                    class_name: "Sleep".to_string(),
                    method: "fail".to_string(),
                    message: message.to_string(),
                })
            }),
            timeout: None,
        }
    }

    fn summary(steps: Vec<StepSummary>) -> RunSummary {
        RunSummary {
            started_at: Local::now(),
            finished_at: Local::now(),
            duration: Duration::from_millis(5),
            steps,
        }
    }

    #[test]
    fn test_optional_step_error_is_success() {
        let s = summary(vec![row("a", false, Some("boom")), row("b", true, None)]);
        assert!(s.is_success());
        assert_eq!(s.failures().count(), 1);
    }

    #[test]
    fn test_required_step_error_fails_run() {
        let s = summary(vec![row("a", true, Some("boom"))]);
        assert!(!s.is_success());
    }

    #[test]
    fn test_get_by_step_id() {
        let s = summary(vec![row("a", false, None), row("b", false, None)]);
        assert_eq!(s.get("b").unwrap().step_id, "b");
        assert!(s.get("c").is_none());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            StepOutcome::from_state(RunState::MaxTimeoutTerminated).label(),
            "MAX_TIMEOUT_TERMINATED"
        );
        assert_eq!(
            StepOutcome::from_state(RunState::WaitingOnDependency),
            StepOutcome::Interrupted
        );
    }

    #[test]
    fn test_write_report() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.json");
        summary(vec![row("stress", true, Some("link down"))])
            .write_report(&path)
            .unwrap();

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["steps"][0]["step_id"], "stress");
        assert_eq!(json["steps"][0]["outcome"], "end_of_life_terminated");
        assert_eq!(json["steps"][0]["last_error"]["kind"], "execution");
        assert_eq!(json["steps"][0]["last_error"]["message"], "link down");
    }

    #[test]
    fn test_write_report_bad_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing").join("report.json");
        let err = summary(vec![]).write_report(&path).unwrap_err();
        assert!(matches!(err, OrchestratorError::Report { .. }));
    }
}
