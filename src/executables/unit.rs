//! Executable Unit Contract
//!
//! Every unit a workflow can invoke implements [`Executable`]: it is
//! constructed from a [`UnitContext`], prepared, then driven through its
//! entry method by name.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use thiserror::Error;

/// Granularity of cancellable sleeps.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Failure reported by a unit.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct UnitError {
    pub message: String,
}

impl UnitError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for UnitError {
    fn from(err: std::io::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// A unit of work invoked by the dispatcher.
///
/// `prepare()` runs once per construction, before the entry method.
pub trait Executable: Send {
    fn prepare(&mut self) -> Result<(), UnitError> {
        Ok(())
    }

    /// Runs the named entry method.
    fn run(&mut self, method: &str) -> Result<(), UnitError>;
}

/// Cooperative cancellation flag shared between a handle and its unit.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Sleeps for `duration` unless cancelled first.
    ///
    /// Returns `false` when the sleep was cut short by cancellation.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(CANCEL_POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Run-wide context shared by every unit.
#[derive(Debug, Clone)]
pub struct SharedContext {
    /// Workflow document this run was loaded from
    pub workflow_path: PathBuf,

    /// Directory units should run in, if not the current one
    pub working_dir: Option<PathBuf>,

    /// Wall-clock start of the run
    pub started_at: DateTime<Local>,
}

impl SharedContext {
    pub fn new(workflow_path: impl Into<PathBuf>) -> Self {
        Self {
            workflow_path: workflow_path.into(),
            working_dir: None,
            started_at: Local::now(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// Everything a unit receives at construction.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub step_id: String,
    pub arguments: Vec<String>,
    pub shared: Arc<SharedContext>,
    pub cancel: CancelToken,
}
