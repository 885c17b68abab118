//! Step Registry
//!
//! Holds one [`ProcessRecord`] per dispatched step: the live handle, the
//! timers, the counters and the step's run state. The scheduler owns the
//! registry and is its only writer; the run-until evaluator reads a
//! [`LivenessSnapshot`] taken at the start of each tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use log::{debug, warn};
use serde::Serialize;

use super::pool::TaskHandle;
use crate::error::{ExecutionError, ProcessLivenessError, StepError, TimeoutTermination};

/// Lifecycle state of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Running,
    WaitingOnDependency,
    /// Foreground step that returned normally.
    Completed,
    /// Foreground step that returned an error.
    Failed,
    MaxTimeoutTerminated,
    EndOfLifeTerminated,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunState::Completed
                | RunState::Failed
                | RunState::MaxTimeoutTerminated
                | RunState::EndOfLifeTerminated
        )
    }
}

/// Runtime state of one step.
#[derive(Debug)]
pub struct ProcessRecord {
    step_id: String,
    handle: Option<TaskHandle>,
    harvested: bool,
    first_dispatched_at: Instant,
    start_time: Instant,
    started_at: DateTime<Local>,
    loop_counter: u32,
    launches: u32,
    force_terminate: bool,
    swept: bool,
    last_error: Option<StepError>,
    error_count: u32,
    liveness_reported: bool,
    timeout: Option<TimeoutTermination>,
    state: RunState,
}

impl ProcessRecord {
    fn new(step_id: &str, handle: Option<TaskHandle>, state: RunState, now: Instant) -> Self {
        Self {
            step_id: step_id.to_string(),
            handle,
            harvested: false,
            first_dispatched_at: now,
            start_time: now,
            started_at: Local::now(),
            loop_counter: 0,
            launches: 1,
            force_terminate: false,
            swept: false,
            last_error: None,
            error_count: 0,
            liveness_reported: false,
            timeout: None,
            state,
        }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn handle(&self) -> Option<&TaskHandle> {
        self.handle.as_ref()
    }

    /// Time since the step was first dispatched; this is the run-until clock.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.first_dispatched_at)
    }

    /// Time since the current launch started.
    pub fn launch_elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    pub fn started_at(&self) -> DateTime<Local> {
        self.started_at
    }

    /// Number of relaunches so far.
    pub fn loop_counter(&self) -> u32 {
        self.loop_counter
    }

    /// Number of launches including the first dispatch.
    pub fn launches(&self) -> u32 {
        self.launches
    }

    pub fn force_terminate(&self) -> bool {
        self.force_terminate
    }

    pub fn swept(&self) -> bool {
        self.swept
    }

    pub fn last_error(&self) -> Option<&StepError> {
        self.last_error.as_ref()
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    pub fn timeout(&self) -> Option<&TimeoutTermination> {
        self.timeout.as_ref()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Whether the handle is still queued or running.
    pub fn is_alive(&self) -> bool {
        self.liveness().unwrap_or(false)
    }

    fn liveness(&self) -> Result<bool, ProcessLivenessError> {
        match &self.handle {
            Some(handle) => handle.is_running(),
            None => Ok(false),
        }
    }

    /// Updates a non-terminal state. Terminal states are sticky.
    pub fn set_state(&mut self, state: RunState) {
        if self.state.is_terminal() {
            debug!(
                "Step '{}': ignoring transition {:?} -> {:?}",
                self.step_id, self.state, state
            );
            return;
        }
        self.state = state;
    }

    /// Latches `force_terminate`, cancels the live handle and marks the step timed out.
    ///
    /// Returns true if a live handle was cancelled.
    pub fn terminate_on_timeout(&mut self, now: Instant, max_time_out: Duration) -> bool {
        self.force_terminate = true;
        let killed = self.handle.as_ref().map(|h| h.cancel()).unwrap_or(false);
        self.timeout = Some(TimeoutTermination {
            step_id: self.step_id.clone(),
            elapsed: self.elapsed(now),
            max_time_out,
        });
        self.set_state(RunState::MaxTimeoutTerminated);
        killed
    }

    /// Cancels an end-of-life step's leftover handle once.
    ///
    /// Returns true if a live handle was cancelled.
    pub fn sweep(&mut self) -> bool {
        if self.swept || self.state != RunState::EndOfLifeTerminated || !self.is_alive() {
            return false;
        }
        self.swept = true;
        self.handle.as_ref().map(|h| h.cancel()).unwrap_or(false)
    }

    pub fn record_error(&mut self, error: StepError) {
        warn!("Step '{}': {}", self.step_id, error);
        self.error_count += 1;
        self.last_error = Some(error);
    }

    /// Moves a finished handle's error, if any, onto the record.
    ///
    /// Returns true when the current launch has finished and was not seen before.
    fn harvest(&mut self) -> bool {
        if self.harvested {
            return false;
        }
        let Some(handle) = &self.handle else {
            return false;
        };
        let Some(result) = handle.result_or_error() else {
            return false;
        };

        self.harvested = true;
        if let Err(error) = result {
            self.record_error(StepError::Execution(error));
        }
        true
    }
}

/// Liveness of every registered step at one instant.
#[derive(Debug, Clone, Default)]
pub struct LivenessSnapshot {
    alive: HashMap<String, bool>,
}

impl LivenessSnapshot {
    pub fn is_alive(&self, step_id: &str) -> bool {
        self.alive.get(step_id).copied().unwrap_or(false)
    }

    /// True if any of the given steps is alive.
    pub fn any_alive<'a>(&self, step_ids: impl IntoIterator<Item = &'a String>) -> bool {
        step_ids.into_iter().any(|id| self.is_alive(id))
    }

    #[cfg(test)]
    pub(crate) fn from_pairs(pairs: &[(&str, bool)]) -> Self {
        Self {
            alive: pairs.iter().map(|(id, a)| (id.to_string(), *a)).collect(),
        }
    }
}

/// A finished background launch observed by [`StepRegistry::harvest`].
#[derive(Debug, Clone, PartialEq)]
pub struct Finished {
    pub step_id: String,
    pub failed: bool,
}

/// Single-owner map from step ID to [`ProcessRecord`].
#[derive(Debug, Default)]
pub struct StepRegistry {
    records: HashMap<String, ProcessRecord>,
    order: Vec<String>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the record for a step's first dispatch.
    ///
    /// Without a handle the step ran inline and is already `Completed`.
    pub fn register(&mut self, step_id: &str, handle: Option<TaskHandle>, now: Instant) {
        let state = if handle.is_some() {
            RunState::Running
        } else {
            RunState::Completed
        };
        self.insert(ProcessRecord::new(step_id, handle, state, now));
    }

    pub fn register_completed(&mut self, step_id: &str, now: Instant) {
        self.register(step_id, None, now);
    }

    pub fn register_background(&mut self, step_id: &str, handle: TaskHandle, now: Instant) {
        self.register(step_id, Some(handle), now);
    }

    /// Records a foreground step whose inline run failed.
    pub fn register_failed(&mut self, step_id: &str, error: ExecutionError, now: Instant) {
        let mut record = ProcessRecord::new(step_id, None, RunState::Failed, now);
        record.record_error(StepError::Execution(error));
        self.insert(record);
    }

    fn insert(&mut self, record: ProcessRecord) {
        let step_id = record.step_id.clone();
        if self.records.insert(step_id.clone(), record).is_none() {
            self.order.push(step_id);
        }
    }

    pub fn get(&self, step_id: &str) -> Option<&ProcessRecord> {
        self.records.get(step_id)
    }

    pub fn get_mut(&mut self, step_id: &str) -> Option<&mut ProcessRecord> {
        self.records.get_mut(step_id)
    }

    /// Installs a relaunched handle.
    ///
    /// Any previous handle still running is cancelled first, so a step never
    /// runs twice at once. Resets `start_time` and increments `loop_counter`.
    pub fn set_handle(&mut self, step_id: &str, handle: TaskHandle, now: Instant) -> bool {
        let Some(record) = self.records.get_mut(step_id) else {
            warn!("set_handle on unknown step '{}'", step_id);
            return false;
        };

        record.harvest();
        if let Some(previous) = &record.handle {
            if previous.cancel() {
                warn!("Step '{}': replaced a handle that was still running", step_id);
            }
        }

        record.handle = Some(handle);
        record.harvested = false;
        record.liveness_reported = false;
        record.start_time = now;
        record.loop_counter += 1;
        record.launches += 1;
        true
    }

    pub fn is_alive(&self, step_id: &str) -> bool {
        self.get(step_id).map(ProcessRecord::is_alive).unwrap_or(false)
    }

    /// Checks every handle once.
    ///
    /// A handle whose state cannot be determined counts as not alive and
    /// its step records a [`ProcessLivenessError`], once per handle.
    pub fn snapshot(&mut self) -> LivenessSnapshot {
        let mut alive = HashMap::with_capacity(self.records.len());
        for (step_id, record) in self.records.iter_mut() {
            let running = match record.liveness() {
                Ok(running) => running,
                Err(e) => {
                    if !record.liveness_reported {
                        record.liveness_reported = true;
                        record.record_error(StepError::Liveness(e));
                    }
                    false
                }
            };
            alive.insert(step_id.clone(), running);
        }
        LivenessSnapshot { alive }
    }

    /// Collects launches that finished since the last call, recording their errors.
    pub fn harvest(&mut self) -> Vec<Finished> {
        let mut finished = Vec::new();
        for step_id in &self.order {
            if let Some(record) = self.records.get_mut(step_id) {
                let errors_before = record.error_count;
                if record.harvest() {
                    finished.push(Finished {
                        step_id: step_id.clone(),
                        failed: record.error_count > errors_before,
                    });
                }
            }
        }
        finished
    }

    /// True when every registered step is in a terminal state.
    pub fn all_terminal(&self) -> bool {
        self.records.values().all(|r| r.state.is_terminal())
    }

    /// Records in dispatch order.
    pub fn records(&self) -> impl Iterator<Item = &ProcessRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    /// Cancels every live handle. Returns the IDs that were cancelled.
    pub fn cancel_all(&mut self) -> Vec<String> {
        self.records()
            .filter_map(|r| r.handle.as_ref().filter(|h| h.cancel()).map(|_| r.step_id.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
