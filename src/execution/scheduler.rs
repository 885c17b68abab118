//! Workflow Scheduler
//!
//! Drives a run from start to finish:
//!
//! 1. Preflight: every executable descriptor must resolve
//! 2. Dispatch phase: steps in declaration order, foreground steps blocking
//! 3. Run-until phase: once per tick, snapshot liveness, harvest finished
//!    launches, evaluate every live background step and apply the verdicts
//! 4. Final sweep: cancel end-of-life steps whose handle is still running,
//!    then harvest launches that returned after the last tick
//! 5. Summary
//!
//! The scheduler is the only writer of the [`StepRegistry`].

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use chrono::Local;
use log::{debug, error, info, warn};

use super::dispatcher::{Dispatched, Dispatcher};
use super::pool::WorkerPool;
use super::registry::{RunState, StepRegistry};
use super::run_until::{Action, RunUntilEvaluator, Verdict};
use super::summary::{RunSummary, StepSummary};
use crate::config::Settings;
use crate::error::OrchestratorError;
use crate::executables::{ExecutableRegistry, SharedContext};
use crate::monitoring::{EventType, ExecutionTimeline};
use crate::workflow::{Step, Workflow};

/// Runs a workflow under its run-until policies.
///
/// # Example
///
/// ```rust,no_run
/// use crossflow::config::Settings;
/// use crossflow::executables::ExecutableRegistry;
/// use crossflow::execution::Scheduler;
/// use crossflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("Seamless_new.json")?;
///     let mut scheduler = Scheduler::new(workflow, ExecutableRegistry::with_builtins());
///     scheduler.apply_settings(&Settings::from_env());
///
///     let summary = scheduler.run()?;
///     println!("{} steps, success: {}", summary.steps.len(), summary.is_success());
///     Ok(())
/// }
/// ```
pub struct Scheduler {
    workflow: Workflow,
    executables: Arc<ExecutableRegistry>,
    shared: Arc<SharedContext>,
    settings: Settings,
    evaluator: RunUntilEvaluator,
    records: StepRegistry,
    timeline: ExecutionTimeline,
}

impl Scheduler {
    pub fn new(workflow: Workflow, executables: ExecutableRegistry) -> Self {
        Self {
            workflow,
            executables: Arc::new(executables),
            shared: Arc::new(SharedContext::new("")),
            settings: Settings::default(),
            evaluator: RunUntilEvaluator::new(),
            records: StepRegistry::new(),
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Takes tick interval, pool bound and working directory from `settings`.
    pub fn apply_settings(&mut self, settings: &Settings) {
        self.settings = settings.clone();
        if let Some(dir) = &settings.working_dir {
            let mut shared = (*self.shared).clone();
            shared.working_dir = Some(dir.clone());
            self.shared = Arc::new(shared);
        }
    }

    /// Sets the run-wide context handed to every unit.
    pub fn set_shared_context(&mut self, shared: SharedContext) {
        self.shared = Arc::new(shared);
    }

    pub fn set_tick_interval(&mut self, tick: std::time::Duration) {
        self.settings.tick_interval = tick;
    }

    pub fn set_max_workers(&mut self, max: usize) {
        self.settings.max_workers = Some(max);
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }

    pub fn records(&self) -> &StepRegistry {
        &self.records
    }

    /// Executes the workflow.
    ///
    /// # Returns
    ///
    /// * `Ok(summary)` - every step reached a terminal state; background
    ///   failures are listed in the summary
    /// * `Err` - preflight failed or a foreground step failed
    pub fn run(&mut self) -> Result<RunSummary, OrchestratorError> {
        let started_at = Local::now();
        let start = Instant::now();
        self.records = StepRegistry::new();
        self.timeline = ExecutionTimeline::new();

        let background = self.workflow.background_steps().count();
        let pool = WorkerPool::new(self.settings.pool_size(background)).map_err(OrchestratorError::WorkerPool)?;
        let dispatcher = Dispatcher::new(Arc::clone(&self.executables), Arc::clone(&self.shared), pool);

        dispatcher.preflight(&self.workflow)?;

        info!(
            "Starting run: {} steps ({} background), {} workers, tick {:?}",
            self.workflow.len(),
            background,
            dispatcher.pool_size(),
            self.settings.tick_interval
        );

        self.dispatch_all(&dispatcher)?;
        self.supervise(&dispatcher);
        self.final_sweep();
        self.harvest_finished();

        let summary = self.summarize(started_at, start);
        info!("Run finished in {:.2?}", summary.duration);
        Ok(summary)
    }

    /// Dispatches every step once, in declaration order.
    fn dispatch_all(&mut self, dispatcher: &Dispatcher) -> Result<(), OrchestratorError> {
        for step in &self.workflow.steps {
            let now = Instant::now();
            self.timeline.add_event(&step.id, EventType::Dispatched);

            match dispatcher.dispatch(step) {
                Ok(Dispatched::Completed) => {
                    info!("Step '{}' completed", step.id);
                    self.records.register_completed(&step.id, now);
                    self.timeline.add_event(&step.id, EventType::Completed);
                }
                Ok(Dispatched::Background(handle)) => {
                    self.records.register_background(&step.id, handle, now);
                }
                Err(e) => {
                    error!("Foreground step '{}' failed: {}", step.id, e);
                    self.records.register_failed(&step.id, e.clone(), now);
                    self.timeline.add_event(&step.id, EventType::Failed);
                    for cancelled in self.records.cancel_all() {
                        warn!("Cancelled background step '{}'", cancelled);
                        self.timeline.add_event(&cancelled, EventType::Cancelled);
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Ticks until every step is terminal.
    fn supervise(&mut self, dispatcher: &Dispatcher) {
        let mut ticks: u64 = 0;
        while !self.records.all_terminal() {
            thread::sleep(self.settings.tick_interval);
            ticks += 1;
            self.tick(dispatcher);
        }
        debug!("Run-until phase finished after {} ticks", ticks);
    }

    fn tick(&mut self, dispatcher: &Dispatcher) {
        let snapshot = self.records.snapshot();
        self.harvest_finished();

        let now = Instant::now();
        for step in self.workflow.background_steps() {
            let Some(record) = self.records.get(&step.id) else {
                continue;
            };
            if record.state().is_terminal() {
                continue;
            }

            let verdict = self.evaluator.evaluate(step, record, &snapshot, now);
            apply(&mut self.records, &mut self.timeline, dispatcher, step, verdict, now);
        }
    }

    fn harvest_finished(&mut self) {
        for finished in self.records.harvest() {
            let event = if finished.failed {
                EventType::Failed
            } else {
                EventType::Finished
            };
            self.timeline.add_event(&finished.step_id, event);
        }
    }

    /// Cancels leftover handles of end-of-life steps, once each.
    fn final_sweep(&mut self) {
        let retired: Vec<String> = self
            .records
            .records()
            .filter(|r| r.state() == RunState::EndOfLifeTerminated && !r.swept())
            .map(|r| r.step_id().to_string())
            .collect();

        for step_id in retired {
            let Some(record) = self.records.get_mut(&step_id) else {
                continue;
            };
            if record.sweep() {
                info!("Final sweep: cancelled step '{}'", step_id);
                self.timeline.add_event(&step_id, EventType::Cancelled);
            }
        }
    }

    fn summarize(&self, started_at: chrono::DateTime<Local>, start: Instant) -> RunSummary {
        let steps: Vec<StepSummary> = self
            .workflow
            .steps
            .iter()
            .filter_map(|step| {
                self.records
                    .get(&step.id)
                    .map(|r| StepSummary::from_record(r, step.execute_in_background, step.required))
            })
            .collect();

        for failed in steps.iter().filter(|s| s.has_error()) {
            if let Some(err) = &failed.last_error {
                warn!("Step '{}' finished with {} error(s); last: {}", failed.step_id, failed.error_count, err);
            }
        }

        RunSummary {
            started_at,
            finished_at: Local::now(),
            duration: start.elapsed(),
            steps,
        }
    }
}

/// Applies one verdict to a step's record.
fn apply(
    records: &mut StepRegistry,
    timeline: &mut ExecutionTimeline,
    dispatcher: &Dispatcher,
    step: &Step,
    verdict: Verdict,
    now: Instant,
) {
    let Some(record) = records.get_mut(&step.id) else {
        return;
    };
    let previous = record.state();

    match verdict.action {
        Action::Kill => {
            let max = step.max_time_out.unwrap_or_default();
            let killed = record.terminate_on_timeout(now, max);
            warn!(
                "Step '{}' reached max_time_out {:?} after {:?}; terminated",
                step.id,
                max,
                record.elapsed(now)
            );
            timeline.add_event(&step.id, EventType::TimeoutTerminated);
            if killed {
                timeline.add_event(&step.id, EventType::Cancelled);
            }
            return;
        }
        Action::Retire => {
            record.set_state(RunState::EndOfLifeTerminated);
            info!(
                "Step '{}' reached end of life after {} relaunches",
                step.id,
                record.loop_counter()
            );
            timeline.add_event(&step.id, EventType::EndOfLife);
            return;
        }
        Action::None => record.set_state(verdict.state),
        Action::Relaunch => {
            record.set_state(verdict.state);
            let handle = dispatcher.launch_background(step);
            records.set_handle(&step.id, handle, Instant::now());
            debug!("Step '{}' relaunched ({:?})", step.id, verdict.rule);
            timeline.add_event(&step.id, EventType::Relaunched);
        }
    }

    if verdict.state == RunState::WaitingOnDependency && previous != RunState::WaitingOnDependency {
        info!(
            "Step '{}' waiting on {:?}",
            step.id, step.run_until.depends_on
        );
        timeline.add_event(&step.id, EventType::Waiting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ExecutionError, StepError};
    use crate::execution::summary::StepOutcome;
    use crate::workflow::{ExecutableDescriptor, Phase, RunUntilPolicy};
    use std::time::Duration;

    const TICK: Duration = Duration::from_millis(10);

    fn sleep(seconds: &str) -> ExecutableDescriptor {
        ExecutableDescriptor::new("builtin.timer", "Sleep", "run").with_arguments([seconds])
    }

    fn failing() -> ExecutableDescriptor {
        ExecutableDescriptor::new("builtin.timer", "Sleep", "fail")
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn scheduler(steps: Vec<Step>) -> Scheduler {
        let mut scheduler = Scheduler::new(Workflow::from_steps(steps), ExecutableRegistry::with_builtins());
        scheduler.set_tick_interval(TICK);
        scheduler.set_max_workers(4);
        scheduler
    }

    fn first(timeline: &ExecutionTimeline, step_id: &str, event: EventType) -> Instant {
        timeline
            .events_for(step_id)
            .find(|e| e.event_type == event)
            .map(|e| e.timestamp)
            .unwrap_or_else(|| panic!("no {:?} event for {}", event, step_id))
    }

    #[test]
    fn test_foreground_only_workflow_needs_no_ticks() {
        let mut scheduler = scheduler(vec![
            Step::new("boot", sleep("0")),
            Step::new("check", sleep("0")),
        ]);
        scheduler.set_tick_interval(Duration::from_secs(10));

        let summary = scheduler.run().unwrap();
        assert!(summary.duration < Duration::from_secs(5));
        assert!(summary.is_success());
        assert_eq!(summary.steps.len(), 2);
        for step in &summary.steps {
            assert_eq!(step.outcome, StepOutcome::Completed);
            assert_eq!(step.launches, 1);
        }
    }

    #[test]
    fn test_background_runs_once_by_default() {
        let mut scheduler = scheduler(vec![Step::new("bg", sleep("0")).in_background()]);

        let summary = scheduler.run().unwrap();
        let bg = summary.get("bg").unwrap();
        assert_eq!(bg.outcome, StepOutcome::EndOfLifeTerminated);
        assert_eq!(bg.loop_counter, 0);
        assert_eq!(bg.launches, 1);
    }

    #[test]
    fn test_loop_limit_then_max_timeout() {
        let step = Step::new("stress", sleep("0"))
            .in_background()
            .with_max_time_out(ms(200))
            .with_run_until(RunUntilPolicy {
                loop_limit: 3,
                end_of_life: false,
                ..RunUntilPolicy::default()
            });
        let mut scheduler = scheduler(vec![step]);

        let summary = scheduler.run().unwrap();
        let stress = summary.get("stress").unwrap();
        assert_eq!(stress.outcome, StepOutcome::TimeoutTerminated);
        assert!(stress.loop_counter >= 3);
        assert_eq!(stress.launches, stress.loop_counter + 1);
        assert_eq!(
            scheduler.timeline().count("stress", EventType::Relaunched),
            stress.loop_counter as usize
        );

        let timeout = stress.timeout.as_ref().unwrap();
        assert!(timeout.elapsed >= ms(200));
        assert!(timeout.elapsed < ms(200) + TICK * 20);
        assert!(scheduler.records().get("stress").unwrap().force_terminate());
    }

    #[test]
    fn test_dependency_keeps_step_polling() {
        let a = Step::new("a", sleep("0"))
            .in_background()
            .with_run_until(RunUntilPolicy {
                depends_on: vec!["b".to_string()],
                ..RunUntilPolicy::default()
            });
        let b = Step::new("b", sleep("0.3")).in_background();
        let mut scheduler = scheduler(vec![a, b]);

        let summary = scheduler.run().unwrap();
        assert_eq!(summary.get("a").unwrap().outcome, StepOutcome::EndOfLifeTerminated);
        assert!(summary.get("a").unwrap().loop_counter > 0);

        let timeline = scheduler.timeline();
        assert_eq!(timeline.count("a", EventType::Waiting), 1);
        // a only retires once b's launch has returned.
        assert!(first(timeline, "a", EventType::EndOfLife) >= first(timeline, "b", EventType::Finished));
    }

    #[test]
    fn test_max_timeout_overrides_min_timeout() {
        let step = Step::new("soak", sleep("10"))
            .in_background()
            .with_max_time_out(ms(100))
            .with_run_until(RunUntilPolicy {
                min_time_out: Duration::from_secs(2),
                ..RunUntilPolicy::default()
            });
        let mut scheduler = scheduler(vec![step]);

        let summary = scheduler.run().unwrap();
        let soak = summary.get("soak").unwrap();
        assert_eq!(soak.outcome, StepOutcome::TimeoutTerminated);
        assert!(summary.duration < Duration::from_secs(2));
        assert_eq!(scheduler.timeline().count("soak", EventType::Cancelled), 1);
    }

    #[test]
    fn test_min_timeout_relaunches_until_elapsed() {
        let step = Step::new("warmup", sleep("0"))
            .in_background()
            .with_run_until(RunUntilPolicy {
                min_time_out: ms(150),
                ..RunUntilPolicy::default()
            });
        let mut scheduler = scheduler(vec![step]);

        let summary = scheduler.run().unwrap();
        assert!(summary.get("warmup").unwrap().loop_counter > 0);

        let timeline = scheduler.timeline();
        let lifetime = first(timeline, "warmup", EventType::EndOfLife)
            - first(timeline, "warmup", EventType::Dispatched);
        assert!(lifetime >= ms(150));
    }

    #[test]
    fn test_final_sweep_cancels_running_end_of_life_step() {
        let mut scheduler = scheduler(vec![Step::new("long", sleep("30")).in_background()]);

        let summary = scheduler.run().unwrap();
        assert_eq!(summary.get("long").unwrap().outcome, StepOutcome::EndOfLifeTerminated);
        assert!(summary.duration < Duration::from_secs(5));

        let record = scheduler.records().get("long").unwrap();
        assert!(record.swept());
        assert!(record.handle().unwrap().is_cancelled());
        assert_eq!(scheduler.timeline().count("long", EventType::Cancelled), 1);
    }

    #[test]
    fn test_background_failure_is_isolated() {
        let mut scheduler = scheduler(vec![
            Step::new("flaky", failing()).in_background(),
            Step::new("after", sleep("0")),
        ]);

        let summary = scheduler.run().unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.get("after").unwrap().outcome, StepOutcome::Completed);

        let flaky = summary.get("flaky").unwrap();
        assert_eq!(flaky.error_count, 1);
        assert!(matches!(&flaky.last_error, Some(StepError::Execution(e)) if e.method == "fail"));
    }

    #[test]
    fn test_required_step_failure_fails_run() {
        let mut scheduler = scheduler(vec![Step::new("link", failing()).in_background().required()]);

        let summary = scheduler.run().unwrap();
        assert!(!summary.is_success());
    }

    #[test]
    fn test_foreground_failure_cancels_background() {
        let mut scheduler = scheduler(vec![
            Step::new("bg", sleep("30")).in_background(),
            Step::new("fg", failing()),
            Step::new("never", sleep("0")),
        ]);

        let err = scheduler.run().unwrap_err();
        assert!(matches!(err, OrchestratorError::Execution(ref e) if e.step_id == "fg"));

        let fg = scheduler.records().get("fg").unwrap();
        assert_eq!(fg.state(), RunState::Failed);
        assert_eq!(fg.error_count(), 1);
        assert!(matches!(fg.last_error(), Some(StepError::Execution(e)) if e.method == "fail"));
        assert_eq!(scheduler.timeline().count("fg", EventType::Failed), 1);

        let bg = scheduler.records().get("bg").unwrap();
        assert!(bg.handle().unwrap().is_cancelled());
        assert!(scheduler.records().get("never").is_none());
        assert_eq!(scheduler.timeline().count("bg", EventType::Cancelled), 1);
    }

    #[test]
    fn test_launch_returning_after_last_tick_is_harvested() {
        let mut scheduler = scheduler(vec![Step::new("late", sleep("0")).in_background()]);
        let pool = WorkerPool::new(1).unwrap();
        let handle = pool.submit(
            "late",
            Box::new(|_| {
                Err(ExecutionError {
                    step_id: "late".to_string(),
                    phase: Phase::Current,
                    class_name: "Sleep".to_string(),
                    method: "run".to_string(),
                    message: "link dropped".to_string(),
                })
            }),
        );
        let deadline = Instant::now() + Duration::from_secs(5);
        while handle.is_running().unwrap() {
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        }

        // Retired while the launch was still running; it returned afterwards.
        scheduler.records.register_background("late", handle, Instant::now());
        scheduler.records.get_mut("late").unwrap().set_state(RunState::EndOfLifeTerminated);

        scheduler.final_sweep();
        scheduler.harvest_finished();

        let summary = scheduler.summarize(Local::now(), Instant::now());
        let late = summary.get("late").unwrap();
        assert_eq!(late.error_count, 1);
        assert!(matches!(&late.last_error, Some(StepError::Execution(e)) if e.message == "link dropped"));
        assert_eq!(scheduler.timeline().count("late", EventType::Failed), 1);
        assert_eq!(scheduler.timeline().count("late", EventType::Cancelled), 0);
    }

    #[test]
    fn test_unresolved_executable_aborts_before_dispatch() {
        let mut scheduler = scheduler(vec![
            Step::new("ok", sleep("0")),
            Step::new("bad", ExecutableDescriptor::new("tests.missing", "Nope", "run")),
        ]);

        let err = scheduler.run().unwrap_err();
        assert!(matches!(err, OrchestratorError::Dependency(_)));
        assert!(scheduler.records().is_empty());
    }

    #[test]
    fn test_relaunch_never_overlaps() {
        // Each launch outlives several ticks; no relaunch may start while one runs.
        let step = Step::new("slow", sleep("0.05"))
            .in_background()
            .with_max_time_out(ms(300))
            .with_run_until(RunUntilPolicy {
                end_of_life: false,
                ..RunUntilPolicy::default()
            });
        let mut scheduler = scheduler(vec![step]);

        let summary = scheduler.run().unwrap();
        let slow = summary.get("slow").unwrap();
        assert_eq!(slow.outcome, StepOutcome::TimeoutTerminated);
        // At most one launch per 50 ms slice of the 300 ms lifetime.
        assert!(slow.launches <= 8);
        assert!(slow.launches >= 2);
    }

    #[test]
    fn test_apply_settings_sets_working_dir() {
        let mut scheduler = scheduler(vec![Step::new("s", sleep("0"))]);
        scheduler.apply_settings(&Settings {
            tick_interval: TICK,
            max_workers: Some(1),
            report_path: None,
            working_dir: Some("/tmp".into()),
        });
        assert_eq!(scheduler.shared.working_dir.as_deref(), Some(std::path::Path::new("/tmp")));
        assert!(scheduler.run().unwrap().is_success());
    }
}
