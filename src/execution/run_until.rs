//! Run-Until Evaluator
//!
//! Decides, once per tick, what happens to a background step. The rules are
//! checked in priority order and the first match wins:
//!
//! 1. `elapsed >= max_time_out`: kill the live handle, terminate the step.
//! 2. `elapsed < min_time_out`: keep the step going.
//! 3. A dependency is alive: wait, keep the step going.
//! 4. `loop_counter < loop_limit`: keep the step going.
//! 5. `end_of_life == false`: keep the step going.
//! 6. Otherwise the step reaches end of life.
//!
//! "Keep going" relaunches the step only if its own handle has finished; a
//! step never runs twice at once. End of life does not kill a handle that is
//! still running; the scheduler's final sweep takes care of it.
//!
//! The evaluation is a pure function of its inputs, so every rule can be
//! exercised without threads or clocks.

use std::time::{Duration, Instant};

use super::registry::{LivenessSnapshot, ProcessRecord, RunState};
use crate::workflow::Step;

/// Which rule produced a [`Verdict`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    MaxTimeout,
    MinTimeout,
    Dependency,
    LoopLimit,
    Perpetual,
    EndOfLife,
}

/// What the scheduler must do to the step's handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Leave the handle alone.
    None,
    /// Launch a fresh invocation; the previous one has finished.
    Relaunch,
    /// Cancel the handle and latch `force_terminate`.
    Kill,
    /// Stop relaunching; a running handle is left for the final sweep.
    Retire,
}

/// Outcome of evaluating one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub state: RunState,
    pub action: Action,
    pub rule: Rule,
}

/// Everything the rules look at, captured at the start of a tick.
#[derive(Debug, Clone)]
pub struct PolicyInput<'a> {
    pub elapsed: Duration,
    pub running: bool,
    pub loop_counter: u32,
    pub max_time_out: Option<Duration>,
    pub min_time_out: Duration,
    pub loop_limit: u32,
    pub end_of_life: bool,
    pub depends_on: &'a [String],
    pub snapshot: &'a LivenessSnapshot,
}

/// Applies the run-until rules.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunUntilEvaluator;

impl RunUntilEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a background step against the tick's snapshot.
    pub fn evaluate(
        &self,
        step: &Step,
        record: &ProcessRecord,
        snapshot: &LivenessSnapshot,
        now: Instant,
    ) -> Verdict {
        decide(&PolicyInput {
            elapsed: record.elapsed(now),
            running: snapshot.is_alive(&step.id),
            loop_counter: record.loop_counter(),
            max_time_out: step.max_time_out,
            min_time_out: step.run_until.min_time_out,
            loop_limit: step.run_until.loop_limit,
            end_of_life: step.run_until.end_of_life,
            depends_on: &step.run_until.depends_on,
            snapshot,
        })
    }
}

/// The rule table.
pub fn decide(input: &PolicyInput<'_>) -> Verdict {
    let keep_going = |state, rule| Verdict {
        state,
        action: if input.running { Action::None } else { Action::Relaunch },
        rule,
    };

    if input.max_time_out.is_some_and(|max| input.elapsed >= max) {
        return Verdict {
            state: RunState::MaxTimeoutTerminated,
            action: Action::Kill,
            rule: Rule::MaxTimeout,
        };
    }

    if input.elapsed < input.min_time_out {
        return keep_going(RunState::Running, Rule::MinTimeout);
    }

    if input.snapshot.any_alive(input.depends_on) {
        return keep_going(RunState::WaitingOnDependency, Rule::Dependency);
    }

    if input.loop_counter < input.loop_limit {
        return keep_going(RunState::Running, Rule::LoopLimit);
    }

    if !input.end_of_life {
        return keep_going(RunState::Running, Rule::Perpetual);
    }

    Verdict {
        state: RunState::EndOfLifeTerminated,
        action: Action::Retire,
        rule: Rule::EndOfLife,
    }
}
