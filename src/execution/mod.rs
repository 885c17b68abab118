//! Workflow Execution Module
//!
//! Runs steps and supervises background work until every step is terminal.
//!
//! # Architecture
//!
//! - [`scheduler`]: dispatch phase, run-until loop and final sweep
//! - [`dispatcher`]: resolves descriptors and runs steps inline or on the pool
//! - [`pool`]: bounded worker pool with cancellable handles
//! - [`registry`]: per-step runtime records
//! - [`run_until`]: the relaunch/termination rules
//! - [`summary`]: per-step outcomes and the JSON report

pub mod dispatcher;
pub mod pool;
pub mod registry;
pub mod run_until;
pub mod scheduler;
pub mod summary;

pub use dispatcher::{Dispatched, Dispatcher};
pub use pool::{TaskHandle, WorkerPool};
pub use registry::{LivenessSnapshot, ProcessRecord, RunState, StepRegistry};
pub use run_until::{Action, RunUntilEvaluator, Verdict};
pub use scheduler::Scheduler;
pub use summary::{RunSummary, StepOutcome, StepSummary};
