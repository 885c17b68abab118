//! Step Dispatch
//!
//! Resolves a step's executable descriptors through the registry and runs
//! them, either inline on the caller's thread (foreground) or on the worker
//! pool (background).
//!
//! One invocation walks the pre, current and post phases in order. For each
//! descriptor the unit is constructed (once per `(path, class, arguments)`
//! per invocation), prepared, then driven through its entry method. The first
//! failure ends the invocation. Errors and panics inside units never escape
//! this module; they are returned as [`ExecutionError`].

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{debug, info, warn};

use super::pool::{TaskHandle, WorkerPool};
use crate::error::{DependencyError, ExecutionError};
use crate::executables::{CancelToken, Executable, ExecutableRegistry, SharedContext, UnitContext, UnitError};
use crate::workflow::{ExecutableDescriptor, Step, Workflow};

/// Outcome of dispatching a step.
#[derive(Debug)]
pub enum Dispatched {
    /// A foreground step ran to completion.
    Completed,
    /// A background step was submitted to the pool.
    Background(TaskHandle),
}

/// Launches steps inline or on the worker pool.
pub struct Dispatcher {
    registry: Arc<ExecutableRegistry>,
    shared: Arc<SharedContext>,
    pool: WorkerPool,
}

impl Dispatcher {
    pub fn new(registry: Arc<ExecutableRegistry>, shared: Arc<SharedContext>, pool: WorkerPool) -> Self {
        Self {
            registry,
            shared,
            pool,
        }
    }

    /// Checks that every descriptor in the workflow resolves.
    pub fn preflight(&self, workflow: &Workflow) -> Result<(), DependencyError> {
        for step in &workflow.steps {
            for (_, descriptor) in step.executables() {
                self.registry.resolve(&step.id, descriptor)?;
            }
        }
        debug!("All executables resolved");
        Ok(())
    }

    /// Dispatches a step according to its `execute_in_background` flag.
    ///
    /// Foreground steps block until they finish; their failure is returned.
    /// Background steps return a handle immediately.
    pub fn dispatch(&self, step: &Step) -> Result<Dispatched, ExecutionError> {
        if step.execute_in_background {
            Ok(Dispatched::Background(self.launch_background(step)))
        } else {
            self.run_inline(step)?;
            Ok(Dispatched::Completed)
        }
    }

    /// Runs a step on the caller's thread.
    pub fn run_inline(&self, step: &Step) -> Result<(), ExecutionError> {
        info!("Running foreground step: {}", step.id);
        invoke(&self.registry, &self.shared, step, &CancelToken::new())
    }

    /// Submits a step to the worker pool.
    pub fn launch_background(&self, step: &Step) -> TaskHandle {
        info!("Launching background step: {}", step.id);

        let registry = Arc::clone(&self.registry);
        let shared = Arc::clone(&self.shared);
        let step = step.clone();
        let step_id = step.id.clone();

        self.pool.submit(
            &step_id,
            Box::new(move |cancel| invoke(&registry, &shared, &step, cancel)),
        )
    }

    /// Number of worker threads available to background steps.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }
}

/// Runs every executable of a step in phase order.
fn invoke(
    registry: &ExecutableRegistry,
    shared: &Arc<SharedContext>,
    step: &Step,
    cancel: &CancelToken,
) -> Result<(), ExecutionError> {
    // Units are built from their arguments, so only identical descriptors share one.
    let mut instances: HashMap<(String, String, Vec<String>), Box<dyn Executable>> = HashMap::new();

    for (phase, descriptor) in step.executables() {
        let fail = |method: &str, err: UnitError| ExecutionError {
            step_id: step.id.clone(),
            phase,
            class_name: descriptor.class_name.clone(),
            method: method.to_string(),
            message: err.message,
        };

        if cancel.is_cancelled() {
            return Err(fail(&descriptor.entry_method_name, UnitError::new("cancelled")));
        }

        let key = (
            descriptor.executable_path.clone(),
            descriptor.class_name.clone(),
            descriptor.arguments.clone(),
        );
        if !instances.contains_key(&key) {
            let context = unit_context(step, descriptor, shared, cancel);
            let unit = guarded(|| registry.construct(descriptor, &context))
                .map_err(|e| fail("construct", e))?;
            instances.insert(key.clone(), unit);
        }

        let Some(unit) = instances.get_mut(&key) else {
            continue;
        };

        debug!(
            "Step '{}': {} {}::{}.{}",
            step.id, phase, descriptor.executable_path, descriptor.class_name, descriptor.entry_method_name
        );

        guarded(|| unit.prepare()).map_err(|e| fail("prepare", e))?;
        guarded(|| unit.run(&descriptor.entry_method_name))
            .map_err(|e| fail(&descriptor.entry_method_name, e))?;
    }

    debug!("Step '{}' invocation finished", step.id);
    Ok(())
}

fn unit_context(
    step: &Step,
    descriptor: &ExecutableDescriptor,
    shared: &Arc<SharedContext>,
    cancel: &CancelToken,
) -> UnitContext {
    UnitContext {
        step_id: step.id.clone(),
        arguments: descriptor.arguments.clone(),
        shared: Arc::clone(shared),
        cancel: cancel.clone(),
    }
}

/// Runs a unit call, turning a panic into a [`UnitError`].
fn guarded<T>(call: impl FnOnce() -> Result<T, UnitError>) -> Result<T, UnitError> {
    match panic::catch_unwind(AssertUnwindSafe(call)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            warn!("Executable panicked: {}", message);
            Err(UnitError::new(format!("panicked: {}", message)))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
