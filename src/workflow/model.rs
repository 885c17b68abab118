//! Workflow Data Model
//!
//! Core data structures representing workflow steps and the run-until
//! policy that governs background steps.
//!
//! # Example JSON Format
//!
//! ```json
//! [
//!   {
//!     "step_id": "pcie_stress",
//!     "execute_in_background": true,
//!     "max_time_out": 60,
//!     "executable": {
//!       "current_executable": [
//!         {
//!           "executable_path": "builtin.process",
//!           "class_name": "Command",
//!           "entry_method_name": "run",
//!           "arguments": ["stress-ng", "--cpu", "4", "--timeout", "60s"]
//!         }
//!       ]
//!     },
//!     "run_until": { "step_id": [], "min_time_out": 5, "loop": 3, "end_of_life": false }
//!   }
//! ]
//! ```

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Execution phase of an executable within a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pre,
    Current,
    Post,
}

impl Phase {
    /// All phases in invocation order.
    pub const ORDER: [Phase; 3] = [Phase::Pre, Phase::Current, Phase::Post];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Pre => "pre",
            Phase::Current => "current",
            Phase::Post => "post",
        };
        f.write_str(name)
    }
}

/// Reference to a unit resolved through the executable registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableDescriptor {
    /// Module path the class is registered under (e.g. `builtin.process`)
    pub executable_path: String,

    /// Class name within the module
    pub class_name: String,

    /// Method invoked after `prepare()`
    pub entry_method_name: String,

    /// Free-form arguments handed to the unit at construction
    pub arguments: Vec<String>,
}

impl ExecutableDescriptor {
    pub fn new(
        executable_path: impl Into<String>,
        class_name: impl Into<String>,
        entry_method_name: impl Into<String>,
    ) -> Self {
        Self {
            executable_path: executable_path.into(),
            class_name: class_name.into(),
            entry_method_name: entry_method_name.into(),
            arguments: Vec::new(),
        }
    }

    /// Sets the construction arguments.
    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }
}

/// Conditions under which a background step is relaunched or retired.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUntilPolicy {
    /// Steps whose liveness keeps this step polling
    pub depends_on: Vec<String>,

    /// Minimum time the step must keep running, relaunching as needed
    pub min_time_out: Duration,

    /// Number of relaunches granted once the other conditions are satisfied
    pub loop_limit: u32,

    /// Stop relaunching once no other rule forces a relaunch
    pub end_of_life: bool,
}

impl Default for RunUntilPolicy {
    fn default() -> Self {
        Self {
            depends_on: Vec::new(),
            min_time_out: Duration::ZERO,
            loop_limit: 0,
            end_of_life: true,
        }
    }
}

/// A single named unit of work in a workflow.
///
/// Steps are immutable once parsed; all runtime state lives in the
/// [`ProcessRecord`](crate::execution::ProcessRecord) the scheduler keeps.
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// Unique identifier
    pub id: String,

    /// Executables run before the current phase
    pub pre: Vec<ExecutableDescriptor>,

    /// Main executables
    pub current: Vec<ExecutableDescriptor>,

    /// Executables run after the current phase
    pub post: Vec<ExecutableDescriptor>,

    /// Dispatch to the worker pool instead of running inline
    pub execute_in_background: bool,

    /// Hard upper bound on the step's lifetime; `None` means unbounded
    pub max_time_out: Option<Duration>,

    /// Relaunch policy for background steps
    pub run_until: RunUntilPolicy,

    /// A recorded error on this step fails the whole run
    pub required: bool,
}

impl Step {
    /// Creates a foreground step with a single current executable.
    ///
    /// # Example
    ///
    /// ```
    /// use crossflow::workflow::{ExecutableDescriptor, Step};
    /// use std::time::Duration;
    ///
    /// let step = Step::new("boot", ExecutableDescriptor::new("builtin.timer", "Sleep", "run"))
    ///     .in_background()
    ///     .with_max_time_out(Duration::from_secs(600));
    /// assert!(step.execute_in_background);
    /// ```
    pub fn new(id: impl Into<String>, current: ExecutableDescriptor) -> Self {
        Self {
            id: id.into().trim().to_string(),
            pre: Vec::new(),
            current: vec![current],
            post: Vec::new(),
            execute_in_background: false,
            max_time_out: None,
            run_until: RunUntilPolicy::default(),
            required: false,
        }
    }

    /// Marks the step for background execution.
    pub fn in_background(mut self) -> Self {
        self.execute_in_background = true;
        self
    }

    /// Sets the maximum lifetime.
    pub fn with_max_time_out(mut self, max: Duration) -> Self {
        self.max_time_out = Some(max);
        self
    }

    /// Sets the run-until policy.
    pub fn with_run_until(mut self, policy: RunUntilPolicy) -> Self {
        self.run_until = policy;
        self
    }

    /// Adds a pre-phase executable.
    pub fn with_pre(mut self, descriptor: ExecutableDescriptor) -> Self {
        self.pre.push(descriptor);
        self
    }

    /// Adds a post-phase executable.
    pub fn with_post(mut self, descriptor: ExecutableDescriptor) -> Self {
        self.post.push(descriptor);
        self
    }

    /// Flags the step as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Returns the descriptors of one phase.
    pub fn phase(&self, phase: Phase) -> &[ExecutableDescriptor] {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Current => &self.current,
            Phase::Post => &self.post,
        }
    }

    /// Iterates over every descriptor in invocation order.
    pub fn executables(&self) -> impl Iterator<Item = (Phase, &ExecutableDescriptor)> {
        Phase::ORDER
            .into_iter()
            .flat_map(move |phase| self.phase(phase).iter().map(move |d| (phase, d)))
    }
}

/// An ordered sequence of steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workflow {
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Creates a new empty workflow.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a workflow from a list of steps, keeping their order.
    pub fn from_steps(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Steps dispatched to the worker pool.
    pub fn background_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.execute_in_background)
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
