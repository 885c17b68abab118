//! Built-in Units
//!
//! Units available in every registry:
//!
//! - `builtin.process::Command` runs its arguments as a child process and
//!   kills the child when the step is cancelled
//! - `builtin.timer::Sleep` waits for a number of seconds; its `fail`
//!   method always errors, which is handy for failure drills

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, warn};

use super::registry::ExecutableRegistry;
use super::unit::{CancelToken, Executable, UnitContext, UnitError};

/// Module path of the process unit.
pub const PROCESS_MODULE: &str = "builtin.process";

/// Module path of the timer unit.
pub const TIMER_MODULE: &str = "builtin.timer";

/// How often a running child is polled for exit or cancellation.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Adds the built-in units to a registry.
pub fn register_builtins(registry: &mut ExecutableRegistry) {
    registry
        .register(PROCESS_MODULE, "Command", &["run"], |ctx| {
            Ok(Box::new(CommandUnit::new(ctx)) as Box<dyn Executable>)
        })
        .register(TIMER_MODULE, "Sleep", &["run", "fail"], |ctx| {
            Ok(Box::new(SleepUnit::new(ctx)) as Box<dyn Executable>)
        });
}

/// Runs an external program.
///
/// `arguments[0]` is the program, the rest are passed through. Output is
/// captured and logged; a non-zero exit status is an error.
pub struct CommandUnit {
    step_id: String,
    arguments: Vec<String>,
    working_dir: Option<PathBuf>,
    cancel: CancelToken,
}

impl CommandUnit {
    pub fn new(ctx: &UnitContext) -> Self {
        Self {
            step_id: ctx.step_id.clone(),
            arguments: ctx.arguments.clone(),
            working_dir: ctx.shared.working_dir.clone(),
            cancel: ctx.cancel.clone(),
        }
    }

    fn spawn(&self) -> Result<Child, UnitError> {
        let (program, args) = self
            .arguments
            .split_first()
            .ok_or_else(|| UnitError::new("no program given in arguments"))?;

        let mut cmd = Command::new(program);
        cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        cmd.spawn()
            .map_err(|e| UnitError::new(format!("failed to start '{}': {}", program, e)))
    }
}

impl Executable for CommandUnit {
    fn prepare(&mut self) -> Result<(), UnitError> {
        if self.arguments.is_empty() {
            return Err(UnitError::new("no program given in arguments"));
        }
        Ok(())
    }

    fn run(&mut self, _method: &str) -> Result<(), UnitError> {
        let mut child = self.spawn()?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if self.cancel.is_cancelled() {
                warn!("Step '{}': cancelled, killing pid {}", self.step_id, child.id());
                reap(&self.step_id, &mut child);
                return Err(UnitError::new("cancelled"));
            }

            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(CHILD_POLL_INTERVAL),
                Err(e) => {
                    error!("Step '{}': lost track of pid {}: {}", self.step_id, child.id(), e);
                    reap(&self.step_id, &mut child);
                    return Err(e.into());
                }
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if status.success() {
            if !stdout.trim().is_empty() {
                debug!("Step '{}' output:\n{}", self.step_id, stdout);
            }
            Ok(())
        } else {
            error!(
                "Step '{}': command exited with code {:?}",
                self.step_id,
                status.code()
            );
            if !stderr.trim().is_empty() {
                error!("stderr:\n{}", stderr);
            }
            Err(UnitError::new(format!(
                "command exited with code {:?}",
                status.code()
            )))
        }
    }
}

/// Kills a child and waits for it so it does not outlive its step.
fn reap(step_id: &str, child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Step '{}': kill failed: {}", step_id, e);
    }
    if let Err(e) = child.wait() {
        warn!("Step '{}': wait failed: {}", step_id, e);
    }
}

/// Reads a child's pipe on a separate thread so the child never blocks on a full pipe.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buffer = String::new();
            let _ = pipe.read_to_string(&mut buffer);
            buffer
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Waits for `arguments[0]` seconds (default 0).
pub struct SleepUnit {
    arguments: Vec<String>,
    duration: Duration,
    cancel: CancelToken,
}

impl SleepUnit {
    pub fn new(ctx: &UnitContext) -> Self {
        Self {
            arguments: ctx.arguments.clone(),
            duration: Duration::ZERO,
            cancel: ctx.cancel.clone(),
        }
    }
}

impl Executable for SleepUnit {
    fn prepare(&mut self) -> Result<(), UnitError> {
        let Some(raw) = self.arguments.first() else {
            return Ok(());
        };

        let seconds: f64 = raw
            .trim()
            .parse()
            .map_err(|_| UnitError::new(format!("invalid sleep seconds '{}'", raw)))?;

        self.duration = Duration::try_from_secs_f64(seconds)
            .map_err(|_| UnitError::new(format!("invalid sleep seconds '{}'", raw)))?;
        Ok(())
    }

    fn run(&mut self, method: &str) -> Result<(), UnitError> {
        match method {
            "fail" => Err(UnitError::new("intentional failure")),
            _ => {
                if self.cancel.sleep(self.duration) {
                    Ok(())
                } else {
                    Err(UnitError::new("cancelled"))
                }
            }
        }
    }
}
