//! Runtime Settings
//!
//! Everything tunable about a run comes from the environment:
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `CROSSFLOW_WORKFLOW` | workflow document | `Seamless_new.json` |
//! | `CROSSFLOW_TICK_SECS` | run-until tick interval, seconds | `10` |
//! | `CROSSFLOW_MAX_WORKERS` | worker pool bound | `max(cpus, background steps)` |
//! | `CROSSFLOW_REPORT` | write the JSON run report here | unset |
//! | `CROSSFLOW_WORKING_DIR` | directory units run in | unset |
//!
//! Invalid values are reported and replaced by the default.

use std::path::PathBuf;
use std::time::Duration;

use log::warn;
use once_cell::sync::Lazy;

pub const ENV_WORKFLOW: &str = "CROSSFLOW_WORKFLOW";
pub const ENV_TICK_SECS: &str = "CROSSFLOW_TICK_SECS";
pub const ENV_MAX_WORKERS: &str = "CROSSFLOW_MAX_WORKERS";
pub const ENV_REPORT: &str = "CROSSFLOW_REPORT";
pub const ENV_WORKING_DIR: &str = "CROSSFLOW_WORKING_DIR";

/// Workflow document used when none is given on the command line.
pub const DEFAULT_WORKFLOW_FILE: &str = "Seamless_new.json";

/// Default run-until tick.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Resolved once per process.
pub static DEFAULT_WORKFLOW_PATH: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var_os(ENV_WORKFLOW)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKFLOW_FILE))
});

/// Settings for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub tick_interval: Duration,
    /// Explicit pool bound; `None` sizes the pool from the workflow.
    pub max_workers: Option<usize>,
    pub report_path: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_workers: None,
            report_path: None,
            working_dir: None,
        }
    }
}

impl Settings {
    /// Reads settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut settings = Settings::default();

        if let Some(raw) = get(ENV_TICK_SECS) {
            match raw.parse::<f64>().ok().and_then(|s| Duration::try_from_secs_f64(s).ok()) {
                Some(tick) if !tick.is_zero() => settings.tick_interval = tick,
                _ => warn!(
                    "Ignoring {}='{}': expected a positive number of seconds",
                    ENV_TICK_SECS, raw
                ),
            }
        }

        if let Some(raw) = get(ENV_MAX_WORKERS) {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => settings.max_workers = Some(n),
                _ => warn!(
                    "Ignoring {}='{}': expected a positive integer",
                    ENV_MAX_WORKERS, raw
                ),
            }
        }

        settings.report_path = get(ENV_REPORT).map(PathBuf::from);
        settings.working_dir = get(ENV_WORKING_DIR).map(PathBuf::from);
        settings
    }

    /// Pool bound for a workflow with `background_steps` background steps.
    pub fn pool_size(&self, background_steps: usize) -> usize {
        self.max_workers
            .unwrap_or_else(|| num_cpus::get().max(background_steps))
            .max(1)
    }
}
