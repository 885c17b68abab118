//! crossflow CLI Entry Point
//!
//! # Usage
//!
//! ```bash
//! # Run the default workflow (CROSSFLOW_WORKFLOW or ./Seamless_new.json)
//! crossflow
//!
//! # Run a specific workflow
//! crossflow lab/pcie_soak.json
//!
//! # Faster ticks and a JSON report
//! CROSSFLOW_TICK_SECS=2 CROSSFLOW_REPORT=run.json crossflow lab/pcie_soak.yaml
//! ```
//!
//! Exit codes: 0 on success, 1 on a fatal error, 2 when a required step
//! recorded an error.

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use crossflow::config::{Settings, DEFAULT_WORKFLOW_PATH};
use crossflow::executables::{ExecutableRegistry, SharedContext};
use crossflow::execution::{RunSummary, StepOutcome};
use crossflow::{load_workflow, Scheduler, APP_NAME, VERSION};

/// Exit code for a run whose required step failed.
const EXIT_REQUIRED_FAILED: u8 = 2;

/// Configures the logging system with appropriate formatting.
fn setup_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME, VERSION);
    println!("Run-Until Workflow Orchestrator");
    println!();
}

fn print_usage() {
    println!("Usage: crossflow [WORKFLOW_FILE]");
    println!();
    println!("Arguments:");
    println!(
        "  [WORKFLOW_FILE]  Workflow document, JSON or YAML (default: {})",
        DEFAULT_WORKFLOW_PATH.display()
    );
    println!();
    println!("Environment:");
    println!("  CROSSFLOW_TICK_SECS    Run-until tick in seconds (default: 10)");
    println!("  CROSSFLOW_MAX_WORKERS  Worker pool bound");
    println!("  CROSSFLOW_REPORT       Write a JSON run report to this path");
    println!("  CROSSFLOW_WORKING_DIR  Directory units run in");
    println!("  RUST_LOG               Log filter (default: info)");
}

/// Picks the workflow path from the single optional positional argument.
fn parse_arguments(args: &[String]) -> Result<PathBuf, String> {
    match args {
        [] | [_] => Ok(DEFAULT_WORKFLOW_PATH.clone()),
        [_, path] => Ok(PathBuf::from(path)),
        [_, _, extra, ..] => Err(format!("Unexpected argument: {}", extra)),
    }
}

fn check_working_dir(settings: &Settings) -> Result<(), String> {
    let Some(dir) = &settings.working_dir else {
        return Ok(());
    };
    if !dir.is_dir() {
        return Err(format!("Working directory does not exist: {}", dir.display()));
    }
    info!("Working directory: {}", dir.display());
    Ok(())
}

fn outcome_label(outcome: StepOutcome) -> colored::ColoredString {
    match outcome {
        StepOutcome::Completed => outcome.label().green(),
        StepOutcome::EndOfLifeTerminated => outcome.label().cyan(),
        StepOutcome::TimeoutTerminated => outcome.label().yellow(),
        StepOutcome::Failed | StepOutcome::Interrupted => outcome.label().red(),
    }
}

/// Prints one row per step plus every recorded error.
fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", "Run summary".bold());
    println!(
        "{:<24} {:<24} {:>6} {:>8} {:>6}",
        "STEP", "OUTCOME", "LOOPS", "LAUNCHES", "ERRORS"
    );

    for step in &summary.steps {
        let errors = if step.error_count > 0 {
            step.error_count.to_string().red()
        } else {
            step.error_count.to_string().normal()
        };
        println!(
            "{:<24} {:<24} {:>6} {:>8} {:>6}",
            step.step_id,
            outcome_label(step.outcome),
            step.loop_counter,
            step.launches,
            errors
        );
    }

    let failures: Vec<_> = summary.failures().collect();
    if !failures.is_empty() {
        println!();
        println!("{}", "Errors".bold());
        for step in failures {
            if let Some(err) = &step.last_error {
                let marker = if step.required { "required" } else { "optional" };
                println!("  {} ({}): {}", step.step_id.red(), marker, err);
            }
        }
    }

    println!();
    println!("Total time: {:.2?}", summary.duration);
}

/// Main application logic; returns the process exit code.
fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let workflow_path = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging();
    print_banner();

    let settings = Settings::from_env();
    check_working_dir(&settings)?;

    info!("Loading workflow: {}", workflow_path.display());
    let workflow = load_workflow(&workflow_path).map_err(|e| {
        error!("Failed to load workflow: {}", e);
        e
    })?;
    info!(
        "Workflow loaded: {} steps ({} background)",
        workflow.len(),
        workflow.background_steps().count()
    );

    let mut shared = SharedContext::new(&workflow_path);
    if let Some(dir) = &settings.working_dir {
        shared = shared.with_working_dir(dir);
    }

    let mut scheduler = Scheduler::new(workflow, ExecutableRegistry::with_builtins());
    scheduler.set_shared_context(shared);
    scheduler.apply_settings(&settings);

    let summary = scheduler.run()?;

    print_summary(&summary);
    println!("{}", scheduler.timeline().gantt_chart());

    if let Some(path) = &settings.report_path {
        summary.write_report(path)?;
    }

    if summary.is_success() {
        println!("{}", "Workflow completed successfully".green());
        Ok(ExitCode::SUCCESS)
    } else {
        println!("{}", "Workflow completed with failed required steps".red());
        Ok(ExitCode::from(EXIT_REQUIRED_FAILED))
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_arguments_default() {
        let path = parse_arguments(&args(&["crossflow"])).unwrap();
        assert_eq!(path, *DEFAULT_WORKFLOW_PATH);
    }

    #[test]
    fn test_parse_arguments_positional() {
        let path = parse_arguments(&args(&["crossflow", "lab/soak.json"])).unwrap();
        assert_eq!(path, PathBuf::from("lab/soak.json"));
    }

    #[test]
    fn test_parse_arguments_rejects_extra() {
        let err = parse_arguments(&args(&["crossflow", "a.json", "b.json"])).unwrap_err();
        assert!(err.contains("b.json"));
    }

    #[test]
    fn test_check_working_dir_missing() {
        let settings = Settings {
            working_dir: Some(PathBuf::from("/definitely/not/here")),
            ..Settings::default()
        };
        assert!(check_working_dir(&settings).is_err());
        assert!(check_working_dir(&Settings::default()).is_ok());
    }
}
