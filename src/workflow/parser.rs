//! Workflow Parser
//!
//! Handles loading workflow documents from JSON or YAML files and turning
//! them into validated [`Workflow`] values.
//!
//! The document is an ordered array of step objects. A top-level object
//! with a `steps` array is accepted as well. Durations are given in minutes
//! as numbers or numeric strings; fractions are allowed.

use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::Deserialize;
use serde_json::Value;

use super::model::{ExecutableDescriptor, Phase, RunUntilPolicy, Step, Workflow};
use super::validator::validate_workflow;
use crate::error::ConfigError;

/// Serialization format of a workflow document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Picks the format from the file extension; anything but `.yaml`/`.yml` is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                DocumentFormat::Yaml
            }
            _ => DocumentFormat::Json,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Steps(Vec<RawStep>),
    Wrapped { steps: Vec<RawStep> },
}

#[derive(Deserialize)]
struct RawStep {
    step_id: Option<String>,
    #[serde(default)]
    execute_in_background: bool,
    #[serde(default)]
    max_time_out: Value,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    executable: RawExecutable,
    run_until: Option<RawRunUntil>,
}

#[derive(Deserialize, Default)]
struct RawExecutable {
    #[serde(default)]
    pre_executable: Vec<RawDescriptor>,
    #[serde(default)]
    current_executable: Vec<RawDescriptor>,
    #[serde(default)]
    post_executable: Vec<RawDescriptor>,
}

#[derive(Deserialize)]
struct RawDescriptor {
    executable_path: Option<String>,
    class_name: Option<String>,
    entry_method_name: Option<String>,
    #[serde(default)]
    arguments: Vec<String>,
}

#[derive(Deserialize)]
struct RawRunUntil {
    #[serde(default)]
    step_id: Vec<String>,
    #[serde(default)]
    min_time_out: Value,
    #[serde(default, rename = "loop")]
    loop_limit: Value,
    end_of_life: Option<bool>,
}

/// Loads and validates a workflow from a JSON or YAML file.
///
/// # Example
///
/// ```rust,no_run
/// use crossflow::workflow::load_workflow;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let workflow = load_workflow("Seamless_new.json")?;
///     println!("Loaded {} steps", workflow.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow(path: impl AsRef<Path>) -> Result<Workflow, ConfigError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;

    debug!("Workflow document loaded ({} bytes)", content.len());

    parse_workflow(&content, DocumentFormat::from_path(path))
}

/// Parses and validates a workflow document held in memory.
pub fn parse_workflow(content: &str, format: DocumentFormat) -> Result<Workflow, ConfigError> {
    let document: RawDocument = match format {
        DocumentFormat::Json => {
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
        DocumentFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?
        }
    };

    let raw_steps = match document {
        RawDocument::Steps(steps) | RawDocument::Wrapped { steps } => steps,
    };

    let steps = raw_steps
        .into_iter()
        .enumerate()
        .map(|(index, raw)| convert_step(index, raw))
        .collect::<Result<Vec<_>, _>>()?;

    info!("Parsed {} steps", steps.len());

    let workflow = Workflow::from_steps(steps);
    validate_workflow(&workflow)?;
    Ok(workflow)
}

fn convert_step(index: usize, raw: RawStep) -> Result<Step, ConfigError> {
    let id = raw
        .step_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or(ConfigError::MissingStepId { index })?;

    let pre = convert_descriptors(&id, Phase::Pre, raw.executable.pre_executable)?;
    let current = convert_descriptors(&id, Phase::Current, raw.executable.current_executable)?;
    let post = convert_descriptors(&id, Phase::Post, raw.executable.post_executable)?;

    if current.is_empty() {
        return Err(ConfigError::MissingCurrentExecutable(id));
    }

    let max_time_out = parse_minutes(&id, "max_time_out", &raw.max_time_out)?;

    let run_until = match raw.run_until {
        Some(policy) => RunUntilPolicy {
            depends_on: policy
                .step_id
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            min_time_out: parse_minutes(&id, "min_time_out", &policy.min_time_out)?
                .unwrap_or(Duration::ZERO),
            loop_limit: parse_count(&id, &policy.loop_limit)?,
            end_of_life: policy.end_of_life.unwrap_or(true),
        },
        None => RunUntilPolicy::default(),
    };

    debug!(
        "Step '{}': background={}, max_time_out={:?}, policy={:?}",
        id, raw.execute_in_background, max_time_out, run_until
    );

    Ok(Step {
        id,
        pre,
        current,
        post,
        execute_in_background: raw.execute_in_background,
        max_time_out,
        run_until,
        required: raw.required,
    })
}

fn convert_descriptors(
    step: &str,
    phase: Phase,
    raw: Vec<RawDescriptor>,
) -> Result<Vec<ExecutableDescriptor>, ConfigError> {
    raw.into_iter()
        .enumerate()
        .map(|(index, d)| {
            let field = |value: Option<String>, name: &'static str| {
                value
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .ok_or_else(|| ConfigError::IncompleteDescriptor {
                        step: step.to_string(),
                        phase,
                        index,
                        field: name,
                    })
            };

            Ok(ExecutableDescriptor {
                executable_path: field(d.executable_path, "executable_path")?,
                class_name: field(d.class_name, "class_name")?,
                entry_method_name: field(d.entry_method_name, "entry_method_name")?,
                arguments: d.arguments,
            })
        })
        .collect()
}

/// Parses a minute count given as a number or numeric string.
///
/// `null` (or an absent field) yields `None`.
fn parse_minutes(
    step: &str,
    field: &'static str,
    value: &Value,
) -> Result<Option<Duration>, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        step: step.to_string(),
        field,
        value: value.to_string(),
    };

    let minutes = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64().ok_or_else(invalid)?,
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| invalid())?,
        _ => return Err(invalid()),
    };

    if !minutes.is_finite() || minutes < 0.0 {
        return Err(invalid());
    }

    Duration::try_from_secs_f64(minutes * 60.0)
        .map(Some)
        .map_err(|_| invalid())
}

fn parse_count(step: &str, value: &Value) -> Result<u32, ConfigError> {
    let invalid = || ConfigError::InvalidDuration {
        step: step.to_string(),
        field: "loop",
        value: value.to_string(),
    };

    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(invalid),
        Value::String(s) => s.trim().parse::<u32>().map_err(|_| invalid()),
        _ => Err(invalid()),
    }
}
