//! Workflow Definition Module
//!
//! Provides data structures and utilities for loading and validating
//! run-until workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (Step, ExecutableDescriptor, RunUntilPolicy)
//! - [`parser`]: JSON/YAML parsing and loading
//! - [`validator`]: Reference integrity and policy checks

pub mod model;
pub mod parser;
pub mod validator;

pub use model::{ExecutableDescriptor, Phase, RunUntilPolicy, Step, Workflow};
pub use parser::{load_workflow, parse_workflow, DocumentFormat};
pub use validator::validate_workflow;
