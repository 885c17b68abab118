//! Executable Units Module
//!
//! The plug-in seam between workflow documents and the code they run.
//!
//! - [`unit`]: the [`Executable`] contract and the contexts handed to units
//! - [`registry`]: `(module path, class name)` → factory lookup
//! - [`builtin`]: units shipped with the orchestrator

pub mod builtin;
pub mod registry;
pub mod unit;

pub use registry::{ExecutableRegistry, UnitFactory};
pub use unit::{CancelToken, Executable, SharedContext, UnitContext, UnitError};
