//! Executable Registry
//!
//! Maps `(module path, class name)` pairs to factories that construct
//! [`Executable`] units. Workflow documents only name units; the registry is
//! built in code and consulted when a step is dispatched.
//!
//! ```rust
//! use crossflow::executables::{ExecutableRegistry, Executable, UnitContext, UnitError};
//!
//! struct LinkCheck;
//!
//! impl Executable for LinkCheck {
//!     fn run(&mut self, method: &str) -> Result<(), UnitError> {
//!         match method {
//!             "execute" => Ok(()),
//!             other => Err(UnitError::new(format!("unknown method {other}"))),
//!         }
//!     }
//! }
//!
//! let mut registry = ExecutableRegistry::with_builtins();
//! registry.register("tests.pcie.link", "LinkCheck", &["execute"], |_ctx: &UnitContext| {
//!     Ok(Box::new(LinkCheck) as Box<dyn Executable>)
//! });
//! assert!(registry.contains("tests.pcie.link", "LinkCheck"));
//! ```

use std::collections::HashMap;

use log::debug;

use super::builtin;
use super::unit::{Executable, UnitContext, UnitError};
use crate::error::DependencyError;
use crate::workflow::ExecutableDescriptor;

/// Constructs a unit from its context.
pub type UnitFactory =
    Box<dyn Fn(&UnitContext) -> Result<Box<dyn Executable>, UnitError> + Send + Sync>;

struct RegisteredClass {
    methods: Vec<String>,
    factory: UnitFactory,
}

/// Registry of constructible units.
#[derive(Default)]
pub struct ExecutableRegistry {
    classes: HashMap<(String, String), RegisteredClass>,
}

impl ExecutableRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in units.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Registers a class and the entry methods it accepts.
    ///
    /// Registering the same `(path, class)` twice replaces the earlier entry.
    pub fn register<F>(&mut self, path: &str, class_name: &str, methods: &[&str], factory: F) -> &mut Self
    where
        F: Fn(&UnitContext) -> Result<Box<dyn Executable>, UnitError> + Send + Sync + 'static,
    {
        debug!("Registering executable {}::{} {:?}", path, class_name, methods);
        self.classes.insert(
            (path.to_string(), class_name.to_string()),
            RegisteredClass {
                methods: methods.iter().map(|m| m.to_string()).collect(),
                factory: Box::new(factory),
            },
        );
        self
    }

    /// Returns true if the class is registered.
    pub fn contains(&self, path: &str, class_name: &str) -> bool {
        self.lookup(path, class_name).is_some()
    }

    /// Checks that a descriptor names a registered class and one of its entry methods.
    pub fn resolve(&self, step_id: &str, descriptor: &ExecutableDescriptor) -> Result<(), DependencyError> {
        let class = self
            .lookup(&descriptor.executable_path, &descriptor.class_name)
            .ok_or_else(|| DependencyError::UnknownClass {
                step: step_id.to_string(),
                path: descriptor.executable_path.clone(),
                class_name: descriptor.class_name.clone(),
            })?;

        if !class.methods.iter().any(|m| *m == descriptor.entry_method_name) {
            return Err(DependencyError::UnknownMethod {
                step: step_id.to_string(),
                class_name: descriptor.class_name.clone(),
                method: descriptor.entry_method_name.clone(),
            });
        }

        Ok(())
    }

    /// Constructs the unit a descriptor names.
    pub fn construct(
        &self,
        descriptor: &ExecutableDescriptor,
        context: &UnitContext,
    ) -> Result<Box<dyn Executable>, UnitError> {
        let class = self
            .lookup(&descriptor.executable_path, &descriptor.class_name)
            .ok_or_else(|| {
                UnitError::new(format!(
                    "no executable registered for {}::{}",
                    descriptor.executable_path, descriptor.class_name
                ))
            })?;

        (class.factory)(context)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    fn lookup(&self, path: &str, class_name: &str) -> Option<&RegisteredClass> {
        self.classes.get(&(path.to_string(), class_name.to_string()))
    }
}
