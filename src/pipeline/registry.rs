//! Module factory registry.
//!
//! Module types are resolved by name when a description is loaded. The
//! registry owns one factory per type name; looking up an unknown name is a
//! configuration error.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::module::SharedModule;
use std::collections::HashMap;
use std::sync::Arc;

/// Creates module instances of one type.
pub trait ModuleFactory: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Human-readable summary of expected construction parameters.
    fn construction_parameters(&self) -> &str {
        ""
    }

    fn can_be_source(&self) -> bool {
        false
    }

    fn create(&self, id: &str) -> SharedModule;
}

/// Factory for a type compiled into this crate.
pub struct BuiltinFactory {
    name: &'static str,
    description: &'static str,
    can_be_source: bool,
    ctor: fn(&str) -> SharedModule,
}

impl BuiltinFactory {
    pub fn new(
        name: &'static str,
        description: &'static str,
        ctor: fn(&str) -> SharedModule,
    ) -> Self {
        Self {
            name,
            description,
            can_be_source: false,
            ctor,
        }
    }

    pub fn source(mut self) -> Self {
        self.can_be_source = true;
        self
    }
}

impl ModuleFactory for BuiltinFactory {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn can_be_source(&self) -> bool {
        self.can_be_source
    }

    fn create(&self, id: &str) -> SharedModule {
        (self.ctor)(id)
    }
}

/// Type name to factory lookup.
#[derive(Default)]
pub struct ModuleRegistry {
    factories: HashMap<String, Arc<dyn ModuleFactory>>,
}

impl ModuleRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in module type.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::pipeline::nodes::register_builtins(&mut registry);
        registry
    }

    /// Register a factory, replacing any previous one with the same name.
    pub fn register(&mut self, factory: Arc<dyn ModuleFactory>) {
        let name = factory.name().to_string();
        if self.factories.insert(name.clone(), factory).is_some() {
            tracing::warn!("module type '{}' registered twice, keeping the last", name);
        }
    }

    pub fn contains(&self, module_type: &str) -> bool {
        self.factories.contains_key(module_type)
    }

    pub fn factory(&self, module_type: &str) -> Option<Arc<dyn ModuleFactory>> {
        self.factories.get(module_type).cloned()
    }

    pub fn create(&self, module_type: &str, id: &str) -> PipelineResult<SharedModule> {
        let factory = self.factories.get(module_type).ok_or_else(|| {
            PipelineError::config(format!("cannot find module type '{}'", module_type))
        })?;
        Ok(factory.create(id))
    }

    /// Registered type names, sorted.
    pub fn list_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl std::fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("types", &self.list_types())
            .finish()
    }
}
