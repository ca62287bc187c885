//! Turns a [`PipelineGraph`] into running module instances.
//!
//! The loader owns every instance it creates. Building happens in strict
//! phases:
//!
//! 1. create each non-disabled module through the registry, pass its
//!    construction params, apply its named params as options;
//! 2. wire every link, once all modules exist;
//! 3. call `initialize()` on every module, in declaration order.
//!
//! [`Loader::run`] then drives the source. [`Loader::flush`] sweeps every
//! module once per registered module before finalizing, so chains of
//! buffering modules settle. [`Loader::shutdown`] stops workers and breaks
//! reference cycles; it also runs on drop.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::PipelineGraph;
use crate::pipeline::module::{configure_module, SharedModule};
use crate::pipeline::registry::ModuleRegistry;
use crate::pipeline::shutdown::{ShutdownSignal, ShutdownTrigger};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct Loader {
    registry: Arc<ModuleRegistry>,
    modules: Vec<SharedModule>,
    index: HashMap<String, usize>,
    source: Option<String>,
    trigger: ShutdownTrigger,
    stopped: AtomicBool,
}

impl Loader {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            modules: Vec::new(),
            index: HashMap::new(),
            source: None,
            trigger: ShutdownTrigger::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Build, wire and initialize `graph`.
    pub fn from_graph(registry: Arc<ModuleRegistry>, graph: &PipelineGraph) -> PipelineResult<Self> {
        let mut loader = Self::new(registry);
        loader.load(graph)?;
        Ok(loader)
    }

    pub fn load(&mut self, graph: &PipelineGraph) -> PipelineResult<()> {
        for descriptor in graph.modules() {
            let module = self
                .registry
                .create(&descriptor.module_type, &descriptor.id)
                .map_err(|e| e.with_context(format!("module '{}'", descriptor.id)))?;
            module.construct(&descriptor.construction_params)?;
            configure_module(
                module.as_ref(),
                descriptor
                    .named_params
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            )?;
            self.register(module)?;
            if self.source.is_none() {
                self.source = Some(descriptor.id.clone());
            }
        }

        if let Some(source) = &graph.source {
            if !self.index.contains_key(source) {
                return Err(PipelineError::config(format!(
                    "source module '{}' is not defined",
                    source
                )));
            }
            self.source = Some(source.clone());
        }

        for link in &graph.links {
            if link.channel.is_empty() {
                return Err(PipelineError::config(format!(
                    "link {} -> {}: channel cannot be empty",
                    link.from, link.to
                )));
            }
            let from = self.module(&link.from).ok_or_else(|| {
                PipelineError::config(format!(
                    "link {} -> {}: unknown source module '{}'",
                    link.from, link.to, link.from
                ))
            })?;
            let to = self.module(&link.to).ok_or_else(|| {
                PipelineError::config(format!(
                    "link {} -> {}: unknown destination module '{}'",
                    link.from, link.to, link.to
                ))
            })?;
            from.connect_sink(to, &link.channel, link.debug);
        }

        self.initialize_all()?;
        tracing::info!(
            modules = self.modules.len(),
            links = graph.links.len(),
            source = self.source.as_deref().unwrap_or("<none>"),
            "pipeline loaded"
        );
        Ok(())
    }

    /// Add an already constructed instance.
    pub fn register(&mut self, module: SharedModule) -> PipelineResult<()> {
        let id = module.id().to_string();
        if self.index.contains_key(&id) {
            return Err(PipelineError::config(format!("duplicate module id '{}'", id)));
        }
        self.index.insert(id, self.modules.len());
        self.modules.push(module);
        Ok(())
    }

    fn initialize_all(&self) -> PipelineResult<()> {
        for module in &self.modules {
            module
                .initialize()
                .map_err(|e| e.with_context(format!("initializing '{}'", module.id())))?;
        }
        Ok(())
    }

    pub fn module(&self, id: &str) -> Option<SharedModule> {
        self.index.get(id).map(|&i| self.modules[i].clone())
    }

    pub fn modules(&self) -> &[SharedModule] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn source_id(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Signal handed to the source; fires on [`Loader::request_stop`].
    pub fn signal(&self) -> ShutdownSignal {
        self.trigger.signal()
    }

    pub fn request_stop(&self) {
        self.trigger.fire();
    }

    /// Run the source's control loop on the calling thread.
    pub fn run(&self) -> PipelineResult<()> {
        let id = self
            .source
            .as_deref()
            .ok_or_else(|| PipelineError::config("pipeline has no modules"))?;
        let source = self
            .module(id)
            .ok_or_else(|| PipelineError::config(format!("source module '{}' is not defined", id)))?;
        tracing::info!(source = id, "starting processing");
        source.start_processing(&self.signal())
    }

    /// Drain every module, then finalize each.
    pub fn flush(&self) {
        let passes = self.modules.len();
        for _ in 0..passes {
            for module in &self.modules {
                module.flush();
            }
        }
        for module in &self.modules {
            module.finalize();
        }
    }

    /// Stop all worker threads and release the module graph.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.request_stop();
        for module in &self.modules {
            module.shutdown();
        }
        for module in &self.modules {
            module.core().clear_sinks();
        }
    }

    /// Load, run, flush and shut down in one go.
    pub fn run_to_completion(registry: Arc<ModuleRegistry>, graph: &PipelineGraph) -> PipelineResult<()> {
        let loader = Self::from_graph(registry, graph)?;
        let result = loader.run();
        loader.flush();
        loader.shutdown();
        result
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader")
            .field("modules", &self.modules.len())
            .field("source", &self.source)
            .finish()
    }
}
