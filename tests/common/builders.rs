//! Test data builders for graphs and recording modules

use pipemesh::pipeline::{
    LinkDescriptor, Module, ModuleCore, ModuleDescriptor, ModuleFactory, ModuleRegistry, Packet,
    PipelineGraph, PipelineResult, SharedModule,
};
use std::sync::{Arc, Mutex};

/// Builder for pipeline graphs
#[derive(Default)]
pub struct GraphBuilder {
    graph: PipelineGraph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn module(self, id: &str, module_type: &str) -> Self {
        self.with(ModuleDescriptor::new(id, module_type))
    }

    pub fn with(mut self, module: ModuleDescriptor) -> Self {
        self.graph.add_module(module).expect("duplicate module id");
        self
    }

    pub fn link(self, from: &str, to: &str) -> Self {
        self.link_on(from, to, "default")
    }

    pub fn link_on(mut self, from: &str, to: &str, channel: &str) -> Self {
        self.graph
            .add_link(LinkDescriptor::new(from, to).on_channel(channel));
        self
    }

    pub fn source(mut self, id: &str) -> Self {
        self.graph.source = Some(id.to_string());
        self
    }

    pub fn build(self) -> PipelineGraph {
        self.graph
    }
}

/// Packets seen by every `Recorder` sharing one log, with their channel
pub type PacketLog = Arc<Mutex<Vec<(String, Packet)>>>;

/// Sink that records what it receives and forwards nothing
pub struct Recorder {
    core: ModuleCore,
    log: PacketLog,
}

impl Module for Recorder {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "Recorder"
    }

    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        self.log
            .lock()
            .unwrap()
            .push((channel.to_string(), packet.clone()));
        Ok(())
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Recorder {
            core: self.core.duplicate(),
            log: self.log.clone(),
        }))
    }
}

/// Creates `Recorder`s that all write into the same log
pub struct RecorderFactory {
    log: PacketLog,
}

impl ModuleFactory for RecorderFactory {
    fn name(&self) -> &str {
        "Recorder"
    }

    fn description(&self) -> &str {
        "Record packets for assertions"
    }

    fn create(&self, id: &str) -> SharedModule {
        Arc::new(Recorder {
            core: ModuleCore::new(id),
            log: self.log.clone(),
        })
    }
}

/// Built-in registry plus a `Recorder` type, and the log it writes to
pub fn recording_registry() -> (Arc<ModuleRegistry>, PacketLog) {
    let log: PacketLog = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ModuleRegistry::with_builtins();
    registry.register(Arc::new(RecorderFactory { log: log.clone() }));
    (Arc::new(registry), log)
}

/// Payloads of a log as text, in arrival order
pub fn texts(log: &PacketLog) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .map(|(_, p)| p.text().into_owned())
        .collect()
}
