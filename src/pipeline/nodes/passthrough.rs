//! Modules that only route packets.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::Packet;
use clap::{Arg, ArgMatches, Command};
use std::sync::{Arc, Mutex};

/// Forwards every packet on the channel it arrived on.
#[derive(Debug)]
pub struct Passthrough {
    core: ModuleCore,
}

impl Passthrough {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
        }
    }
}

impl Module for Passthrough {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "Passthrough"
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self {
            core: self.core.duplicate(),
        }))
    }
}

/// Re-emits every packet on one configured channel.
#[derive(Debug)]
pub struct ForceChannel {
    core: ModuleCore,
    channel: Mutex<String>,
}

impl ForceChannel {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
            channel: Mutex::new(DEFAULT_CHANNEL.to_string()),
        }
    }

    pub fn channel(&self) -> String {
        lock(&self.channel).clone()
    }
}

impl Module for ForceChannel {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "ForceChannel"
    }

    fn on_incoming_data(&self, packet: &mut Packet, _channel: &str) -> PipelineResult<()> {
        let channel = self.channel();
        self.core.submit_data(packet, &channel)
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("channel")
                .long("channel")
                .default_value(DEFAULT_CHANNEL)
                .help("output channel"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        if let Some(channel) = matches.get_one::<String>("channel") {
            *lock(&self.channel) = channel.clone();
        }
        Ok(())
    }

    fn on_read_property(&self, name: &str) -> String {
        match name {
            "channel" => self.channel(),
            _ => String::new(),
        }
    }

    fn on_write_property(&self, name: &str, value: &str) -> String {
        if name != "channel" || value.is_empty() {
            return String::new();
        }
        let _guard = self.core.lock_properties();
        *lock(&self.channel) = value.to_string();
        self.core.mark_reconfigure();
        value.to_string()
    }

    fn on_enumerate_properties(&self) -> String {
        "channel".to_string()
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self {
            core: self.core.duplicate(),
            channel: Mutex::new(self.channel()),
        }))
    }
}

type Callback = dyn Fn(&mut Packet, &str) -> PipelineResult<()> + Send + Sync;

/// Hands every packet to a closure. Used when embedding a pipeline.
///
/// Duplicates share the closure.
pub struct CallbackSink {
    core: ModuleCore,
    callback: Arc<Callback>,
}

impl CallbackSink {
    pub fn new<F>(id: &str, callback: F) -> Self
    where
        F: Fn(&mut Packet, &str) -> PipelineResult<()> + Send + Sync + 'static,
    {
        Self {
            core: ModuleCore::new(id),
            callback: Arc::new(callback),
        }
    }
}

impl Module for CallbackSink {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "CallbackSink"
    }

    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        (self.callback)(packet, channel)
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self {
            core: self.core.duplicate(),
            callback: self.callback.clone(),
        }))
    }
}
