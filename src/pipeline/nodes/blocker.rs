//! Rate limiting: holds every packet for a fixed time before forwarding.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::Packet;
use crate::pipeline::shutdown::ShutdownTrigger;
use clap::{value_parser, Arg, ArgMatches, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct Blocker {
    core: ModuleCore,
    /// Seconds; negative blocks until shutdown.
    wait: Mutex<f64>,
    trigger: ShutdownTrigger,
}

impl Blocker {
    pub fn new(id: &str) -> Self {
        Self::with_wait(ModuleCore::new(id), 1.0)
    }

    fn with_wait(core: ModuleCore, wait: f64) -> Self {
        Self {
            core,
            wait: Mutex::new(wait),
            trigger: ShutdownTrigger::new(),
        }
    }
}

impl Module for Blocker {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "Blocker"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("wait")
                .long("wait")
                .value_parser(value_parser!(f64))
                .allow_negative_numbers(true)
                .default_value("1")
                .help("seconds to hold each packet (negative: until shutdown)"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        if let Some(wait) = matches.get_one::<f64>("wait") {
            *lock(&self.wait) = *wait;
        }
        Ok(())
    }

    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        let wait = *lock(&self.wait);
        let signal = self.trigger.signal();
        if wait < 0.0 {
            signal.wait();
        } else if signal.wait_timeout(Duration::from_secs_f64(wait)) {
            return Ok(());
        }
        self.core.submit_data(packet, channel)
    }

    fn shutdown(&self) {
        self.trigger.fire();
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self::with_wait(
            self.core.duplicate(),
            *lock(&self.wait),
        )))
    }
}
