//! Spreads packets over numbered output channels.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::Packet;
use clap::{value_parser, Arg, ArgMatches, Command};
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Default)]
struct BalancerSettings {
    /// Output channels are `"0"..sinks`; zero forwards on `default`.
    sinks: usize,
    random: bool,
}

pub struct LoadBalancer {
    core: ModuleCore,
    settings: Mutex<BalancerSettings>,
    next: AtomicUsize,
}

impl LoadBalancer {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
            settings: Mutex::new(BalancerSettings::default()),
            next: AtomicUsize::new(0),
        }
    }
}

impl Module for LoadBalancer {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "LoadBalancer"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("sinks")
                .long("sinks")
                .value_parser(value_parser!(usize))
                .default_value("0")
                .help("number of numbered output channels"),
        )
        .arg(
            Arg::new("random")
                .long("random")
                .value_parser(value_parser!(bool))
                .default_value("false")
                .help("pick channels at random instead of round-robin"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        let mut settings = lock(&self.settings);
        if let Some(sinks) = matches.get_one::<usize>("sinks") {
            settings.sinks = *sinks;
        }
        if let Some(random) = matches.get_one::<bool>("random") {
            settings.random = *random;
        }
        Ok(())
    }

    fn on_incoming_data(&self, packet: &mut Packet, _channel: &str) -> PipelineResult<()> {
        let settings = *lock(&self.settings);
        if settings.sinks == 0 {
            return self.core.submit_data(packet, DEFAULT_CHANNEL);
        }
        let index = if settings.random {
            rand::thread_rng().gen_range(0..settings.sinks)
        } else {
            self.next.fetch_add(1, Ordering::Relaxed) % settings.sinks
        };
        self.core.submit_data(packet, &index.to_string())
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self {
            core: self.core.duplicate(),
            settings: Mutex::new(*lock(&self.settings)),
            next: AtomicUsize::new(0),
        }))
    }
}
