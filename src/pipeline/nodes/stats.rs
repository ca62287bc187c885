//! Throughput statistics around downstream processing.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::Packet;
use clap::{value_parser, Arg, ArgMatches, Command};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct Window {
    packets: u64,
    elapsed: Duration,
}

pub struct Stats {
    core: ModuleCore,
    interval: Mutex<u64>,
    window: Mutex<Window>,
    total: Mutex<u64>,
}

impl Stats {
    pub fn new(id: &str) -> Self {
        Self::with_interval(ModuleCore::new(id), 256)
    }

    fn with_interval(core: ModuleCore, interval: u64) -> Self {
        Self {
            core,
            interval: Mutex::new(interval),
            window: Mutex::new(Window::default()),
            total: Mutex::new(0),
        }
    }

    pub fn total_packets(&self) -> u64 {
        *lock(&self.total)
    }
}

impl Module for Stats {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "Stats"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("statsinterval")
                .long("statsinterval")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("256")
                .help("packets between two stats reports"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        if let Some(interval) = matches.get_one::<u64>("statsinterval") {
            *lock(&self.interval) = *interval;
        }
        Ok(())
    }

    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        let started = Instant::now();
        let result = self.core.submit_data(packet, channel);
        let elapsed = started.elapsed();
        *lock(&self.total) += 1;

        let interval = *lock(&self.interval);
        let mut window = lock(&self.window);
        if self.core.take_reconfigure() {
            tracing::debug!(module = %self.core.id(), interval, "stats window restarted");
            *window = Window::default();
        }
        window.packets += 1;
        window.elapsed += elapsed;
        if window.packets >= interval {
            let secs = window.elapsed.as_secs_f64();
            let pps = if secs > 0.0 {
                window.packets as f64 / secs
            } else {
                f64::INFINITY
            };
            tracing::info!(
                module = %self.core.id(),
                packets = window.packets,
                avg_ms = secs * 1000.0 / window.packets as f64,
                pps,
                "processing stats"
            );
            *window = Window::default();
        }
        result
    }

    fn on_read_property(&self, name: &str) -> String {
        match name {
            "packets" => self.total_packets().to_string(),
            "statsinterval" => lock(&self.interval).to_string(),
            _ => String::new(),
        }
    }

    fn on_write_property(&self, name: &str, value: &str) -> String {
        if name != "statsinterval" {
            return String::new();
        }
        let Some(interval) = value.parse::<u64>().ok().filter(|i| *i > 0) else {
            return String::new();
        };
        let _guard = self.core.lock_properties();
        *lock(&self.interval) = interval;
        self.core.mark_reconfigure();
        interval.to_string()
    }

    fn on_enumerate_properties(&self) -> String {
        "packets,statsinterval".to_string()
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self::with_interval(
            self.core.duplicate(),
            *lock(&self.interval),
        )))
    }
}
