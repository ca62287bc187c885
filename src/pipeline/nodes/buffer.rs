//! Decouples a producer from its downstream with a queue and a collector thread.

use crate::pipeline::error::PipelineResult;
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::nodes::fork_join::drain;
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::WorkQueue;
use crate::pipeline::shutdown::WorkerGroup;
use clap::{value_parser, Arg, ArgMatches, Command};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
struct BufferSettings {
    warn_size: usize,
    packet_skip: u64,
}

pub struct Buffer {
    core: Arc<ModuleCore>,
    settings: Mutex<BufferSettings>,
    queue: Arc<WorkQueue<Packet>>,
    received: AtomicU64,
    started: Mutex<bool>,
    workers: WorkerGroup,
}

impl Buffer {
    pub fn new(id: &str) -> Self {
        Self::with_settings(
            ModuleCore::new(id),
            BufferSettings {
                warn_size: 1024,
                packet_skip: 1,
            },
        )
    }

    fn with_settings(core: ModuleCore, settings: BufferSettings) -> Self {
        Self {
            core: Arc::new(core),
            settings: Mutex::new(settings),
            queue: Arc::new(WorkQueue::new()),
            received: AtomicU64::new(0),
            started: Mutex::new(false),
            workers: WorkerGroup::new(),
        }
    }

    /// Packets queued or being forwarded.
    pub fn backlog(&self) -> usize {
        self.queue.in_flight()
    }

    /// Start the collector on first use. Duplicates never see `initialize`.
    fn ensure_started(&self) -> PipelineResult<()> {
        let mut started = lock(&self.started);
        if *started {
            return Ok(());
        }
        let queue = self.queue.clone();
        let core = self.core.clone();
        self.workers
            .spawn(format!("{}-buffer", core.id()), move |signal| {
                drain(&queue, &signal, |packet| {
                    core.submit_data(packet, DEFAULT_CHANNEL)
                });
            })?;
        *started = true;
        Ok(())
    }
}

impl Module for Buffer {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "Buffer"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("warnsize")
                .long("warnsize")
                .value_parser(value_parser!(usize))
                .default_value("1024")
                .help("backlog size that triggers a warning"),
        )
        .arg(
            Arg::new("packetskip")
                .long("packetskip")
                .value_parser(value_parser!(u64).range(1..))
                .default_value("1")
                .help("forward only every n-th packet"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        let mut settings = lock(&self.settings);
        if let Some(size) = matches.get_one::<usize>("warnsize") {
            settings.warn_size = *size;
        }
        if let Some(skip) = matches.get_one::<u64>("packetskip") {
            settings.packet_skip = *skip;
        }
        Ok(())
    }

    fn initialize(&self) -> PipelineResult<()> {
        self.ensure_started()
    }

    fn on_incoming_data(&self, packet: &mut Packet, _channel: &str) -> PipelineResult<()> {
        self.ensure_started()?;
        let settings = *lock(&self.settings);
        let n = self.received.fetch_add(1, Ordering::AcqRel);
        if n % settings.packet_skip != 0 {
            return Ok(());
        }
        self.queue.push(packet.clone());
        let backlog = self.queue.len();
        if backlog > settings.warn_size {
            tracing::warn!(module = %self.core.id(), backlog, "buffer is growing");
        }
        Ok(())
    }

    fn flush(&self) {
        let signal = self.workers.signal();
        while self.queue.in_flight() > 0 && !signal.is_triggered() {
            std::thread::yield_now();
        }
    }

    fn shutdown(&self) {
        self.workers.shutdown();
    }

    fn on_read_property(&self, name: &str) -> String {
        match name {
            "backlog" => self.backlog().to_string(),
            _ => String::new(),
        }
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self::with_settings(
            self.core.duplicate(),
            *lock(&self.settings),
        )))
    }
}
