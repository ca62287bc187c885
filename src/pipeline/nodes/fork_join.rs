//! Fork/join parallel executor.
//!
//! The executor owns a prototype subgraph registered on the `template`
//! channel and runs it on a pool of worker threads:
//!
//! ```text
//!               ┌─► worker 0 ─► template (original) ─┐
//! default ─► incoming ─► worker 1 ─► template clone ─┤─► Joiner ─_join─► outgoing ─► collector ─► default
//!               └─► worker n ─► template clone ─┘
//! ```
//!
//! Packets on `default` are copied onto the incoming queue. Whatever the
//! template re-emits on `_join` lands on the outgoing queue and the collector
//! forwards it on the executor's own `default` channel, in completion order.
//! A resolved thread count of zero turns the executor into a pass-through.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::module::{lock, Module, ModuleCore, SharedModule};
use crate::pipeline::packet::Packet;
use crate::pipeline::queue::WorkQueue;
use crate::pipeline::shutdown::{ShutdownSignal, WorkerGroup};
use clap::{value_parser, Arg, ArgMatches, Command};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const TEMPLATE_CHANNEL: &str = "template";
pub const JOIN_CHANNEL: &str = "_join";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Unconfigured,
    Initialized,
    Running,
}

#[derive(Debug, Clone, Copy)]
struct ForkSettings {
    /// Negative: all hardware threads.
    threads: i64,
    stateless: bool,
}

pub struct ForkJoinExecutor {
    core: Arc<ModuleCore>,
    settings: Mutex<ForkSettings>,
    state: Mutex<ExecutorState>,
    passthrough: AtomicBool,
    incoming: Arc<WorkQueue<Packet>>,
    outgoing: Arc<WorkQueue<Packet>>,
    workers: WorkerGroup,
}

impl ForkJoinExecutor {
    pub fn new(id: &str) -> Self {
        Self {
            core: Arc::new(ModuleCore::new(id)),
            settings: Mutex::new(ForkSettings {
                threads: -1,
                stateless: false,
            }),
            state: Mutex::new(ExecutorState::Unconfigured),
            passthrough: AtomicBool::new(false),
            incoming: Arc::new(WorkQueue::new()),
            outgoing: Arc::new(WorkQueue::new()),
            workers: WorkerGroup::new(),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *lock(&self.state)
    }

    /// Thread count after applying the hardware limit; 0 means pass-through.
    pub fn resolved_threads(&self) -> usize {
        let hardware = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let requested = lock(&self.settings).threads;
        if requested < 0 {
            hardware
        } else {
            hardware.min(requested as usize)
        }
    }

    /// Packets pushed but not yet fully handled, `(incoming, outgoing)`.
    pub fn backlog(&self) -> (usize, usize) {
        (self.incoming.in_flight(), self.outgoing.in_flight())
    }

    /// Worker threads currently owned, collector included.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn template(&self) -> PipelineResult<SharedModule> {
        let mut templates = self.core.sinks(TEMPLATE_CHANNEL);
        match templates.len() {
            1 => Ok(templates.remove(0).module),
            0 => Err(PipelineError::Initialization {
                module: self.core.id().to_string(),
                message: "template channel is empty".into(),
            }),
            n => Err(PipelineError::Initialization {
                module: self.core.id().to_string(),
                message: format!("template channel is invalid: {} sinks registered", n),
            }),
        }
    }

    fn spawn_worker(&self, index: usize, replica: SharedModule) -> PipelineResult<()> {
        let incoming = self.incoming.clone();
        let id = self.core.id().to_string();
        self.workers
            .spawn(format!("{}-worker-{}", id, index), move |signal| {
                drain(&incoming, &signal, |packet| {
                    replica.on_incoming_data(packet, DEFAULT_CHANNEL)
                });
                tracing::trace!(executor = %id, index, "worker stopped");
            })?;
        Ok(())
    }

    fn spawn_collector(&self) -> PipelineResult<()> {
        let outgoing = self.outgoing.clone();
        let core = self.core.clone();
        self.workers
            .spawn(format!("{}-collector", core.id()), move |signal| {
                drain(&outgoing, &signal, |packet| {
                    core.submit_data(packet, DEFAULT_CHANNEL)
                });
            })?;
        Ok(())
    }
}

/// Pop and handle items until the queue's owner shuts down.
pub(crate) fn drain<F>(queue: &WorkQueue<Packet>, signal: &ShutdownSignal, mut handle: F)
where
    F: FnMut(&mut Packet) -> PipelineResult<()>,
{
    let rx = queue.receiver();
    loop {
        crossbeam_channel::select! {
            recv(rx) -> item => {
                let Ok(mut packet) = item else { break };
                if let Err(e) = handle(&mut packet) {
                    tracing::error!("dropping packet after dispatch failure: {}", e);
                }
                queue.complete();
            }
            recv(signal.receiver()) -> _ => break,
        }
    }
}

impl Module for ForkJoinExecutor {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "ParExecutor"
    }

    fn setup_options(&self, cmd: Command) -> Command {
        cmd.arg(
            Arg::new("threads")
                .long("threads")
                .value_parser(value_parser!(i64))
                .allow_negative_numbers(true)
                .default_value("-1")
                .help("worker threads (-1: all hardware threads, 0: pass-through)"),
        )
        .arg(
            Arg::new("stateless")
                .long("stateless")
                .value_parser(value_parser!(bool))
                .default_value("false")
                .help("share one template instance between workers"),
        )
    }

    fn apply_options(&self, matches: &ArgMatches) -> PipelineResult<()> {
        let mut settings = lock(&self.settings);
        if let Some(threads) = matches.get_one::<i64>("threads") {
            settings.threads = *threads;
        }
        if let Some(stateless) = matches.get_one::<bool>("stateless") {
            settings.stateless = *stateless;
        }
        *lock(&self.state) = ExecutorState::Initialized;
        Ok(())
    }

    fn initialize(&self) -> PipelineResult<()> {
        if self.state() == ExecutorState::Running {
            return Ok(());
        }
        let template = self.template()?;
        let threads = self.resolved_threads();
        if threads == 0 {
            self.passthrough.store(true, Ordering::Release);
            tracing::info!(executor = %self.core.id(), "running as pass-through");
            return Ok(());
        }

        let stateless = lock(&self.settings).stateless;
        for index in 1..threads {
            let replica = if stateless {
                template.clone()
            } else {
                template.clone_module()?
            };
            self.spawn_worker(index, replica)?;
        }
        self.spawn_worker(0, template)?;
        self.spawn_collector()?;
        *lock(&self.state) = ExecutorState::Running;
        tracing::info!(
            executor = %self.core.id(),
            threads,
            stateless,
            "fork/join executor started"
        );
        Ok(())
    }

    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        if channel != JOIN_CHANNEL && channel != DEFAULT_CHANNEL {
            tracing::trace!(executor = %self.core.id(), channel, "ignoring packet on unhandled channel");
            return Ok(());
        }
        if self.passthrough.load(Ordering::Acquire) {
            // Same entry point the workers use, so the template cannot tell the modes apart
            return if channel == JOIN_CHANNEL {
                self.core.submit_data(packet, DEFAULT_CHANNEL)
            } else {
                self.template()?.on_incoming_data(packet, DEFAULT_CHANNEL)
            };
        }
        if self.state() != ExecutorState::Running {
            return Err(PipelineError::module(
                self.core.id(),
                "received data before initialize",
            ));
        }
        if channel == JOIN_CHANNEL {
            self.outgoing.push(packet.clone());
        } else {
            self.incoming.push(packet.clone());
        }
        Ok(())
    }

    fn flush(&self) {
        let signal = self.workers.signal();
        while self.incoming.in_flight() > 0 || self.outgoing.in_flight() > 0 {
            if signal.is_triggered() {
                tracing::warn!(
                    executor = %self.core.id(),
                    "flush abandoned, executor is shutting down"
                );
                return;
            }
            std::thread::yield_now();
        }
    }

    fn shutdown(&self) {
        self.workers.shutdown();
    }

    fn on_read_property(&self, name: &str) -> String {
        match name {
            "threads" => self.resolved_threads().to_string(),
            "backlog" => {
                let (incoming, outgoing) = self.backlog();
                (incoming + outgoing).to_string()
            }
            _ => String::new(),
        }
    }

    fn on_enumerate_properties(&self) -> String {
        "threads,backlog".to_string()
    }
}

/// Sends everything it receives back to the executor on `_join`.
#[derive(Debug)]
pub struct Joiner {
    core: ModuleCore,
}

impl Joiner {
    pub fn new(id: &str) -> Self {
        Self {
            core: ModuleCore::new(id),
        }
    }
}

impl Module for Joiner {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn type_name(&self) -> &str {
        "Joiner"
    }

    fn on_incoming_data(&self, packet: &mut Packet, _channel: &str) -> PipelineResult<()> {
        self.core.submit_data(packet, JOIN_CHANNEL)
    }

    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Ok(Arc::new(Self {
            core: self.core.duplicate(),
        }))
    }
}
