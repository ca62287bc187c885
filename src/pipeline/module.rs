//! The module runtime contract.
//!
//! Every instantiated node implements [`Module`]. Shared plumbing (id,
//! property lock, reconfigure flag, sink adjacency) lives in [`ModuleCore`],
//! which each module embeds and exposes through [`Module::core`].
//!
//! Dispatch is synchronous: [`ModuleCore::submit_data`] calls straight into
//! each sink's [`Module::on_incoming_data`] on the caller's thread, in
//! registration order. A channel without sinks swallows the packet.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::graph::DEFAULT_CHANNEL;
use crate::pipeline::packet::Packet;
use crate::pipeline::shutdown::ShutdownSignal;
use clap::{ArgMatches, Command};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;

/// Shared handle to a module instance.
pub type SharedModule = Arc<dyn Module>;

/// One registered edge out of a module.
#[derive(Clone)]
pub struct SinkLink {
    pub module: SharedModule,
    pub debug: bool,
}

/// State every module carries regardless of type.
pub struct ModuleCore {
    id: String,
    property_lock: Mutex<()>,
    reconfigure: AtomicBool,
    sinks: RwLock<HashMap<String, Vec<SinkLink>>>,
}

impl ModuleCore {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            property_lock: Mutex::new(()),
            reconfigure: AtomicBool::new(false),
            sinks: RwLock::new(HashMap::new()),
        }
    }

    /// Fresh core with the same id and no sinks, for duplicates.
    pub fn duplicate(&self) -> Self {
        Self::new(self.id.clone())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Register `sink` on `channel`; returns the sink for chaining.
    pub fn connect_sink(&self, sink: SharedModule, channel: &str, debug: bool) -> SharedModule {
        let mut sinks = self.sinks.write().unwrap_or_else(PoisonError::into_inner);
        sinks.entry(channel.to_string()).or_default().push(SinkLink {
            module: sink.clone(),
            debug,
        });
        sink
    }

    /// Sinks on `channel`, in registration order.
    pub fn sinks(&self, channel: &str) -> Vec<SinkLink> {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        sinks.get(channel).cloned().unwrap_or_default()
    }

    pub fn sink_count(&self, channel: &str) -> usize {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        sinks.get(channel).map_or(0, Vec::len)
    }

    /// Every channel with its sinks, channels sorted by name.
    pub fn channels(&self) -> Vec<(String, Vec<SinkLink>)> {
        let sinks = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<_> = sinks.iter().map(|(c, l)| (c.clone(), l.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Drop every outgoing edge. Used at shutdown to break `_join` cycles.
    pub fn clear_sinks(&self) {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `packet` to every sink on `channel`.
    ///
    /// The adjacency list is snapshotted first so no lock is held while a
    /// sink runs. Sink failures come back as [`PipelineError::Dispatch`].
    pub fn submit_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        for link in self.sinks(channel) {
            let started = link.debug.then(Instant::now);
            let result = link.module.on_incoming_data(packet, channel);
            if let Some(started) = started {
                tracing::info!(
                    source = %self.id,
                    sink = %link.module.core().id(),
                    sink_type = link.module.type_name(),
                    channel,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    ok = result.is_ok(),
                    "dispatch"
                );
            }
            result.map_err(|e| PipelineError::Dispatch {
                source_id: self.id.clone(),
                sink_id: link.module.core().id().to_string(),
                channel: channel.to_string(),
                source: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Hold the module-exclusive lock for a property read-modify-write.
    pub fn lock_properties(&self) -> MutexGuard<'_, ()> {
        self.property_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::Release);
    }

    /// Returns and clears the reconfigure flag.
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::AcqRel)
    }

    pub fn read_property(&self, name: &str, channel: &str) -> String {
        join_non_empty(
            self.sinks(channel)
                .iter()
                .map(|s| s.module.on_read_property(name)),
        )
    }

    pub fn write_property(&self, name: &str, value: &str, channel: &str) -> String {
        join_non_empty(
            self.sinks(channel)
                .iter()
                .map(|s| s.module.on_write_property(name, value)),
        )
    }

    pub fn enumerate_properties(&self, channel: &str) -> String {
        join_non_empty(
            self.sinks(channel)
                .iter()
                .map(|s| s.module.on_enumerate_properties()),
        )
    }
}

fn join_non_empty(values: impl Iterator<Item = String>) -> String {
    values
        .filter(|v| !v.is_empty())
        .collect::<Vec<_>>()
        .join(",")
}

impl std::fmt::Debug for ModuleCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let channels: Vec<(String, usize)> = self
            .channels()
            .into_iter()
            .map(|(c, links)| (c, links.len()))
            .collect();
        f.debug_struct("ModuleCore")
            .field("id", &self.id)
            .field("channels", &channels)
            .finish()
    }
}

/// The capability set every pipeline node implements.
///
/// Everything except [`Module::core`] and [`Module::type_name`] has a
/// default: a bare implementation forwards every packet unchanged on the
/// channel it arrived on.
pub trait Module: Send + Sync {
    fn core(&self) -> &ModuleCore;

    /// Registered type name, e.g. `ParExecutor`.
    fn type_name(&self) -> &str;

    /// Handle one packet arriving on `channel`.
    fn on_incoming_data(&self, packet: &mut Packet, channel: &str) -> PipelineResult<()> {
        self.core().submit_data(packet, channel)
    }

    /// Receive construction parameters, once, right after creation.
    fn construct(&self, _params: &[String]) -> PipelineResult<()> {
        Ok(())
    }

    /// Declare named options on top of `cmd`.
    fn setup_options(&self, cmd: Command) -> Command {
        cmd
    }

    /// Consume parsed named options. Called even when none were given, so
    /// defaults apply.
    fn apply_options(&self, _matches: &ArgMatches) -> PipelineResult<()> {
        Ok(())
    }

    /// Called once after the whole graph is wired.
    fn initialize(&self) -> PipelineResult<()> {
        Ok(())
    }

    /// Run the module's own control loop. Only sources implement this.
    fn start_processing(&self, _signal: &ShutdownSignal) -> PipelineResult<()> {
        Err(PipelineError::NotASource(self.core().id().to_string()))
    }

    /// Block until internally buffered packets have been handed downstream.
    fn flush(&self) {}

    /// Called after the final flush; aggregating sinks report here.
    fn finalize(&self) {}

    /// Stop and join any worker threads the module owns.
    fn shutdown(&self) {}

    fn on_read_property(&self, _name: &str) -> String {
        String::new()
    }

    /// Implementations must take [`ModuleCore::lock_properties`] and call
    /// [`ModuleCore::mark_reconfigure`] when they change state.
    fn on_write_property(&self, _name: &str, _value: &str) -> String {
        String::new()
    }

    fn on_enumerate_properties(&self) -> String {
        String::new()
    }

    /// New instance with the same configuration and no sinks.
    fn duplicate(&self) -> PipelineResult<SharedModule> {
        Err(PipelineError::NotCloneable(self.core().id().to_string()))
    }

    // ── Provided ──

    fn id(&self) -> &str {
        self.core().id()
    }

    fn connect_sink(&self, sink: SharedModule, channel: &str, debug: bool) -> SharedModule {
        self.core().connect_sink(sink, channel, debug)
    }

    fn submit_data(&self, packet: &mut Packet) -> PipelineResult<()> {
        self.core().submit_data(packet, DEFAULT_CHANNEL)
    }

    /// Read `name` from every sink on `channel`, comma joined.
    fn read_property(&self, name: &str, channel: &str) -> String {
        self.core().read_property(name, channel)
    }

    fn write_property(&self, name: &str, value: &str, channel: &str) -> String {
        self.core().write_property(name, value, channel)
    }

    fn enumerate_properties(&self, channel: &str) -> String {
        self.core().enumerate_properties(channel)
    }

    /// Deep copy of this module and everything reachable downstream.
    ///
    /// Edges on `_`-prefixed channels are back-edges to join points and are
    /// re-pointed at the original instances instead of being copied.
    fn clone_module(&self) -> PipelineResult<SharedModule> {
        let head = self.duplicate()?;
        for (channel, links) in self.core().channels() {
            for link in links {
                let target = if channel.starts_with('_') {
                    link.module.clone()
                } else {
                    link.module.clone_module()?
                };
                head.core().connect_sink(target, &channel, link.debug);
            }
        }
        Ok(head)
    }
}

impl std::fmt::Debug for dyn Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id())
            .field("type", &self.type_name())
            .finish()
    }
}

/// Build the options command for `module` and parse `args` against it.
///
/// `args` are `(key, value)` pairs rendered as `--key value`; keys the
/// module does not declare are rejected.
pub fn configure_module<'a, I>(module: &dyn Module, args: I) -> PipelineResult<()>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let cmd = module.setup_options(
        Command::new(module.id().to_string())
            .no_binary_name(true)
            .disable_help_flag(true)
            .disable_version_flag(true),
    );
    let mut argv: Vec<String> = Vec::new();
    for (key, value) in args {
        argv.push(format!("--{}", key));
        argv.push(value.to_string());
    }
    let matches = cmd.try_get_matches_from(argv).map_err(|e| {
        PipelineError::config(format!(
            "invalid options for module '{}': {}",
            module.id(),
            e.to_string().trim()
        ))
    })?;
    module.apply_options(&matches)
}

/// Lock a mutex, recovering the data if a panicking thread poisoned it.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::nodes::{CallbackSink, ForceChannel, Passthrough};
    use std::sync::Mutex as StdMutex;

    fn recorder(id: &str, log: Arc<StdMutex<Vec<String>>>) -> SharedModule {
        let tag = id.to_string();
        Arc::new(CallbackSink::new(id, move |packet, _channel| {
            log.lock().unwrap().push(format!("{}:{}", tag, packet.text()));
            Ok(())
        }))
    }

    #[test]
    fn test_fan_out_in_registration_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let head = Passthrough::new("head");
        for id in ["a", "b", "c"] {
            head.connect_sink(recorder(id, log.clone()), "default", false);
        }
        head.on_incoming_data(&mut Packet::from_text("p"), "default")
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a:p", "b:p", "c:p"]);
    }

    #[test]
    fn test_properties_join_across_sinks() {
        let head = Passthrough::new("head");
        let first = Arc::new(ForceChannel::new("first"));
        let second = Arc::new(ForceChannel::new("second"));
        configure_module(first.as_ref(), [("channel", "a")]).unwrap();
        configure_module(second.as_ref(), [("channel", "b")]).unwrap();
        head.connect_sink(first.clone(), "default", false);
        head.connect_sink(Arc::new(Passthrough::new("plain")), "default", false);
        head.connect_sink(second.clone(), "default", false);

        // The plain sink answers with nothing and is left out of the join
        assert_eq!(head.core().read_property("channel", "default"), "a,b");
        assert_eq!(head.core().enumerate_properties("default"), "channel,channel");
        assert_eq!(head.core().write_property("channel", "c", "default"), "c,c");
        assert_eq!((first.channel(), second.channel()), ("c".into(), "c".into()));
        assert_eq!(head.core().write_property("channel", "", "default"), "");
        assert_eq!(head.core().read_property("channel", "other"), "");
    }

    #[test]
    fn test_channel_without_sinks_is_noop() {
        let head = Passthrough::new("head");
        head.core()
            .submit_data(&mut Packet::from_text("p"), "nowhere")
            .unwrap();
    }

    #[test]
    fn test_sink_failure_is_wrapped() {
        let head = Passthrough::new("head");
        head.connect_sink(
            Arc::new(CallbackSink::new("bad", |_, _| {
                Err(PipelineError::module("bad", "rejected"))
            })),
            "default",
            true,
        );
        let err = head
            .on_incoming_data(&mut Packet::default(), "default")
            .unwrap_err();
        match err {
            PipelineError::Dispatch {
                source_id,
                sink_id,
                channel,
                ..
            } => {
                assert_eq!(source_id, "head");
                assert_eq!(sink_id, "bad");
                assert_eq!(channel, "default");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_connect_sink_returns_sink() {
        let head = Passthrough::new("head");
        let sink: SharedModule = Arc::new(Passthrough::new("tail"));
        let returned = head.connect_sink(sink.clone(), "default", false);
        assert!(Arc::ptr_eq(&returned, &sink));
    }

    #[test]
    fn test_options_reject_unknown_key() {
        let module = Passthrough::new("p");
        let err = configure_module(&module, [("bogus", "1")]).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[test]
    fn test_plain_module_is_not_a_source() {
        let sink = CallbackSink::new("cb", |_, _| Ok(()));
        assert!(matches!(
            sink.start_processing(&ShutdownSignal::never()),
            Err(PipelineError::NotASource(_))
        ));
    }
}
