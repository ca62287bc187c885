//! Built-in modules.
//!
//! | Type | Role |
//! |------|------|
//! | `Passthrough` | forwards unchanged |
//! | `ForceChannel` | re-emits on a fixed channel |
//! | `ParExecutor` | fork/join worker pool around a `template` subgraph |
//! | `Joiner` | closes a fork/join template via `_join` |
//! | `ParProcessor` | per-host pseudo-source |
//! | `Buffer` | queue + collector thread |
//! | `Blocker` | holds packets for a fixed time |
//! | `LoadBalancer` | spreads packets over numbered channels |
//! | `Stats` | throughput reporting |
//! | `TextFileReader` | line-per-packet file source |
//! | `WordCounter` | word totals, reported on finalize |
//! | `NetworkSink` / `NetworkSource` | cross-host bridge pair |
//!
//! `CallbackSink` is for embedding and is not registered.

pub mod blocker;
pub mod buffer;
pub mod fork_join;
pub mod load_balancer;
pub mod network;
pub mod parallel_source;
pub mod passthrough;
pub mod stats;
pub mod text;

pub use blocker::Blocker;
pub use buffer::Buffer;
pub use fork_join::{ExecutorState, ForkJoinExecutor, Joiner, JOIN_CHANNEL, TEMPLATE_CHANNEL};
pub use load_balancer::LoadBalancer;
pub use network::{NetworkSink, NetworkSource, CHANNEL_PROPERTY};
pub use parallel_source::ParallelSource;
pub use passthrough::{CallbackSink, ForceChannel, Passthrough};
pub use stats::Stats;
pub use text::{TextFileReader, WordCounter};

use crate::pipeline::registry::{BuiltinFactory, ModuleRegistry};
use std::sync::Arc;

/// Register every built-in module type.
pub fn register_builtins(registry: &mut ModuleRegistry) {
    let factories = [
        BuiltinFactory::new("Passthrough", "Forward packets unchanged", |id| {
            Arc::new(Passthrough::new(id))
        }),
        BuiltinFactory::new("ForceChannel", "Re-emit packets on a fixed channel", |id| {
            Arc::new(ForceChannel::new(id))
        }),
        BuiltinFactory::new(
            "ParExecutor",
            "Run the template subgraph on a pool of worker threads",
            |id| Arc::new(ForkJoinExecutor::new(id)),
        ),
        BuiltinFactory::new("Joiner", "Return template output to its executor", |id| {
            Arc::new(Joiner::new(id))
        }),
        BuiltinFactory::new("ParProcessor", "Start every downstream source", |id| {
            Arc::new(ParallelSource::new(id))
        })
        .source(),
        BuiltinFactory::new("Buffer", "Queue packets for a collector thread", |id| {
            Arc::new(Buffer::new(id))
        }),
        BuiltinFactory::new("Blocker", "Hold each packet for a fixed time", |id| {
            Arc::new(Blocker::new(id))
        }),
        BuiltinFactory::new(
            "LoadBalancer",
            "Spread packets over numbered channels",
            |id| Arc::new(LoadBalancer::new(id)),
        ),
        BuiltinFactory::new("Stats", "Write processing stats", |id| {
            Arc::new(Stats::new(id))
        }),
        BuiltinFactory::new("TextFileReader", "Emit one packet per line of a file", |id| {
            Arc::new(TextFileReader::new(id))
        })
        .source(),
        BuiltinFactory::new("WordCounter", "Count words and report the total", |id| {
            Arc::new(WordCounter::new(id))
        }),
        BuiltinFactory::new("NetworkSink", "Send packets to a remote bridge", |id| {
            Arc::new(NetworkSink::new(id))
        }),
        BuiltinFactory::new(
            "NetworkSource",
            "Receive packets from a remote bridge",
            |id| Arc::new(NetworkSource::new(id)),
        )
        .source(),
    ];
    for factory in factories {
        registry.register(Arc::new(factory));
    }
}
