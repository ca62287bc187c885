//! Module-graph dataflow runtime.
//!
//! Packets flow from a single source module through a directed graph of
//! modules connected by named channels. Every module is shared behind an
//! `Arc` and dispatches synchronously to its sinks on the caller's thread;
//! concurrency only appears where a module introduces it (fork/join
//! executor, buffers, network bridges).
//!
//! # Architecture
//!
//! ```text
//! PipelineGraph ──► Loader ──► [source] ──► [module] ──► [module]
//!                     │                        └──────► [module]
//!                     └── ModuleRegistry (type name -> factory)
//! ```
//!
//! # Design
//!
//! - **Interior mutability**: modules are `Arc<dyn Module>` with `&self` methods.
//! - **Snapshot dispatch**: sink lists are copied before dispatch, so no lock
//!   is held while a downstream module runs.
//! - **Cooperative shutdown**: worker threads watch a [`ShutdownSignal`] and
//!   are joined by [`WorkerGroup::shutdown`].

pub mod error;
pub mod graph;
pub mod loader;
pub mod module;
pub mod nodes;
pub mod packet;
pub mod queue;
pub mod registry;
pub mod shutdown;

pub use error::{PipelineError, PipelineResult};
pub use graph::{
    extract_hosts, FlagBag, LinkDescriptor, ModuleDescriptor, PipelineGraph, DEFAULT_CHANNEL,
    DEFAULT_HOST,
};
pub use loader::Loader;
pub use module::{configure_module, Module, ModuleCore, SharedModule, SinkLink};
pub use packet::{Packet, PropertySet};
pub use queue::WorkQueue;
pub use registry::{BuiltinFactory, ModuleFactory, ModuleRegistry};
pub use shutdown::{ShutdownSignal, ShutdownTrigger, WorkerGroup};
