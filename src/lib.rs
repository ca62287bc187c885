//! # pipemesh: pluggable dataflow pipelines
//!
//! Processing modules are wired into a directed graph and exchange packets
//! over named channels. A graph can run in-process, or be split across
//! hosts with network bridges inserted at every host boundary and deployed
//! through a per-host job daemon.
//!
//! ## Architecture
//!
//! - **Pipeline**: graph model, module contract, fork/join executor and the loader
//! - **Deploy**: `#parallel` rewriting and host partitioning
//! - **Jobs**: the job daemon, its wire protocol and the multi-host orchestrator
//! - **Config**: TOML settings for the daemon and the orchestrator
//!
//! ## Example
//!
//! ```ignore
//! use pipemesh::pipeline::{Loader, ModuleRegistry, PipelineGraph};
//! use std::sync::Arc;
//!
//! let graph = PipelineGraph::from_file("words.json")?;
//! let registry = Arc::new(ModuleRegistry::with_builtins());
//! Loader::run_to_completion(registry, &graph)?;
//! ```

pub mod config;
pub mod deploy;
pub mod error;
pub mod jobs;
pub mod pipeline;

// Re-export commonly used types
pub use config::Settings;
pub use deploy::{DeploymentPlan, DistributedPlanner, ParallelRewriter};
pub use error::{PipemeshError, Result, ResultExt};
pub use jobs::{JobDaemon, Orchestrator, TcpTransport};
pub use pipeline::{Loader, Module, ModuleRegistry, Packet, PipelineError, PipelineGraph};
