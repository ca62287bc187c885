//! Graph rewriting passes run before a pipeline is shipped.
//!
//! - [`ParallelRewriter`] wraps `#parallel` modules in a fork/join executor.
//! - [`DistributedPlanner`] splits a graph into per-host sub-graphs joined by
//!   network bridges.

pub mod distributed;
pub mod parallel;

pub use distributed::{pseudo_source_id, BridgeAllocation, DeploymentPlan, DistributedPlanner};
pub use parallel::ParallelRewriter;
