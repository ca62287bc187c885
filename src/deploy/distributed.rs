//! Host partitioning of a pipeline graph.
//!
//! Every module is placed on its own host's sub-graph. A link between two
//! hosts is cut and bridged:
//!
//! ```text
//! host A:  from ──► __net_sink_N  (sinkaddress = B:port)
//!                         ┆ tcp
//! host B:  __net_source_N (sourceaddress = *:port) ──► to
//! ```
//!
//! Each host also gets a `ParProcessor` pseudo-source that starts the real
//! global source (on its host) and every bridge source (on the receiving
//! host). Ports start at the planner's base port and grow by one per
//! cross-host link.

use crate::pipeline::graph::{LinkDescriptor, ModuleDescriptor, PipelineGraph};
use crate::pipeline::{PipelineError, PipelineResult};
use std::collections::{BTreeMap, BTreeSet, HashMap};

pub const PSEUDO_SOURCE_PREFIX: &str = "__parallel_source_";
pub const NET_SINK_PREFIX: &str = "__net_sink_";
pub const NET_SOURCE_PREFIX: &str = "__net_source_";
pub const BANDWIDTH_ANNOTATION: &str = "#bandwidth";

/// Id of the pseudo-source synthesized for `host`.
pub fn pseudo_source_id(host: &str) -> String {
    format!("{}{}", PSEUDO_SOURCE_PREFIX, host.replace('.', "_"))
}

/// One cross-host link and the bridge pair carrying it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeAllocation {
    pub from_host: String,
    pub to_host: String,
    pub sink_id: String,
    pub source_id: String,
    pub port: u16,
    pub channel: String,
}

/// Per-host sub-graphs produced by [`DistributedPlanner::plan`].
#[derive(Debug, Clone, Default)]
pub struct DeploymentPlan {
    hosts: BTreeMap<String, PipelineGraph>,
    bridges: Vec<BridgeAllocation>,
}

impl DeploymentPlan {
    /// Every host with at least one module.
    pub fn hosts(&self) -> BTreeSet<String> {
        self.hosts.keys().cloned().collect()
    }

    /// The sub-graph for `host`, whose source is the host's pseudo-source.
    pub fn get_config(&self, host: &str) -> Option<&PipelineGraph> {
        self.hosts.get(host)
    }

    /// Module types needed on `host`.
    pub fn modules(&self, host: &str) -> BTreeSet<String> {
        self.hosts
            .get(host)
            .map(|graph| {
                graph
                    .modules()
                    .iter()
                    .map(|m| m.module_type.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bridges(&self) -> &[BridgeAllocation] {
        &self.bridges
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PipelineGraph)> {
        self.hosts.iter()
    }
}

/// Splits a graph into one sub-graph per host.
#[derive(Debug, Clone)]
pub struct DistributedPlanner {
    base_port: u16,
    counter: usize,
}

impl DistributedPlanner {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            counter: 0,
        }
    }

    pub fn plan(&mut self, graph: &PipelineGraph) -> PipelineResult<DeploymentPlan> {
        let mut buckets: BTreeMap<String, (Vec<ModuleDescriptor>, Vec<LinkDescriptor>)> =
            BTreeMap::new();
        let mut host_of: HashMap<String, String> = HashMap::new();
        for module in graph.modules() {
            host_of.insert(module.id.clone(), module.host.clone());
            buckets
                .entry(module.host.clone())
                .or_default()
                .0
                .push(module.clone());
        }

        let source = graph
            .effective_source()
            .ok_or_else(|| PipelineError::config("cannot plan an empty pipeline"))?;
        let source_host = host_of.get(source).cloned().ok_or_else(|| {
            PipelineError::config(format!("source module '{}' is not defined", source))
        })?;
        buckets
            .entry(source_host.clone())
            .or_default()
            .1
            .push(LinkDescriptor::new(pseudo_source_id(&source_host), source));

        let mut next_port = Some(self.base_port);
        let mut bridges = Vec::new();
        for link in &graph.links {
            let from_host = host_of.get(&link.from).cloned().ok_or_else(|| {
                PipelineError::config(format!(
                    "invalid link definition: invalid or no source specified: '{}', to '{}', channel '{}'",
                    link.from, link.to, link.channel
                ))
            })?;
            let to_host = host_of.get(&link.to).cloned().ok_or_else(|| {
                PipelineError::config(format!(
                    "invalid link definition: invalid or no destination specified: '{}', from '{}', channel '{}'",
                    link.to, link.from, link.channel
                ))
            })?;
            if link.channel.is_empty() {
                return Err(PipelineError::config(
                    "invalid link definition: channel cannot be empty",
                ));
            }

            if from_host == to_host {
                buckets.entry(from_host).or_default().1.push(link.clone());
                continue;
            }

            let port = next_port.ok_or_else(|| {
                PipelineError::config(format!(
                    "ran out of bridge ports starting at {}",
                    self.base_port
                ))
            })?;
            next_port = port.checked_add(1);
            let n = self.counter;
            self.counter += 1;
            let sink_id = format!("{}{}", NET_SINK_PREFIX, n);
            let source_id = format!("{}{}", NET_SOURCE_PREFIX, n);
            let bandwidth = link.bandwidth.clone().unwrap_or_default();

            let sink = ModuleDescriptor::new(&sink_id, "NetworkSink")
                .on_host(&from_host)
                .with_param("sinkaddress", format!("{}:{}", to_host, port))
                .with_annotation(BANDWIDTH_ANNOTATION, &bandwidth);
            let bridge_source = ModuleDescriptor::new(&source_id, "NetworkSource")
                .on_host(&to_host)
                .with_param("sourceaddress", format!("*:{}", port))
                .with_annotation(BANDWIDTH_ANNOTATION, &bandwidth);

            let mut outbound = link.clone();
            outbound.to = sink_id.clone();
            let mut inbound = link.clone();
            inbound.from = source_id.clone();

            let from_bucket = buckets.entry(from_host.clone()).or_default();
            from_bucket.0.push(sink);
            from_bucket.1.push(outbound);
            let to_bucket = buckets.entry(to_host.clone()).or_default();
            to_bucket.0.push(bridge_source);
            to_bucket.1.push(inbound);
            to_bucket
                .1
                .push(LinkDescriptor::new(pseudo_source_id(&to_host), &source_id));

            tracing::debug!(
                from = %link.from,
                to = %link.to,
                %from_host,
                %to_host,
                port,
                "bridged cross-host link"
            );
            bridges.push(BridgeAllocation {
                from_host,
                to_host,
                sink_id,
                source_id,
                port,
                channel: link.channel.clone(),
            });
        }

        let mut hosts = BTreeMap::new();
        for (host, (modules, links)) in buckets {
            let pseudo = pseudo_source_id(&host);
            let mut sub = PipelineGraph::new();
            sub.add_module(ModuleDescriptor::new(&pseudo, "ParProcessor").on_host(&host))?;
            for module in modules {
                sub.add_module(module)?;
            }
            sub.links = links;
            sub.source = Some(pseudo);
            hosts.insert(host, sub);
        }
        tracing::info!(
            hosts = hosts.len(),
            bridges = bridges.len(),
            "planned distributed deployment"
        );
        Ok(DeploymentPlan { hosts, bridges })
    }
}

impl Default for DistributedPlanner {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BASE_PORT)
    }
}
