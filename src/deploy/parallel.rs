//! Fork/join wrapping of `#parallel` modules.
//!
//! ```text
//! before:  A ──► M ──► C
//!
//! after:   A ──► __parexecutor_N ──► C
//!                   │  ▲
//!          template │  │ _join
//!                   ▼  │
//!                   M ──► __joiner_N
//! ```

use crate::pipeline::graph::{LinkDescriptor, ModuleDescriptor, PipelineGraph, DEFAULT_CHANNEL};
use crate::pipeline::nodes::{JOIN_CHANNEL, TEMPLATE_CHANNEL};
use crate::pipeline::PipelineResult;

/// Annotation that requests wrapping; a numeric value sets the thread count.
pub const PARALLEL_ANNOTATION: &str = "#parallel";

/// Marks modules synthesized by a rewrite pass.
pub const AUTOGENERATED_ANNOTATION: &str = "#autogenerated";

pub const EXECUTOR_PREFIX: &str = "__parexecutor_";
pub const JOINER_PREFIX: &str = "__joiner_";

/// Rewrites a graph so every `#parallel` module runs inside a fork/join executor.
#[derive(Debug, Default)]
pub struct ParallelRewriter {
    counter: usize,
}

impl ParallelRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a rewritten copy of `graph`; the input is left untouched.
    pub fn rewrite(&mut self, graph: &PipelineGraph) -> PipelineResult<PipelineGraph> {
        let mut output = graph.clone();
        let targets: Vec<(String, String)> = graph
            .modules()
            .iter()
            .filter_map(|m| {
                m.annotations
                    .get(PARALLEL_ANNOTATION)
                    .map(|value| (m.id.clone(), value.clone()))
            })
            .collect();

        for (id, value) in targets {
            self.wrap(&mut output, &id, &value)?;
        }
        Ok(output)
    }

    fn wrap(&mut self, graph: &mut PipelineGraph, id: &str, value: &str) -> PipelineResult<()> {
        let host = graph
            .module(id)
            .map(|m| m.host.clone())
            .unwrap_or_default();
        let (executor_id, joiner_id) = self.next_ids(graph);

        let mut executor = ModuleDescriptor::new(&executor_id, "ParExecutor")
            .on_host(&host)
            .with_annotation(AUTOGENERATED_ANNOTATION, "true");
        if let Ok(threads) = value.trim().parse::<i64>() {
            executor = executor.with_param("threads", threads.to_string());
        }
        let joiner = ModuleDescriptor::new(&joiner_id, "Joiner")
            .on_host(&host)
            .with_annotation(AUTOGENERATED_ANNOTATION, "true");
        graph.add_module(executor)?;
        graph.add_module(joiner)?;

        for link in graph.links.iter_mut() {
            if link.to == id {
                link.to = executor_id.clone();
            } else if link.from == id {
                link.from = executor_id.clone();
            }
        }
        graph.add_link(LinkDescriptor::new(&executor_id, id).on_channel(TEMPLATE_CHANNEL));
        graph.add_link(LinkDescriptor::new(id, &joiner_id).on_channel(DEFAULT_CHANNEL));
        graph.add_link(LinkDescriptor::new(&joiner_id, &executor_id).on_channel(JOIN_CHANNEL));

        if graph.effective_source() == Some(id) {
            graph.source = Some(executor_id.clone());
        }
        for module in graph.modules_mut() {
            if module.id == id {
                module.annotations.remove(PARALLEL_ANNOTATION);
            }
        }
        tracing::debug!(module = id, executor = %executor_id, joiner = %joiner_id, "wrapped parallel module");
        Ok(())
    }

    fn next_ids(&mut self, graph: &PipelineGraph) -> (String, String) {
        loop {
            let n = self.counter;
            self.counter += 1;
            let executor = format!("{}{}", EXECUTOR_PREFIX, n);
            let joiner = format!("{}{}", JOINER_PREFIX, n);
            if !graph.contains(&executor) && !graph.contains(&joiner) {
                return (executor, joiner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PipelineGraph {
        PipelineGraph::from_json_str(
            r##"{
                "source": "reader",
                "modules": {
                    "reader": {"type": "TextFileReader", "path": "in.txt"},
                    "count": {"type": "WordCounter", "#parallel": "4"},
                    "stats": {"type": "Stats"}
                },
                "links": [
                    {"from": "reader", "to": "count"},
                    {"from": "count", "to": "stats"}
                ]
            }"##,
        )
        .unwrap()
    }

    fn has_link(graph: &PipelineGraph, from: &str, to: &str, channel: &str) -> bool {
        graph
            .links
            .iter()
            .any(|l| l.from == from && l.to == to && l.channel == channel)
    }

    #[test]
    fn test_wraps_annotated_module() {
        let original = sample();
        let graph = ParallelRewriter::new().rewrite(&original).unwrap();
        graph.validate().unwrap();

        assert_eq!(graph.len(), 5);
        let executor = graph.module("__parexecutor_0").unwrap();
        assert_eq!(executor.module_type, "ParExecutor");
        assert_eq!(executor.named_params.get("threads").map(String::as_str), Some("4"));
        assert_eq!(
            executor.annotations.get(AUTOGENERATED_ANNOTATION).map(String::as_str),
            Some("true")
        );

        assert!(has_link(&graph, "reader", "__parexecutor_0", "default"));
        assert!(has_link(&graph, "__parexecutor_0", "stats", "default"));
        assert!(has_link(&graph, "__parexecutor_0", "count", "template"));
        assert!(has_link(&graph, "count", "__joiner_0", "default"));
        assert!(has_link(&graph, "__joiner_0", "__parexecutor_0", "_join"));
        assert!(!graph.links.iter().any(|l| l.from == "reader" && l.to == "count"));

        // input untouched
        assert_eq!(original.len(), 3);
        assert_eq!(original.links.len(), 2);
    }

    #[test]
    fn test_wrapped_source_moves_to_executor() {
        let graph = PipelineGraph::from_json_str(
            r##"{"modules": {"a": {"type": "Passthrough", "#parallel": "yes"}}}"##,
        )
        .unwrap();
        let graph = ParallelRewriter::new().rewrite(&graph).unwrap();
        assert_eq!(graph.source.as_deref(), Some("__parexecutor_0"));
        assert!(!graph
            .module("__parexecutor_0")
            .unwrap()
            .named_params
            .contains_key("threads"));
    }

    #[test]
    fn test_unannotated_graph_is_unchanged() {
        let graph = PipelineGraph::from_json_str(
            r#"{"modules": {"a": {"type": "Passthrough"}}, "links": []}"#,
        )
        .unwrap();
        assert_eq!(ParallelRewriter::new().rewrite(&graph).unwrap(), graph);
    }

    #[test]
    fn test_generated_ids_avoid_existing() {
        let graph = PipelineGraph::from_json_str(
            r##"{"modules": {
                "__parexecutor_0": {"type": "Passthrough"},
                "m": {"type": "Passthrough", "#parallel": "2"}
            }}"##,
        )
        .unwrap();
        let graph = ParallelRewriter::new().rewrite(&graph).unwrap();
        assert!(graph.contains("__parexecutor_1"));
        assert!(graph.contains("__joiner_1"));
    }
}
