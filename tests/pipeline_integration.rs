//! Integration tests for building and running pipelines
//!
//! These tests validate the in-process runtime end to end:
//! - Graph wiring and channel fan-out through the loader
//! - Source-driven runs with flush and finalize
//! - Fork/join execution, hand-wired and via `#parallel` rewriting
//! - The cloning boundary at `_`-prefixed back-edges

mod common;

use common::builders::{recording_registry, texts, GraphBuilder};
use pipemesh::deploy::ParallelRewriter;
use pipemesh::pipeline::{
    Loader, Module, ModuleDescriptor, Packet, PipelineError, PipelineGraph, SharedModule,
    DEFAULT_CHANNEL,
};
use std::sync::Arc;
use std::collections::BTreeSet;

fn numbered_lines(n: usize) -> String {
    (0..n).map(|i| format!("line {}\n", i)).collect()
}

#[test]
fn test_fan_out_reaches_sinks_in_link_order() {
    let (registry, log) = recording_registry();
    let graph = GraphBuilder::new()
        .module("entry", "Passthrough")
        .module("first", "Recorder")
        .module("second", "Recorder")
        .link("entry", "first")
        .link("entry", "second")
        .link_on("entry", "first", "side")
        .build();

    let loader = Loader::from_graph(registry, &graph).unwrap();
    let entry = loader.module("entry").unwrap();
    entry
        .on_incoming_data(&mut Packet::from_text("a"), DEFAULT_CHANNEL)
        .unwrap();
    entry
        .on_incoming_data(&mut Packet::from_text("b"), "side")
        .unwrap();

    let seen: Vec<(String, String)> = log
        .lock()
        .unwrap()
        .iter()
        .map(|(channel, p)| (channel.clone(), p.text().into_owned()))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("default".to_string(), "a".to_string()),
            ("default".to_string(), "a".to_string()),
            ("side".to_string(), "b".to_string()),
        ]
    );
}

#[test]
fn test_force_channel_redirects() {
    let (registry, log) = recording_registry();
    let graph = GraphBuilder::new()
        .with(ModuleDescriptor::new("force", "ForceChannel").with_param("channel", "alt"))
        .module("on_default", "Recorder")
        .module("on_alt", "Recorder")
        .link("force", "on_default")
        .link_on("force", "on_alt", "alt")
        .build();

    let loader = Loader::from_graph(registry, &graph).unwrap();
    loader
        .module("force")
        .unwrap()
        .on_incoming_data(&mut Packet::from_text("x"), DEFAULT_CHANNEL)
        .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].0, "alt");
}

#[test]
fn test_reader_to_counter_run() {
    let input = common::text_file("one two\nthree\n\nfour five six\n");
    let (registry, log) = recording_registry();
    let graph = GraphBuilder::new()
        .with(
            ModuleDescriptor::new("reader", "TextFileReader")
                .with_param("path", input.path().to_string_lossy()),
        )
        .module("count", "WordCounter")
        .module("out", "Recorder")
        .link("reader", "count")
        .link("count", "out")
        .build();

    Loader::run_to_completion(registry, &graph).unwrap();

    let log = log.lock().unwrap();
    let words: Vec<u64> = log
        .iter()
        .map(|(_, p)| p.property("words").and_then(|v| v.as_u64()).unwrap())
        .collect();
    assert_eq!(words, vec![2, 1, 0, 3]);
    let lines: Vec<u64> = log
        .iter()
        .map(|(_, p)| p.property("line").and_then(|v| v.as_u64()).unwrap())
        .collect();
    assert_eq!(lines, vec![1, 2, 3, 4]);
}

#[test]
fn test_unreadable_input_fails_before_running() {
    let (registry, _log) = recording_registry();
    let graph = GraphBuilder::new()
        .with(ModuleDescriptor::new("reader", "TextFileReader").with_param("path", "/nonexistent/in.txt"))
        .build();
    let err = Loader::run_to_completion(registry, &graph).unwrap_err();
    assert!(matches!(err.root_cause(), PipelineError::Initialization { .. }));
}

#[test]
fn test_hand_wired_fork_join_preserves_packet_set() {
    let input = common::text_file(&numbered_lines(300));
    let (registry, log) = recording_registry();
    let graph = GraphBuilder::new()
        .with(
            ModuleDescriptor::new("reader", "TextFileReader")
                .with_param("path", input.path().to_string_lossy()),
        )
        .with(ModuleDescriptor::new("exec", "ParExecutor").with_param("threads", "4"))
        .module("stage", "WordCounter")
        .module("join", "Joiner")
        .module("out", "Recorder")
        .link("reader", "exec")
        .link_on("exec", "stage", "template")
        .link("stage", "join")
        .link_on("join", "exec", "_join")
        .link("exec", "out")
        .source("reader")
        .build();

    Loader::run_to_completion(registry, &graph).unwrap();

    let got: BTreeSet<String> = texts(&log).into_iter().collect();
    let expected: BTreeSet<String> = (0..300).map(|i| format!("line {}", i)).collect();
    assert_eq!(got, expected);
    assert_eq!(log.lock().unwrap().len(), 300);
}

#[test]
fn test_parallel_annotation_runs_through_executor() {
    let input = common::text_file(&numbered_lines(120));
    let description = format!(
        r##"{{
            "source": "reader",
            "modules": {{
                "reader": {{"type": "TextFileReader", "path": {path}}},
                "count": {{"type": "WordCounter", "#parallel": "3"}},
                "out": {{"type": "Recorder"}}
            }},
            "links": [
                {{"from": "reader", "to": "count"}},
                {{"from": "count", "to": "out"}}
            ]
        }}"##,
        path = serde_json::to_string(&input.path().to_string_lossy()).unwrap()
    );
    let graph = PipelineGraph::from_json_str(&description).unwrap();
    let rewritten = ParallelRewriter::new().rewrite(&graph).unwrap();
    assert!(rewritten.contains("__parexecutor_0"));
    assert!(rewritten.contains("__joiner_0"));

    let (registry, log) = recording_registry();
    Loader::run_to_completion(registry, &rewritten).unwrap();

    let got: BTreeSet<String> = texts(&log).into_iter().collect();
    assert_eq!(got.len(), 120);
    assert!(log
        .lock()
        .unwrap()
        .iter()
        .all(|(_, p)| p.property("words").and_then(|v| v.as_u64()) == Some(2)));
}

#[test]
fn test_parallel_source_module_becomes_executor_source() {
    let graph = GraphBuilder::new()
        .with(ModuleDescriptor::new("first", "Passthrough").with_annotation("#parallel", "2"))
        .module("next", "Recorder")
        .link("first", "next")
        .build();
    let rewritten = ParallelRewriter::new().rewrite(&graph).unwrap();
    assert_eq!(rewritten.source.as_deref(), Some("__parexecutor_0"));
    assert!(graph.source.is_none());
}

#[test]
fn test_description_errors() {
    let (registry, _log) = recording_registry();
    let unknown_type = GraphBuilder::new().module("x", "NoSuchModule").build();
    assert!(Loader::from_graph(registry.clone(), &unknown_type).is_err());

    let dangling = GraphBuilder::new()
        .module("x", "Passthrough")
        .link("x", "missing")
        .build();
    assert!(dangling.validate().is_err());
    assert!(Loader::from_graph(registry.clone(), &dangling).is_err());

    let bad_option = GraphBuilder::new()
        .with(ModuleDescriptor::new("x", "Passthrough").with_param("bogus", "1"))
        .build();
    assert!(Loader::from_graph(registry, &bad_option).is_err());
}

fn same_instance(a: &SharedModule, b: &SharedModule) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[test]
fn test_clone_shares_join_back_edge_only() {
    let (registry, log) = recording_registry();
    let graph = GraphBuilder::new()
        .module("head", "Passthrough")
        .module("count", "WordCounter")
        .module("join", "Recorder")
        .module("tail", "Recorder")
        .link("head", "count")
        .link_on("count", "join", "_join")
        .link("count", "tail")
        .build();
    let loader = Loader::from_graph(registry, &graph).unwrap();
    let count = loader.module("count").unwrap();

    let copy = loader.module("head").unwrap().clone_module().unwrap();
    let copied_count = copy.core().sinks(DEFAULT_CHANNEL)[0].module.clone();
    assert!(!same_instance(&copied_count, &count));
    assert!(same_instance(
        &copied_count.core().sinks("_join")[0].module,
        &loader.module("join").unwrap()
    ));
    assert!(!same_instance(
        &copied_count.core().sinks(DEFAULT_CHANNEL)[0].module,
        &loader.module("tail").unwrap()
    ));

    copy.on_incoming_data(&mut Packet::from_text("a b c"), DEFAULT_CHANNEL)
        .unwrap();
    assert_eq!(copied_count.on_read_property("total"), "3");
    assert_eq!(count.on_read_property("total"), "0");
    assert_eq!(texts(&log), vec!["a b c"]);
    copy.core().clear_sinks();
    copied_count.core().clear_sinks();
}
