//! Benchmarks for packet dispatch and fork/join execution
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pipemesh::pipeline::nodes::{CallbackSink, ForkJoinExecutor, Joiner, Passthrough};
use pipemesh::pipeline::{configure_module, Module, Packet, SharedModule, DEFAULT_CHANNEL};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn sample_packet(size: usize) -> Packet {
    Packet::new(vec![0x5a; size])
        .with_property("line", 42)
        .with_property("origin", "bench")
}

/// `depth` pass-through stages ending in a counting sink
fn chain(depth: usize, counter: Arc<AtomicUsize>) -> Vec<SharedModule> {
    let sink: SharedModule = Arc::new(CallbackSink::new("sink", move |_, _| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }));
    let mut modules = vec![sink];
    for i in 0..depth {
        let stage: SharedModule = Arc::new(Passthrough::new(&format!("stage{}", i)));
        stage.connect_sink(modules[modules.len() - 1].clone(), DEFAULT_CHANNEL, false);
        modules.push(stage);
    }
    modules
}

fn bench_chain_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_dispatch");
    group.throughput(Throughput::Elements(1));

    for depth in [1usize, 4, 16] {
        let counter = Arc::new(AtomicUsize::new(0));
        let modules = chain(depth, counter);
        let head = modules[modules.len() - 1].clone();
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            let mut packet = sample_packet(64);
            b.iter(|| head.on_incoming_data(black_box(&mut packet), DEFAULT_CHANNEL))
        });
        for module in &modules {
            module.core().clear_sinks();
        }
    }
    group.finish();
}

fn bench_packet_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("packet_codec");

    for size in [64usize, 4096, 65_536] {
        let packet = sample_packet(size);
        let encoded = packet.encode().unwrap();
        group.throughput(Throughput::Bytes(encoded.len() as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &packet, |b, p| {
            b.iter(|| p.encode().unwrap())
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, e| {
            b.iter(|| Packet::decode(black_box(e)).unwrap())
        });
    }
    group.finish();
}

fn bench_fork_join(c: &mut Criterion) {
    const BATCH: usize = 1000;
    let mut group = c.benchmark_group("fork_join");
    group.throughput(Throughput::Elements(BATCH as u64));
    group.sample_size(20);

    for threads in [1usize, 2, 4] {
        let executor = Arc::new(ForkJoinExecutor::new("fork"));
        configure_module(executor.as_ref(), [("threads", threads.to_string().as_str())]).unwrap();
        let stage: SharedModule = Arc::new(Passthrough::new("stage"));
        let joiner: SharedModule = Arc::new(Joiner::new("join"));
        executor.connect_sink(stage.clone(), "template", false);
        stage.connect_sink(joiner.clone(), DEFAULT_CHANNEL, false);
        joiner.connect_sink(executor.clone(), "_join", false);
        executor.connect_sink(
            Arc::new(CallbackSink::new("out", |_, _| Ok(()))),
            DEFAULT_CHANNEL,
            false,
        );
        executor.initialize().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(threads), &threads, |b, _| {
            b.iter(|| {
                for i in 0..BATCH {
                    let mut packet = Packet::from_text(&i.to_string());
                    executor.on_incoming_data(&mut packet, DEFAULT_CHANNEL).unwrap();
                }
                executor.flush();
            })
        });

        executor.shutdown();
        for module in [&stage, &joiner] {
            module.core().clear_sinks();
        }
        executor.core().clear_sinks();
    }
    group.finish();
}

criterion_group!(benches, bench_chain_dispatch, bench_packet_codec, bench_fork_join);
criterion_main!(benches);
