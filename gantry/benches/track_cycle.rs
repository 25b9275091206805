//! Benchmarks for the coordinator's submit and track paths using criterion.
//!
//! Everything runs against the in-memory gateway and scripted plugins, so the
//! numbers measure coordinator overhead: partitioning, validation, cache
//! reconciliation and completion bookkeeping.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use gantry::*;
use gantry_testkit::{InMemoryGateway, ScriptedPlugin, TrackBehavior, external_jobs};

const PLUGINS: [&str; 2] = ["CondorPlugin", "gLitePlugin"];

async fn coordinator(track: TrackBehavior) -> Coordinator<InMemoryGateway> {
    let mut builder = CoordinatorBuilder::new(CoordinatorConfig::default())
        .with_gateway(Arc::new(InMemoryGateway::new()));
    for name in PLUGINS {
        let plugin = ScriptedPlugin::new(["Idle", "Running"]).with_track(track.clone());
        builder = builder.with_plugin(name, Arc::new(plugin));
    }
    builder.build().await.expect("build coordinator")
}

fn batch(count: usize) -> Vec<ExternalJob> {
    let half = count / 2;
    let mut jobs = external_jobs(1, half, PLUGINS[0], "bench");
    jobs.extend(external_jobs(half as i64 + 1, count - half, PLUGINS[1], "bench"));
    jobs
}

fn running() -> TrackBehavior {
    TrackBehavior::Transition {
        status: "Running".into(),
        global_state: None,
    }
}

/// Benchmark: submit a batch split across two plugins.
fn bench_submit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("submit");
    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let mut total = Duration::ZERO;
                for _ in 0..iters {
                    let coordinator = coordinator(TrackBehavior::Unchanged).await;
                    let jobs = batch(count);

                    let start = Instant::now();
                    let report = coordinator.submit(&jobs, None).await.expect("submit");
                    total += start.elapsed();
                    assert_eq!(report.accepted.len(), count);
                }
                total
            });
        });
    }
    group.finish();
}

/// Benchmark: one tracking pass, with a warm and a cold working set.
fn bench_track(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("track");
    for count in [100usize, 1_000] {
        group.throughput(Throughput::Elements(count as u64));
        for cold in [false, true] {
            let id = BenchmarkId::new(if cold { "cold_cache" } else { "warm_cache" }, count);
            group.bench_with_input(id, &count, |b, &count| {
                b.to_async(&rt).iter_custom(|iters| async move {
                    let mut total = Duration::ZERO;
                    for _ in 0..iters {
                        let coordinator = coordinator(running()).await;
                        coordinator.submit(&batch(count), None).await.expect("submit");
                        if cold {
                            coordinator.cache().clear().await;
                        }

                        let start = Instant::now();
                        let changed = coordinator.track().await.expect("track");
                        total += start.elapsed();
                        assert_eq!(changed.len(), count);
                    }
                    total
                });
            });
        }
    }
    group.finish();
}

/// Benchmark: a pass where every job finishes, so completion dominates.
fn bench_finish(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");

    let mut group = c.benchmark_group("finish");
    group.sample_size(20);
    let count = 1_000usize;
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("complete_all", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
                let coordinator = coordinator(TrackBehavior::Finish).await;
                let jobs = batch(count);
                coordinator.submit(&jobs, None).await.expect("submit");

                let start = Instant::now();
                coordinator.track().await.expect("track");
                let removed = coordinator.remove_complete(&jobs).await.expect("remove");
                total += start.elapsed();
                assert_eq!(removed, count as u64);
            }
            total
        });
    });
    group.finish();
}

criterion_group!(benches, bench_submit, bench_track, bench_finish);
criterion_main!(benches);
