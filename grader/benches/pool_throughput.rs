//! Benchmarks for orchestrator scheduling overhead using criterion.
//!
//! Measures end-to-end launch throughput over the mock runtime at
//! different pool sizes, isolating the engine's own cost from any real
//! substrate.

#![allow(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use grader::config::LaunchOptions;
use grader::orchestrator::Orchestrator;
use grader::runtime::RuntimeFactory;
use grader_testkit::{submission_fixtures, MockRuntimeFactory, MockScript};
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

const BATCH: usize = 8;

fn bench_launch_batch(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("launch_batch");
    group.sample_size(20);
    group.throughput(Throughput::Elements(BATCH as u64));

    for concurrency in [1usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async move {
                    let (dir, submissions) =
                        submission_fixtures(BATCH).expect("fixtures should stage");
                    let factory = MockRuntimeFactory::new();
                    factory.set_default_script({
                        let mut script = MockScript::passing();
                        script.run_for = Duration::from_millis(1);
                        script
                    });
                    let factory: Arc<dyn RuntimeFactory> = Arc::new(factory);

                    let orchestrator =
                        Orchestrator::new(factory, LaunchOptions::new(concurrency));
                    let reports = orchestrator.launch("grading:bench", submissions).await;
                    assert_eq!(reports.len(), BATCH);
                    drop(dir);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_launch_batch);
criterion_main!(benches);
