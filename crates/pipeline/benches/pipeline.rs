//! Pipeline benchmark suite
//!
//! Throughput of the event loop under the size trigger, for both dispatch
//! modes and both batch shapes.
//!
//! Run with: `cargo bench -p batchpipe`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use batchpipe::{
    CancellationToken, DeduplicationPipeline, Keyed, PipelineConfig, StandardPipeline,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

#[derive(Clone)]
struct Sample {
    id: usize,
}

impl Keyed for Sample {
    fn key(&self) -> String {
        format!("sample-{}", self.id % 64)
    }
}

fn bench_config() -> PipelineConfig {
    PipelineConfig::new()
        .with_buffer_size(1024)
        .with_flush_size(64)
        .with_flush_interval(Duration::from_secs(10))
}

/// Push `count` items through a serial-dispatch pipeline and wait for shutdown
fn bench_sync_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("sync_perform");
    for count in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                let flushed = Arc::new(AtomicUsize::new(0));
                let sink = Arc::clone(&flushed);
                let pipeline = StandardPipeline::new(bench_config(), move |_cancel, batch: Vec<usize>| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.fetch_add(batch.len(), Ordering::Relaxed);
                        Ok(())
                    }
                });

                let runner = tokio::spawn({
                    let pipeline = pipeline.clone();
                    async move { pipeline.sync_perform(CancellationToken::new()).await }
                });

                for i in 0..count {
                    pipeline.send(i).await.unwrap();
                }
                pipeline.close();
                runner.await.unwrap().unwrap();

                black_box(flushed.load(Ordering::Relaxed))
            });
        });
    }
    group.finish();
}

/// Same load with concurrent dispatch and a bounded flush pool
fn bench_async_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("async_perform");
    for max_concurrent in [0u32, 2, 8] {
        group.throughput(Throughput::Elements(10_000));
        group.bench_with_input(
            BenchmarkId::new("max_flushes", max_concurrent),
            &max_concurrent,
            |b, &max_concurrent| {
                b.to_async(&rt).iter(|| async move {
                    let flushed = Arc::new(AtomicUsize::new(0));
                    let sink = Arc::clone(&flushed);
                    let config = bench_config().with_max_concurrent_flushes(max_concurrent);
                    let pipeline =
                        StandardPipeline::new(config, move |_cancel, batch: Vec<usize>| {
                            let sink = Arc::clone(&sink);
                            async move {
                                sink.fetch_add(batch.len(), Ordering::Relaxed);
                                Ok(())
                            }
                        });

                    let runner = tokio::spawn({
                        let pipeline = pipeline.clone();
                        async move { pipeline.async_perform(CancellationToken::new()).await }
                    });

                    for i in 0..10_000usize {
                        pipeline.send(i).await.unwrap();
                    }
                    pipeline.close();
                    runner.await.unwrap().unwrap();

                    black_box(flushed.load(Ordering::Relaxed))
                });
            },
        );
    }
    group.finish();
}

/// Keyed batches exercise the map insert path and key hashing
fn bench_dedup_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let mut group = c.benchmark_group("dedup_perform");
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("10000_items_64_keys", |b| {
        b.to_async(&rt).iter(|| async {
            let flushed = Arc::new(AtomicUsize::new(0));
            let sink = Arc::clone(&flushed);
            let pipeline = DeduplicationPipeline::new(
                bench_config(),
                move |_cancel, batch: std::collections::HashMap<String, Sample>| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.fetch_add(batch.len(), Ordering::Relaxed);
                        Ok(())
                    }
                },
            );

            let runner = tokio::spawn({
                let pipeline = pipeline.clone();
                async move { pipeline.sync_perform(CancellationToken::new()).await }
            });

            for i in 0..10_000usize {
                pipeline.send(Sample { id: i }).await.unwrap();
            }
            pipeline.close();
            runner.await.unwrap().unwrap();

            black_box(flushed.load(Ordering::Relaxed))
        });
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_sync_throughput,
    bench_async_throughput,
    bench_dedup_throughput
);
criterion_main!(benches);
