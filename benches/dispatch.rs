//! Throughput of queueing plus chunked dispatch to in-memory destinations.

use std::sync::Arc;

use criterion::{BatchSize, BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use femtowire::{
    BoundPackage, Destination, DestinationGroup, DispatchConfig, DispatchMode, DispatchPipeline,
    GroupId, Level, LogPackage, MessageSink, SinkError,
};

/// Sink that only counts what it is given, so the benchmark measures the
/// pipeline rather than delivery.
struct CountingSink;

impl MessageSink for CountingSink {
    fn send(&self, _destination: &Destination, packages: &[BoundPackage]) -> Result<(), SinkError> {
        criterion::black_box(packages.len());
        Ok(())
    }
}

fn packages(count: usize) -> Vec<BoundPackage> {
    (0..count)
        .map(|i| {
            BoundPackage::new(
                LogPackage::new("bench", Level::Info, "payload"),
                GroupId((i % 4) as u32),
            )
        })
        .collect()
}

fn pipeline(destinations: usize) -> DispatchPipeline {
    let group = Arc::new(DestinationGroup::with_destinations((0..destinations).map(
        |i| {
            Arc::new(
                Destination::builder(format!("dest-{i}"))
                    .with_sink(Arc::new(CountingSink))
                    .with_group(GroupId((i % 4) as u32))
                    .build(),
            )
        },
    )));
    DispatchPipeline::start(
        group,
        DispatchConfig::default().with_mode(DispatchMode::Debug),
    )
    .expect("start pipeline")
}

fn bench_send_and_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("send_and_flush");
    for &count in &[1_000usize, 100_000] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let pipeline = pipeline(8);
            b.iter_batched(
                || packages(count),
                |batch| {
                    pipeline.send_many(batch).expect("send");
                    pipeline.flush();
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_send_and_flush);
criterion_main!(benches);
