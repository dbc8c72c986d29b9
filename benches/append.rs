//! Append throughput over the in-memory backend.

use std::sync::Arc;

use cairn::agg::op::OpSet;
use cairn::manager::StreamWindowManager;
use cairn::pipeline::Pipeline;
use cairn::storage::{BackingStore, MemoryBackend};
use cairn::window::{GenericWindowing, WindowingSpec};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const POINTS: i64 = 10_000;

fn manager() -> Arc<StreamWindowManager> {
    Arc::new(StreamWindowManager::new(
        0,
        OpSet::from_names(&["count", "sum", "max"]).unwrap(),
        BackingStore::new(Arc::new(MemoryBackend::new()), false),
    ))
}

fn exp2_windowing() -> GenericWindowing {
    GenericWindowing::new(WindowingSpec::Exponential { base: 2.0 }.sequence())
}

fn bench_unbuffered(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_unbuffered");
    group.throughput(Throughput::Elements(POINTS as u64));
    group.bench_function("exp2", |b| {
        b.iter(|| {
            let pipeline = Pipeline::new(manager(), exp2_windowing(), None);
            for i in 0..POINTS {
                pipeline.append(i, i as f64).unwrap();
            }
        })
    });
    group.finish();
}

fn bench_buffered(c: &mut Criterion) {
    let mut group = c.benchmark_group("append_buffered");
    group.throughput(Throughput::Elements(POINTS as u64));
    for (buffer_size, windows_per_batch) in [(16i64, 4i64), (32, 8), (64, 8)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{buffer_size}/{windows_per_batch}")),
            &(buffer_size, windows_per_batch),
            |b, &(buffer_size, windows_per_batch)| {
                b.iter(|| {
                    let pipeline = Pipeline::new(manager(), exp2_windowing(), None);
                    pipeline.set_buffer_size(buffer_size).unwrap();
                    pipeline.set_num_buffers(8);
                    pipeline.set_windows_per_batch(windows_per_batch);
                    pipeline.run().unwrap();
                    for i in 0..POINTS {
                        pipeline.append(i, i as f64).unwrap();
                    }
                    pipeline.flush(true).unwrap();
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_unbuffered, bench_buffered);
criterion_main!(benches);
