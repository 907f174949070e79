use bundlestore::SegmentAllocator;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

/// Benchmark chain allocation over a large capacity
fn bench_allocate_chains(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_chains");

    group.bench_function("1k_chains_of_10", |b| {
        b.iter(|| {
            let alloc = SegmentAllocator::new(100_000);
            for _ in 0..1_000 {
                black_box(alloc.allocate_chain(10).unwrap());
            }
        });
    });

    group.bench_function("one_chain_of_10k", |b| {
        b.iter(|| {
            let alloc = SegmentAllocator::new(100_000);
            black_box(alloc.allocate_chain(10_000).unwrap());
        });
    });

    group.finish();
}

/// Benchmark allocation + free cycles (fragmentation churn)
fn bench_alloc_free_cycle(c: &mut Criterion) {
    c.bench_function("alloc_free_cycle", |b| {
        b.iter(|| {
            let alloc = SegmentAllocator::new(10_000);
            let mut chains = Vec::new();

            for _ in 0..100 {
                chains.push(alloc.allocate_chain(10).unwrap());
            }

            // Free every other chain, then refill the holes.
            for (i, chain) in chains.iter().enumerate() {
                if i % 2 == 0 {
                    alloc.free_chain(chain).unwrap();
                }
            }
            for _ in 0..50 {
                alloc.allocate_chain(10).unwrap();
            }

            black_box(&alloc);
        });
    });
}

/// Benchmark snapshot capture at scale
fn bench_snapshot(c: &mut Criterion) {
    let alloc = SegmentAllocator::new(1_000_000);
    alloc.allocate_chain(250_000).unwrap();

    c.bench_function("snapshot_1m_segments", |b| {
        b.iter(|| black_box(alloc.snapshot()));
    });
}

criterion_group!(
    benches,
    bench_allocate_chains,
    bench_alloc_free_cycle,
    bench_snapshot
);
criterion_main!(benches);
