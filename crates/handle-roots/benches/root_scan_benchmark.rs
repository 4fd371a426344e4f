//! Benchmark: root scanning pauses.
//!
//! Measures a strong pass over global and local handles with one and several
//! workers, and a concurrent weak-global scan.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use handle_roots::{
    ConcurrentWeakRootIterator, HandleTable, ObjectRef, RootSet, RootSlot, StrongRootIterator,
    ThreadRegistry,
};
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

const THREADS: usize = 16;
const LOCALS_PER_THREAD: usize = 256;
const GLOBALS: usize = 50_000;

fn obj(n: usize) -> Option<ObjectRef> {
    ObjectRef::new((n + 1) * 16)
}

fn populated_roots() -> RootSet {
    let registry = Arc::new(ThreadRegistry::new(Arc::new(HandleTable::default())));
    for _ in 0..THREADS {
        let thread = registry.attach();
        for n in 0..LOCALS_PER_THREAD {
            thread.make_local(obj(n));
        }
    }
    for n in 0..GLOBALS {
        registry.handles().make_global(obj(n));
        registry.handles().make_weak_global(obj(n));
    }
    RootSet::new(registry)
}

fn scan_strong(roots: &RootSet, workers: usize) -> usize {
    let registry = roots.registry();
    let safepoint = registry.begin_safepoint();
    let iter = StrongRootIterator::new(roots, &safepoint);
    std::thread::scope(|s| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                s.spawn(|| {
                    let mut visited = 0;
                    iter.oops_do(&mut |slot: &RootSlot| visited += slot.address() & 1, false);
                    visited
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap_or(0)).sum()
    })
}

fn bench_strong_pass(c: &mut Criterion) {
    let roots = populated_roots();

    let mut group = c.benchmark_group("strong_pass");
    for workers in [1, 4] {
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &w| {
            b.iter(|| black_box(scan_strong(&roots, w)));
        });
    }
    group.finish();
}

fn bench_concurrent_weak(c: &mut Criterion) {
    let roots = populated_roots();

    c.bench_function("concurrent_weak_4_workers", |b| {
        b.iter(|| {
            let iter = ConcurrentWeakRootIterator::new(&roots);
            std::thread::scope(|s| {
                for _ in 0..4 {
                    s.spawn(|| {
                        iter.oops_do(&mut |slot: &RootSlot| {
                            black_box(slot.load());
                        });
                    });
                }
            });
        });
    });
}

criterion_group!(
    name = root_scan;
    config = Criterion::default()
        .sample_size(30)
        .warm_up_time(Duration::from_millis(200))
        .measurement_time(Duration::from_secs(3));
    targets = bench_strong_pass, bench_concurrent_weak
);

criterion_main!(root_scan);
