/*!
 * Allocation Benchmarks
 * Hot-path cost of allocate/deallocate and in-place reallocation
 */

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use shmheap::{AllocFlags, MemoryManager};

fn bench_allocate_deallocate(c: &mut Criterion) {
    let manager = MemoryManager::new().with_name("shmheap-bench");
    manager.init().unwrap();

    c.bench_function("allocate_deallocate_256", |b| {
        b.iter(|| {
            let p = manager
                .allocate(black_box(256), AllocFlags::WRITE, 0)
                .unwrap();
            manager.deallocate(p).unwrap();
        })
    });
}

fn bench_best_fit_under_fragmentation(c: &mut Criterion) {
    let manager = MemoryManager::new().with_name("shmheap-bench-frag");
    manager.init().unwrap();

    // Leave holes of mixed sizes behind so every allocation has to search.
    let ptrs: Vec<_> = (0..256)
        .map(|i| {
            manager
                .allocate(64 + (i % 13) * 48, AllocFlags::WRITE, 0)
                .unwrap()
        })
        .collect();
    for p in ptrs.iter().step_by(2) {
        manager.deallocate(*p).unwrap();
    }

    c.bench_function("allocate_in_fragmented_heap", |b| {
        b.iter(|| {
            let p = manager
                .allocate(black_box(96), AllocFlags::WRITE, 0)
                .unwrap();
            manager.deallocate(p).unwrap();
        })
    });
}

fn bench_realloc_in_place(c: &mut Criterion) {
    let manager = MemoryManager::new().with_name("shmheap-bench-realloc");
    manager.init().unwrap();

    c.bench_function("reallocate_shrink_grow", |b| {
        let p = manager.allocate(1024, AllocFlags::WRITE, 0).unwrap();
        let mut p = p;
        b.iter(|| {
            p = manager.reallocate(p, black_box(256), AllocFlags::WRITE).unwrap();
            p = manager.reallocate(p, black_box(1024), AllocFlags::WRITE).unwrap();
        });
        manager.deallocate(p).unwrap();
    });
}

criterion_group!(
    benches,
    bench_allocate_deallocate,
    bench_best_fit_under_fragmentation,
    bench_realloc_in_place
);
criterion_main!(benches);
