//! Benchmark: collection pause time per execution mode
//!
//! Measures allocation throughput and the pause of in-thread, parallel,
//! concurrent and partial collections over the same shape of heap.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use recycler::flags::{
    COLLECT_NOW_CONCURRENT, COLLECT_NOW_DEFAULT, COLLECT_NOW_EXHAUSTIVE_SKIP_STACK,
    COLLECT_NOW_PARTIAL, FORCE_FINISH_COLLECTION,
};
use recycler::{CollectionFlags, Recycler, RecyclerConfig};
use std::hint::black_box;
use std::time::{Duration, Instant};

const WORD: usize = std::mem::size_of::<usize>();

/// Builds a binary tree of `depth` levels and pins its root.
fn build_tree(recycler: &Recycler, depth: usize) -> usize {
    fn node(recycler: &Recycler, depth: usize) -> usize {
        let obj = recycler.alloc_zero(2 * WORD);
        if depth > 0 {
            recycler.store(obj, 0, node(recycler, depth - 1)).unwrap();
            recycler.store(obj, 1, node(recycler, depth - 1)).unwrap();
        }
        obj
    }
    let root = node(recycler, depth);
    recycler.root_add_ref(root);
    root
}

fn alloc_garbage(recycler: &Recycler, count: usize) {
    for _ in 0..count {
        black_box(recycler.alloc_zero(4 * WORD));
    }
}

fn bench_alloc_throughput(c: &mut Criterion) {
    let recycler = Recycler::new(RecyclerConfig::in_thread());
    c.bench_function("alloc_10000_small", |b| {
        b.iter(|| alloc_garbage(&recycler, 10_000));
    });
}

fn bench_in_thread_pause(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_thread_pause");
    for depth in [10usize, 14] {
        let recycler =
            Recycler::new(RecyclerConfig::in_thread().set_collect_on_allocation(false));
        build_tree(&recycler, depth);
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                alloc_garbage(&recycler, 1000);
                recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK)
            });
        });
    }
    group.finish();
}

fn bench_parallel_mark(c: &mut Criterion) {
    let recycler = Recycler::new(
        RecyclerConfig::in_thread()
            .set_collect_on_allocation(false)
            .set_parallel_mark(true)
            .set_max_parallelism(4),
    );
    build_tree(&recycler, 14);
    c.bench_function("parallel_mark_depth_14", |b| {
        b.iter(|| recycler.collect_now(COLLECT_NOW_DEFAULT | CollectionFlags::SKIP_STACK));
    });
}

fn bench_concurrent_finish_pause(c: &mut Criterion) {
    let recycler = Recycler::new(RecyclerConfig::new().set_collect_on_allocation(false));
    build_tree(&recycler, 14);
    c.bench_function("concurrent_finish_pause_depth_14", |b| {
        b.iter_custom(|iterations| {
            let mut paused = Duration::ZERO;
            for _ in 0..iterations {
                alloc_garbage(&recycler, 1000);
                let start = Instant::now();
                recycler.collect_now(COLLECT_NOW_CONCURRENT | CollectionFlags::SKIP_STACK);
                paused += start.elapsed();
                // Let the background mark run before measuring the finish.
                std::thread::sleep(Duration::from_millis(1));
                let start = Instant::now();
                recycler.finish_concurrent(FORCE_FINISH_COLLECTION | CollectionFlags::SKIP_STACK);
                recycler.ensure_not_collecting();
                paused += start.elapsed();
            }
            paused
        });
    });
}

fn bench_partial_collect(c: &mut Criterion) {
    let recycler = Recycler::new(
        RecyclerConfig::in_thread()
            .set_collect_on_allocation(false)
            .set_partial_collect(true),
    );
    let root = build_tree(&recycler, 14);
    // Enter partial mode with one full cycle.
    recycler.collect_now(COLLECT_NOW_PARTIAL | CollectionFlags::SKIP_STACK);
    c.bench_function("partial_collect_depth_14", |b| {
        b.iter(|| {
            let fresh = recycler.alloc_zero(2 * WORD);
            recycler.store(root, 0, fresh).unwrap();
            recycler.collect_now(COLLECT_NOW_PARTIAL | CollectionFlags::SKIP_STACK)
        });
    });
}

criterion_group!(
    benches,
    bench_alloc_throughput,
    bench_in_thread_pause,
    bench_parallel_mark,
    bench_concurrent_finish_pause,
    bench_partial_collect,
);
criterion_main!(benches);
