//! Collector invariants checked over generated object graphs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use recycler::flags::{
    COLLECT_NOW_CONCURRENT, COLLECT_NOW_DEFAULT, COLLECT_NOW_EXHAUSTIVE_SKIP_STACK,
    FORCE_FINISH_COLLECTION,
};
use recycler::{CollectionFlags, CollectionWrapper, Recycler, RecyclerConfig};

const WORD: usize = std::mem::size_of::<usize>();
const EDGES: usize = 4;

/// Small deterministic generator so graphs are identical across recyclers.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> usize {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        (self.0 >> 33) as usize
    }
}

/// A graph of `count` nodes with up to `EDGES` outgoing edges each. Every
/// tenth node is pinned.
struct Graph {
    nodes: Vec<usize>,
    edges: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

impl Graph {
    fn build(recycler: &Recycler, count: usize, seed: u64) -> Self {
        let mut rng = Lcg(seed);
        let nodes: Vec<usize> = (0..count)
            .map(|_| recycler.alloc_zero(EDGES * WORD))
            .collect();
        let mut edges = vec![Vec::new(); count];
        for (from, &node) in nodes.iter().enumerate() {
            for slot in 0..rng.next() % (EDGES + 1) {
                let to = rng.next() % count;
                recycler.store(node, slot, nodes[to]).unwrap();
                edges[from].push(to);
            }
        }
        let roots: Vec<usize> = (0..count).step_by(10).collect();
        for &root in &roots {
            recycler.root_add_ref(nodes[root]);
        }
        Self {
            nodes,
            edges,
            roots,
        }
    }

    /// Node indices reachable from the pinned nodes.
    fn reachable(&self) -> Vec<bool> {
        let mut seen = vec![false; self.nodes.len()];
        let mut work = self.roots.clone();
        while let Some(index) = work.pop() {
            if std::mem::replace(&mut seen[index], true) {
                continue;
            }
            work.extend(self.edges[index].iter().copied());
        }
        seen
    }

    fn survivors(&self, recycler: &Recycler) -> Vec<bool> {
        self.nodes
            .iter()
            .map(|&node| recycler.is_valid_object(node))
            .collect()
    }
}

fn in_thread() -> RecyclerConfig {
    RecyclerConfig::in_thread().set_collect_on_allocation(false)
}

// ============================================================================
// Mark-sweep safety
// ============================================================================

#[test]
fn test_reachable_objects_survive() {
    for seed in [1, 7, 42] {
        let recycler = Recycler::new(in_thread());
        let graph = Graph::build(&recycler, 300, seed);
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));

        let reachable = graph.reachable();
        let survivors = graph.survivors(&recycler);
        for (index, &live) in reachable.iter().enumerate() {
            if live {
                assert!(survivors[index], "seed {seed}: reachable node {index} was freed");
            }
        }
        // Nothing else holds node addresses, so unreachable nodes must go.
        assert_eq!(reachable, survivors, "seed {seed}");
    }
}

#[test]
fn test_collection_is_repeatable() {
    let recycler = Recycler::new(in_thread());
    let graph = Graph::build(&recycler, 200, 9);
    let reachable = graph.reachable();
    for _ in 0..3 {
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert_eq!(graph.survivors(&recycler), reachable);
    }
}

// ============================================================================
// Weak references
// ============================================================================

#[test]
fn test_cleared_weak_reference_stays_null() {
    let recycler = Recycler::new(in_thread());
    let target = recycler.alloc_zero(32);
    let weak = recycler.create_weak_reference(target).unwrap();
    recycler.root_add_ref(weak);

    assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
    assert_eq!(recycler.weak_reference_target(weak), None);

    // Reuse the freed slot; the handle must not resurrect.
    let reused: Vec<usize> = (0..64).map(|_| recycler.alloc_zero(32)).collect();
    for &obj in &reused {
        recycler.root_add_ref(obj);
    }
    for _ in 0..3 {
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert_eq!(recycler.weak_reference_target(weak), None);
    }
}

// ============================================================================
// Pinning
// ============================================================================

#[test]
fn test_pin_round_trip() {
    const PINS: usize = 5;

    let recycler = Recycler::new(in_thread());
    let obj = recycler.alloc_zero(16);
    for expected in 1..=PINS {
        assert_eq!(recycler.root_add_ref(obj), expected);
    }
    for expected in (0..PINS).rev() {
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert!(recycler.is_valid_object(obj));
        assert_eq!(recycler.root_release(obj), expected);
    }
    assert!(recycler.pinned_objects().is_empty());
    assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
    assert!(!recycler.is_valid_object(obj));
}

#[test]
fn test_unpin_during_background_find_roots_is_deferred() {
    let recycler = Recycler::new(
        RecyclerConfig::new()
            .set_collect_on_allocation(false)
            .set_parallel_mark(false),
    );
    let obj = recycler.alloc_zero(16);
    recycler.root_add_ref(obj);

    assert!(recycler.collect_now(COLLECT_NOW_CONCURRENT | CollectionFlags::SKIP_STACK));
    assert!(recycler.collection_in_progress());
    // The pin map stays frozen until the mark is finished in thread.
    assert_eq!(recycler.root_release(obj), 0);
    assert!(recycler.pinned_objects().is_empty());

    recycler.ensure_not_collecting();
    assert!(!recycler.collection_in_progress());
    assert!(recycler.pinned_objects().is_empty());

    assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
    assert!(!recycler.is_valid_object(obj));
}

#[test]
fn test_pin_history_tracked() {
    let recycler = Recycler::new(in_thread().set_track_pinned_stacks(true));
    let obj = recycler.alloc_zero(16);
    recycler.root_add_ref(obj);
    recycler.root_add_ref(obj);
    recycler.root_release(obj);

    let pinned = recycler.pinned_objects();
    assert_eq!(pinned.len(), 1);
    assert_eq!(pinned[0].address, obj);
    assert_eq!(pinned[0].count, 1);
    assert_eq!(pinned[0].history.len(), 3);
}

// ============================================================================
// At most one collection in flight
// ============================================================================

#[derive(Default)]
struct CycleCounter {
    started: AtomicUsize,
    finished: AtomicUsize,
}

impl CollectionWrapper for CycleCounter {
    fn pre_collection_callback(&self) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn post_collection_callback(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_requests_during_collection_do_not_start_another() {
    let recycler = Recycler::new(RecyclerConfig::new().set_collect_on_allocation(false));
    let counter = Arc::new(CycleCounter::default());
    recycler.set_collection_wrapper(counter.clone());
    let graph = Graph::build(&recycler, 500, 3);

    let request = COLLECT_NOW_CONCURRENT | CollectionFlags::SKIP_STACK;
    assert!(recycler.collect_now(request));
    while recycler.collection_in_progress() {
        recycler.collect_now(request);
        assert_eq!(counter.started.load(Ordering::SeqCst), 1);
        std::thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(counter.started.load(Ordering::SeqCst), 1);
    assert_eq!(counter.finished.load(Ordering::SeqCst), 1);
    assert_eq!(recycler.collection_count(), 1);
    let survivors = graph.survivors(&recycler);
    for (index, &live) in graph.reachable().iter().enumerate() {
        if live {
            assert!(survivors[index]);
        }
    }
}

// ============================================================================
// Parallel / sequential equivalence
// ============================================================================

fn survivors_with(config: RecyclerConfig, seed: u64) -> (Vec<bool>, usize) {
    let recycler = Recycler::new(config.set_collect_on_allocation(false));
    let graph = Graph::build(&recycler, 2000, seed);
    assert!(recycler.collect_now(COLLECT_NOW_DEFAULT | CollectionFlags::SKIP_STACK));
    assert!(!recycler.collection_in_progress());
    // Marks are kept after the sweep until the next cycle resets them.
    let marked = graph
        .nodes
        .iter()
        .filter(|&&node| recycler.find_heap_object(node).is_some_and(|info| info.marked))
        .count();
    (graph.survivors(&recycler), marked)
}

#[test]
fn test_marking_strategies_agree() {
    let sequential = RecyclerConfig::in_thread();
    let parallel = RecyclerConfig::in_thread()
        .set_parallel_mark(true)
        .set_max_parallelism(4);
    let background = RecyclerConfig::new()
        .set_parallel_mark(true)
        .set_max_parallelism(4)
        .set_concurrent_sweep(false);

    for seed in [5, 11] {
        let (expected, expected_marked) = survivors_with(sequential, seed);
        assert_eq!(survivors_with(parallel, seed), (expected.clone(), expected_marked));
        assert_eq!(survivors_with(background, seed), (expected, expected_marked));
    }
}

// ============================================================================
// Low-memory rescan
// ============================================================================

#[test]
fn test_low_memory_rescan_converges() {
    for width in [300, 600, 1200] {
        let recycler = Recycler::new(in_thread().set_mark_stack_page_limit(Some(0)));
        let root = recycler.alloc_zero(width * WORD);
        let children: Vec<usize> = (0..width)
            .map(|i| {
                let child = recycler.alloc_zero(WORD);
                recycler.store(root, i, child).unwrap();
                child
            })
            .collect();
        recycler.root_add_ref(root);

        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert!(!recycler.need_oom_rescan());
        assert!(children.iter().all(|&child| recycler.is_valid_object(child)));

        // A second cycle over the same heap converges as well.
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert!(!recycler.need_oom_rescan());
    }
}

#[test]
fn test_forced_finish_completes_concurrent_collection() {
    let recycler = Recycler::new(RecyclerConfig::new().set_collect_on_allocation(false));
    let _graph = Graph::build(&recycler, 100, 13);
    assert!(recycler.collect_now(COLLECT_NOW_CONCURRENT | CollectionFlags::SKIP_STACK));
    recycler.finish_concurrent(FORCE_FINISH_COLLECTION);
    assert!(!recycler.collection_in_progress());
}
