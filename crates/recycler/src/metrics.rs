//! Collection statistics.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How a cycle was executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CollectionKind {
    /// No collection has run yet.
    #[default]
    None = 0,
    /// Mark and sweep on the calling thread.
    InThread = 1,
    /// Mark on the background thread, finished in thread.
    Concurrent = 2,
    /// Marks kept from the previous cycle, only roots and dirty pages rescanned.
    Partial = 3,
}

/// Statistics of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionStats {
    /// Execution mode of the cycle.
    pub kind: CollectionKind,
    /// Time from the start of the cycle to the end of its sweep.
    pub duration: Duration,
    /// Objects marked live.
    pub marked_objects: usize,
    /// Bytes marked live.
    pub marked_bytes: usize,
    /// Objects freed by the sweep.
    pub swept_objects: usize,
    /// Bytes freed by the sweep.
    pub swept_bytes: usize,
    /// Objects whose finalizer ran.
    pub finalized_objects: usize,
    /// Bytes scanned by rescans of dirty pages.
    pub rescan_bytes: usize,
    /// Dirty pages rescanned.
    pub rescan_pages: usize,
    /// Passes of the low-memory rescan loop.
    pub oom_rescan_passes: usize,
    /// Repeat marks done on the background thread.
    pub background_repeat_marks: usize,
    /// Per-phase durations.
    pub phases: PhaseTimer,
}

/// Phase durations of a cycle.
///
/// # Example
///
/// ```
/// use recycler::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... mark work ...
/// timer.end_mark();
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseTimer {
    /// Time spent clearing marks.
    pub reset_marks: Duration,
    /// Time spent marking roots.
    pub find_roots: Duration,
    /// Time spent draining mark stacks, rescans included.
    pub mark: Duration,
    /// Time spent sweeping.
    pub sweep: Duration,
    current_start: Option<Instant>,
}

impl PhaseTimer {
    /// Create a timer with all durations zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            reset_marks: Duration::ZERO,
            find_roots: Duration::ZERO,
            mark: Duration::ZERO,
            sweep: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// Add the elapsed time to the reset-marks phase.
    pub fn end_reset_marks(&mut self) {
        let elapsed = self.take();
        self.reset_marks += elapsed;
    }

    /// Add the elapsed time to the find-roots phase.
    pub fn end_find_roots(&mut self) {
        let elapsed = self.take();
        self.find_roots += elapsed;
    }

    /// Add the elapsed time to the mark phase.
    pub fn end_mark(&mut self) {
        let elapsed = self.take();
        self.mark += elapsed;
    }

    /// Add the elapsed time to the sweep phase.
    pub fn end_sweep(&mut self) {
        let elapsed = self.take();
        self.sweep += elapsed;
    }
}

/// Process-wide counters across every recycler.
///
/// # Example
///
/// ```
/// use recycler::metrics::global_metrics;
///
/// let metrics = global_metrics();
/// println!("Total collections: {}", metrics.total_collections());
/// ```
#[derive(Debug)]
pub struct GlobalMetrics {
    collections: AtomicUsize,
    concurrent_collections: AtomicUsize,
    partial_collections: AtomicUsize,
    bytes_reclaimed: AtomicUsize,
    objects_reclaimed: AtomicUsize,
    oom_rescan_passes: AtomicUsize,
    pause_ns: AtomicU64,
}

impl Default for GlobalMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalMetrics {
    /// Create a set of counters, all zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            collections: AtomicUsize::new(0),
            concurrent_collections: AtomicUsize::new(0),
            partial_collections: AtomicUsize::new(0),
            bytes_reclaimed: AtomicUsize::new(0),
            objects_reclaimed: AtomicUsize::new(0),
            oom_rescan_passes: AtomicUsize::new(0),
            pause_ns: AtomicU64::new(0),
        }
    }

    /// Completed cycles.
    #[inline]
    #[must_use]
    pub fn total_collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Cycles whose mark ran on the background thread.
    #[inline]
    #[must_use]
    pub fn total_concurrent_collections(&self) -> usize {
        self.concurrent_collections.load(Ordering::Relaxed)
    }

    /// Partial cycles.
    #[inline]
    #[must_use]
    pub fn total_partial_collections(&self) -> usize {
        self.partial_collections.load(Ordering::Relaxed)
    }

    /// Bytes freed by sweeps.
    #[inline]
    #[must_use]
    pub fn total_bytes_reclaimed(&self) -> usize {
        self.bytes_reclaimed.load(Ordering::Relaxed)
    }

    /// Objects freed by sweeps.
    #[inline]
    #[must_use]
    pub fn total_objects_reclaimed(&self) -> usize {
        self.objects_reclaimed.load(Ordering::Relaxed)
    }

    /// Passes of the low-memory rescan loop.
    #[inline]
    #[must_use]
    pub fn total_oom_rescan_passes(&self) -> usize {
        self.oom_rescan_passes.load(Ordering::Relaxed)
    }

    /// Cumulative cycle duration in nanoseconds.
    #[inline]
    #[must_use]
    pub fn total_pause_ns(&self) -> u64 {
        self.pause_ns.load(Ordering::Relaxed)
    }

    fn record(&self, stats: &CollectionStats) {
        self.collections.fetch_add(1, Ordering::Relaxed);
        match stats.kind {
            CollectionKind::Concurrent => {
                self.concurrent_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionKind::Partial => {
                self.partial_collections.fetch_add(1, Ordering::Relaxed);
            }
            CollectionKind::InThread | CollectionKind::None => {}
        }
        self.bytes_reclaimed
            .fetch_add(stats.swept_bytes, Ordering::Relaxed);
        self.objects_reclaimed
            .fetch_add(stats.swept_objects, Ordering::Relaxed);
        self.oom_rescan_passes
            .fetch_add(stats.oom_rescan_passes, Ordering::Relaxed);
        self.pause_ns.fetch_add(
            stats.duration.as_nanos().try_into().unwrap_or(u64::MAX),
            Ordering::Relaxed,
        );
    }
}

static GLOBAL_METRICS: GlobalMetrics = GlobalMetrics::new();

/// The process-wide counters.
#[must_use]
pub fn global_metrics() -> &'static GlobalMetrics {
    &GLOBAL_METRICS
}

/// Fold a finished cycle into the process-wide counters.
pub(crate) fn record_stats(stats: &CollectionStats) {
    GLOBAL_METRICS.record(stats);
}
