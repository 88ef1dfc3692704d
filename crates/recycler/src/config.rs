//! Recycler configuration.
//!
//! [`RecyclerConfig`] selects which collection strategies are available and
//! [`RecyclerHeuristic`] holds the tuning values the collection heuristics
//! consult. Both are plain values with `const fn` setters so hosts can build
//! them in statics.

use std::time::Duration;

use crate::heap::PAGE_SIZE;

const MB: usize = 1024 * 1024;

/// Base factor the default byte thresholds are scaled from.
pub const DEFAULT_HEURISTIC_FACTOR: usize = 192;

/// Tuning values for when to collect and how long to wait for the background thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecyclerHeuristic {
    /// Uncollected bytes that force a collection regardless of the clock.
    pub max_uncollected_alloc_bytes: usize,
    /// Uncollected bytes below which an allocation-triggered request only finishes dispose.
    pub uncollected_alloc_bytes_collection: usize,
    /// Uncollected bytes at which a pending concurrent collection gets finished with priority.
    pub uncollected_alloc_bytes_concurrent_priority_boost: usize,
    /// Times a collection may hand finish-mark back to the background thread.
    pub max_background_finish_mark_count: usize,
    /// How long the mutator waits for a background finish mark.
    pub background_finish_mark_wait_time: Duration,
    /// Rescanned bytes below which background repeat marking stops.
    pub min_background_repeat_mark_rescan_bytes: usize,
    /// Maximum background rescan passes before handing over to the mutator.
    pub max_background_repeat_mark_count: usize,
    /// Rescanned pages needed before a second background repeat pass runs.
    pub background_second_repeat_mark_threshold: usize,
    /// Bounded wait used when an allocation-driven request finishes a concurrent collection.
    pub finish_concurrent_collect_wait_time: Duration,
    /// Time after the start of a boosted collection before finishing is forced.
    pub priority_boost_timeout: Duration,
    /// Minimum time between clock-driven collections.
    pub tick_count_collection: Duration,
    /// Time the in-thread finish of a collection is expected to take.
    pub tick_count_finish_collection: Duration,
    /// Lower clamp of the partial collection new-page threshold.
    pub min_partial_uncollected_new_page_count: usize,
    /// Upper clamp of the partial collection new-page threshold.
    pub max_partial_uncollected_new_page_count: usize,
    /// How long freed pages stay committed before idle decommit releases them.
    pub idle_decommit_time: Duration,
    /// Free pages kept committed after a collection.
    pub max_free_page_count: usize,
}

impl RecyclerHeuristic {
    /// Creates the default heuristics.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_uncollected_alloc_bytes: DEFAULT_HEURISTIC_FACTOR * MB,
            uncollected_alloc_bytes_collection: MB,
            uncollected_alloc_bytes_concurrent_priority_boost: DEFAULT_HEURISTIC_FACTOR * MB,
            max_background_finish_mark_count: 1,
            background_finish_mark_wait_time: Duration::from_millis(15),
            min_background_repeat_mark_rescan_bytes: MB,
            max_background_repeat_mark_count: 2,
            background_second_repeat_mark_threshold: 1000,
            finish_concurrent_collect_wait_time: Duration::from_millis(1000),
            priority_boost_timeout: Duration::from_millis(5000),
            tick_count_collection: Duration::from_millis(1200),
            tick_count_finish_collection: Duration::from_millis(45),
            min_partial_uncollected_new_page_count: 4 * MB / PAGE_SIZE,
            max_partial_uncollected_new_page_count: DEFAULT_HEURISTIC_FACTOR * MB / PAGE_SIZE,
            idle_decommit_time: Duration::from_millis(1000),
            max_free_page_count: 256,
        }
    }

    /// Uncollected bytes that force a collection when the host is exiting script.
    #[must_use]
    pub const fn max_uncollected_alloc_bytes_on_exit(&self) -> usize {
        self.max_uncollected_alloc_bytes / 2
    }

    /// Uncollected bytes that force a full collection while partial collect mode is active.
    #[must_use]
    pub const fn max_uncollected_alloc_bytes_partial_collect(&self) -> usize {
        self.max_uncollected_alloc_bytes - MB
    }

    #[must_use]
    pub const fn set_max_uncollected_alloc_bytes(mut self, bytes: usize) -> Self {
        self.max_uncollected_alloc_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn set_uncollected_alloc_bytes_collection(mut self, bytes: usize) -> Self {
        self.uncollected_alloc_bytes_collection = bytes;
        self
    }

    #[must_use]
    pub const fn set_finish_concurrent_collect_wait_time(mut self, wait: Duration) -> Self {
        self.finish_concurrent_collect_wait_time = wait;
        self
    }

    #[must_use]
    pub const fn set_priority_boost_timeout(mut self, timeout: Duration) -> Self {
        self.priority_boost_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn set_tick_count_collection(mut self, tick: Duration) -> Self {
        self.tick_count_collection = tick;
        self
    }

    #[must_use]
    pub const fn set_max_background_repeat_mark_count(mut self, count: usize) -> Self {
        self.max_background_repeat_mark_count = count;
        self
    }

    #[must_use]
    pub const fn set_idle_decommit_time(mut self, time: Duration) -> Self {
        self.idle_decommit_time = time;
        self
    }

    #[must_use]
    pub const fn set_max_free_page_count(mut self, pages: usize) -> Self {
        self.max_free_page_count = pages;
        self
    }

    #[must_use]
    pub const fn set_partial_new_page_count_range(mut self, min: usize, max: usize) -> Self {
        self.min_partial_uncollected_new_page_count = min;
        self.max_partial_uncollected_new_page_count = max;
        self
    }
}

impl Default for RecyclerHeuristic {
    fn default() -> Self {
        Self::new()
    }
}

/// Which collection strategies a recycler may use.
///
/// # Example
///
/// ```
/// use recycler::RecyclerConfig;
///
/// let config = RecyclerConfig::new()
///     .set_concurrent_mark(false)
///     .set_parallel_mark(false);
/// assert!(!config.concurrent_mark);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecyclerConfig {
    /// Run reset-marks, find-roots and mark on the background thread.
    pub concurrent_mark: bool,
    /// Split marking across the parallel worker threads.
    pub parallel_mark: bool,
    /// Free unmarked objects on the background thread.
    pub concurrent_sweep: bool,
    /// Allow partial collections that keep the previous marks.
    pub partial_collect: bool,
    /// Upper bound on threads participating in a mark, the mutator included.
    pub max_parallelism: usize,
    /// Never create the background thread.
    pub force_in_thread: bool,
    /// Treat pointers into the middle of an object as references to it.
    pub interior_pointers: bool,
    /// Scan objects allocated with `IMPLICIT_ROOT` as roots.
    pub scan_implicit_roots: bool,
    /// Keep a pin history per object for diagnostics.
    pub track_pinned_stacks: bool,
    /// Let allocation pressure trigger collections.
    pub collect_on_allocation: bool,
    /// Maximum pages the mark stack may take from its page allocator.
    pub mark_stack_page_limit: Option<usize>,
    /// Collection heuristics.
    pub heuristics: RecyclerHeuristic,
}

impl RecyclerConfig {
    /// Creates the default configuration with every strategy enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_parallelism: std::thread::available_parallelism().map_or(1, usize::from),
            ..Self::in_thread()
        }
        .set_concurrent_mark(true)
        .set_parallel_mark(true)
        .set_concurrent_sweep(true)
        .set_force_in_thread(false)
    }

    /// A configuration that does every phase on the calling thread.
    #[must_use]
    pub const fn in_thread() -> Self {
        Self {
            concurrent_mark: false,
            parallel_mark: false,
            concurrent_sweep: false,
            partial_collect: false,
            max_parallelism: 1,
            force_in_thread: true,
            interior_pointers: false,
            scan_implicit_roots: true,
            track_pinned_stacks: false,
            collect_on_allocation: true,
            mark_stack_page_limit: None,
            heuristics: RecyclerHeuristic::new(),
        }
    }

    #[must_use]
    pub const fn set_concurrent_mark(mut self, enabled: bool) -> Self {
        self.concurrent_mark = enabled;
        self
    }

    #[must_use]
    pub const fn set_parallel_mark(mut self, enabled: bool) -> Self {
        self.parallel_mark = enabled;
        self
    }

    #[must_use]
    pub const fn set_concurrent_sweep(mut self, enabled: bool) -> Self {
        self.concurrent_sweep = enabled;
        self
    }

    #[must_use]
    pub const fn set_partial_collect(mut self, enabled: bool) -> Self {
        self.partial_collect = enabled;
        self
    }

    #[must_use]
    pub const fn set_max_parallelism(mut self, threads: usize) -> Self {
        self.max_parallelism = threads;
        self
    }

    #[must_use]
    pub const fn set_force_in_thread(mut self, force: bool) -> Self {
        self.force_in_thread = force;
        self
    }

    #[must_use]
    pub const fn set_interior_pointers(mut self, enabled: bool) -> Self {
        self.interior_pointers = enabled;
        self
    }

    #[must_use]
    pub const fn set_scan_implicit_roots(mut self, enabled: bool) -> Self {
        self.scan_implicit_roots = enabled;
        self
    }

    #[must_use]
    pub const fn set_track_pinned_stacks(mut self, enabled: bool) -> Self {
        self.track_pinned_stacks = enabled;
        self
    }

    #[must_use]
    pub const fn set_collect_on_allocation(mut self, enabled: bool) -> Self {
        self.collect_on_allocation = enabled;
        self
    }

    #[must_use]
    pub const fn set_mark_stack_page_limit(mut self, limit: Option<usize>) -> Self {
        self.mark_stack_page_limit = limit;
        self
    }

    #[must_use]
    pub const fn set_heuristics(mut self, heuristics: RecyclerHeuristic) -> Self {
        self.heuristics = heuristics;
        self
    }

    /// Whether a background thread may be used at all.
    #[must_use]
    pub const fn background_enabled(&self) -> bool {
        !self.force_in_thread && (self.concurrent_mark || self.concurrent_sweep)
    }

    /// Number of dedicated parallel mark threads to create.
    #[must_use]
    pub const fn parallel_thread_count(&self) -> usize {
        if !self.parallel_mark || self.max_parallelism < 3 {
            0
        } else if self.max_parallelism >= 4 {
            2
        } else {
            1
        }
    }
}

impl Default for RecyclerConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_heuristics_scale_from_factor() {
        let h = RecyclerHeuristic::default();
        assert_eq!(h.max_uncollected_alloc_bytes, 192 * MB);
        assert_eq!(h.max_uncollected_alloc_bytes_on_exit(), 96 * MB);
        assert_eq!(h.max_uncollected_alloc_bytes_partial_collect(), 191 * MB);
        assert!(
            h.min_partial_uncollected_new_page_count < h.max_partial_uncollected_new_page_count
        );
    }

    #[test]
    fn test_in_thread_disables_background() {
        let config = RecyclerConfig::in_thread();
        assert!(!config.background_enabled());
        assert_eq!(config.parallel_thread_count(), 0);
    }

    #[test]
    fn test_parallel_thread_count() {
        let base = RecyclerConfig::in_thread().set_parallel_mark(true);
        assert_eq!(base.set_max_parallelism(2).parallel_thread_count(), 0);
        assert_eq!(base.set_max_parallelism(3).parallel_thread_count(), 1);
        assert_eq!(base.set_max_parallelism(16).parallel_thread_count(), 2);
    }

    #[test]
    fn test_setters_chain() {
        let config = RecyclerConfig::in_thread()
            .set_partial_collect(true)
            .set_mark_stack_page_limit(Some(0))
            .set_interior_pointers(true);
        assert!(config.partial_collect);
        assert_eq!(config.mark_stack_page_limit, Some(0));
        assert!(config.interior_pointers);
    }
}
