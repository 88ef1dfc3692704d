//! Sweep, partial collection, dispose and the end of a cycle.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::status::StatusFlags;
use super::RecyclerCore;
use crate::flags::CollectionFlags;
use crate::heap::SweepCounts;
use crate::metrics::{record_stats, CollectionKind};
use crate::state::CollectionState;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{log_phase_end, log_phase_start, trace_phase, Phase};

impl RecyclerCore {
    fn record_sweep(&self, counts: SweepCounts) {
        self.with_stats(|stats| {
            stats.swept_objects += counts.objects;
            stats.swept_bytes += counts.bytes;
        });
    }

    /// Sweeps the heap. Returns `true` when the free pass was handed to the
    /// background thread.
    pub(super) fn sweep(&self, concurrent: bool) -> bool {
        self.set_state(CollectionState::SWEEP);
        self.with_stats(|stats| stats.phases.start());
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(Phase::Sweep);
        #[cfg(feature = "tracing")]
        log_phase_start(Phase::Sweep, self.heap.used_bytes());

        self.weak.sweep(&self.heap);
        let finalized = self.heap.finalize_garbage();
        if finalized > 0 {
            self.status.insert(StatusFlags::HAS_DISPOSABLE_OBJECT);
        }
        self.with_stats(|stats| stats.finalized_objects += finalized);

        if concurrent
            && self.status.contains(StatusFlags::ENABLE_CONCURRENT_SWEEP)
            && self.ensure_background()
        {
            self.set_state(CollectionState::SETUP_CONCURRENT_SWEEP);
            self.record_sweep(self.heap.sweep(true));
            self.set_state(CollectionState::CONCURRENT_SWEEP);
            self.with_stats(|stats| stats.phases.end_sweep());
            if self.dispatch_background() {
                return true;
            }
            #[cfg(feature = "tracing")]
            crate::background::tracing::log_fallback("concurrent sweep not dispatched");
            self.record_sweep(self.heap.background_sweep());
            self.heap.transfer_swept();
            return false;
        }

        let counts = self.heap.sweep(false);
        self.heap.release_empty_blocks();
        self.record_sweep(counts);
        self.with_stats(|stats| stats.phases.end_sweep());
        #[cfg(feature = "tracing")]
        log_phase_end(Phase::Sweep, counts.bytes);
        false
    }

    /// Ends a cycle once the sweep is complete.
    ///
    /// While the background thread still sweeps, only pending dispose runs.
    pub(super) fn finish_collection(&self, need_concurrent_sweep: bool) {
        if need_concurrent_sweep {
            self.finish_dispose_objects();
            return;
        }

        self.with_callback_state(
            CollectionState::POST_SWEEP_REDEFERRAL_CALLBACK,
            CollectionState::POST_COLLECTION_CALLBACK,
            |wrapper| wrapper.post_sweep_redeferral_callback(),
        );

        let heuristics = &self.config.heuristics;
        let (kind, rescan_pages) = {
            let stats = self.stats.lock();
            (stats.kind, stats.rescan_pages)
        };
        if self.status.contains(StatusFlags::IN_PARTIAL_COLLECT_MODE) {
            self.heuristics.lock().partial_new_page_threshold = rescan_pages
                .saturating_mul(4)
                .clamp(
                    heuristics.min_partial_uncollected_new_page_count,
                    heuristics.max_partial_uncollected_new_page_count,
                );
        } else if kind != CollectionKind::Partial
            && self.status.contains(
                StatusFlags::PARTIAL_REQUESTED.union(StatusFlags::ENABLE_PARTIAL_COLLECT),
            )
        {
            self.status.insert(StatusFlags::IN_PARTIAL_COLLECT_MODE);
        }

        let now = Instant::now();
        let duration = {
            let mut state = self.heuristics.lock();
            state.next_collection = now + heuristics.tick_count_collection;
            state.next_dispose = now + heuristics.tick_count_finish_collection;
            state.background_finish_mark_count = 0;
            state.background_rescan_count = 0;
            state.start_concurrent = None;
            state
                .collection_start
                .take()
                .map_or(Duration::ZERO, |start| now.duration_since(start))
        };
        let stats = {
            let mut stats = self.stats.lock();
            stats.duration = duration;
            *stats
        };
        record_stats(&stats);
        *self.last_stats.lock() = Some(stats);
        self.collection_count.fetch_add(1, Ordering::AcqRel);
        self.status.remove(StatusFlags::PRIORITY_BOOST);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            kind = ?stats.kind,
            marked_objects = stats.marked_objects,
            swept_objects = stats.swept_objects,
            swept_bytes = stats.swept_bytes,
            duration_us = u64::try_from(stats.duration.as_micros()).unwrap_or(u64::MAX),
            "collection_end"
        );

        self.with_callback_state(
            CollectionState::POST_COLLECTION_CALLBACK,
            CollectionState::NOT_COLLECTING,
            |wrapper| wrapper.post_collection_callback(),
        );

        if self.status.take(StatusFlags::DECOMMIT_ON_FINISH) {
            self.heap.decommit_excess(heuristics.max_free_page_count);
        }
        self.finish_dispose_objects();
    }

    /// Collects with the marks of the previous cycle kept: only the roots
    /// and the marked objects on dirty pages are scanned.
    pub(super) fn partial_collect(&self, flags: CollectionFlags) -> bool {
        debug_assert!(self.status.contains(StatusFlags::IN_PARTIAL_COLLECT_MODE));
        self.with_stats(|stats| stats.kind = CollectionKind::Partial);
        let env = self.mark_env(false);
        {
            let mut ctx = self.contexts[0].lock();
            self.set_state(CollectionState::RESCAN_FIND_ROOTS);
            self.with_stats(|stats| stats.phases.start());
            self.status.insert(StatusFlags::SCAN_PINNED_OBJECT_MAP);
            self.find_roots(&mut ctx, &env, true);
            if !self.status.contains(StatusFlags::SKIP_STACK) {
                self.scan_stack(&mut ctx, &env);
            }
            self.with_stats(|stats| stats.phases.end_find_roots());

            self.set_state(CollectionState::RESCAN_MARK);
            self.with_stats(|stats| stats.phases.start());
            self.rescan_dirty_pages(&mut ctx);
            self.process_mark_in_thread(&mut ctx, &env, true);
            while let Some(candidate) = self.tracked.pop() {
                ctx.push(candidate);
            }
            ctx.process_mark(&env);
            self.end_mark(&mut ctx, &env);
            self.with_stats(|stats| stats.phases.end_mark());
        }

        let need_concurrent_sweep = self.sweep(
            flags.contains(CollectionFlags::CONCURRENT)
                && !flags.contains(CollectionFlags::FORCE_IN_THREAD),
        );
        self.finish_collection(need_concurrent_sweep);
        true
    }

    pub(super) fn finish_partial_collect(&self) {
        self.status.remove(StatusFlags::IN_PARTIAL_COLLECT_MODE);
        self.heuristics.lock().partial_new_page_threshold =
            self.config.heuristics.min_partial_uncollected_new_page_count;
    }

    /// Runs dispose if objects are waiting and dispose is allowed.
    pub(super) fn finish_dispose_objects(&self) -> bool {
        let status = self.status.load();
        if status.contains(StatusFlags::IN_DISPOSE)
            || !status.contains(StatusFlags::HAS_DISPOSABLE_OBJECT | StatusFlags::ALLOW_DISPOSE)
        {
            return false;
        }
        self.dispose_objects();
        true
    }

    fn dispose_objects(&self) {
        self.status.insert(StatusFlags::IN_DISPOSE);
        self.status.remove(StatusFlags::HAS_DISPOSABLE_OBJECT);
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(Phase::Dispose);

        // Slots of disposed objects are only reused once no sweep is running.
        let free_now = !self.collection_in_progress();
        self.wrapper().dispose_objects(&mut || {
            self.heap.dispose_objects(free_now);
        });

        if self.heap.has_pending_dispose() {
            self.status.insert(StatusFlags::HAS_DISPOSABLE_OBJECT);
        }
        self.heuristics.lock().next_dispose =
            Instant::now() + self.config.heuristics.tick_count_finish_collection;
        self.status.remove(StatusFlags::IN_DISPOSE);
    }

    pub(super) fn finish_dispose_objects_now(&self, flags: CollectionFlags) -> bool {
        let _guard = self.collect_lock.lock();
        if self.state().is_callback_state()
            || self.status.contains(StatusFlags::IN_DISPOSE)
            || !flags.contains(CollectionFlags::ALLOW_DISPOSE)
            || !self.status.contains(StatusFlags::HAS_DISPOSABLE_OBJECT)
        {
            return false;
        }
        if flags.contains(CollectionFlags::HEURISTIC_TIME_IF_SCRIPT_ACTIVE)
            && Instant::now() < self.heuristics.lock().next_dispose
        {
            return false;
        }
        self.status.insert(StatusFlags::ALLOW_DISPOSE);
        self.dispose_objects();
        true
    }
}
