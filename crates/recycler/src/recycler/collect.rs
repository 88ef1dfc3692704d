//! Collection triggers, heuristics, and the finish and abort paths.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::status::StatusFlags;
use super::RecyclerCore;
use crate::error::FatalError;
use crate::event::WaitOutcome;
use crate::flags::{CollectionFlags, FORCE_FINISH_COLLECTION};
use crate::metrics::CollectionKind;
use crate::state::CollectionState;

/// Upper bound on back-to-back exhaustive cycles of one request.
const MAX_EXHAUSTIVE_REPEAT_COUNT: usize = 4;

impl RecyclerCore {
    pub(super) fn collect_now(&self, flags: CollectionFlags) -> bool {
        debug_assert!(flags.is_consistent(), "inconsistent collection flags {flags:?}");
        let _guard = self.collect_lock.lock();

        if self.state().is_callback_state()
            || self.status.contains(StatusFlags::IS_SHUTTING_DOWN)
        {
            return false;
        }
        if self.status.contains(StatusFlags::COLLECTION_DISABLED)
            && !flags.contains(CollectionFlags::EXPLICIT)
        {
            return false;
        }
        if flags.contains(CollectionFlags::EXHAUSTIVE_CANDIDATE) {
            self.status.insert(StatusFlags::HAS_EXHAUSTIVE_CANDIDATE);
            if flags.contains(CollectionFlags::HEURISTIC_NEVER) {
                return false;
            }
        }
        self.collect_internal(flags)
    }

    fn collect_internal(&self, flags: CollectionFlags) -> bool {
        if self.status.contains(StatusFlags::IN_DISPOSE)
            && !flags.contains(CollectionFlags::ALLOW_REENTRANT)
        {
            return false;
        }
        if self.collection_in_progress() {
            return self.try_finish_concurrent_collect(flags);
        }
        if flags.has_heuristic() {
            return self.collect_with_heuristic(flags);
        }
        self.collect(flags, flags.contains(CollectionFlags::PARTIAL))
    }

    fn collect_with_heuristic(&self, flags: CollectionFlags) -> bool {
        let heuristics = &self.config.heuristics;
        let partial_requested = flags.contains(CollectionFlags::PARTIAL);
        let bytes = self.heap.uncollected_alloc_bytes();

        if partial_requested && self.status.contains(StatusFlags::IN_PARTIAL_COLLECT_MODE) {
            let threshold = self.heuristics.lock().partial_new_page_threshold;
            if self.heap.uncollected_new_page_count() > threshold
                || bytes > heuristics.max_uncollected_alloc_bytes_partial_collect()
            {
                return self.collect(flags, true);
            }
        }

        if flags.contains(CollectionFlags::HEURISTIC_ALLOC_SIZE)
            && bytes < heuristics.uncollected_alloc_bytes_collection
        {
            return self.finish_dispose_objects();
        }

        if flags.intersects(CollectionFlags::TIME_HEURISTICS) {
            let max_bytes = if flags.contains(CollectionFlags::HEURISTIC_TIME_IF_SCRIPT_ACTIVE) {
                heuristics.max_uncollected_alloc_bytes_on_exit()
            } else {
                heuristics.max_uncollected_alloc_bytes
            };
            let next_collection = self.heuristics.lock().next_collection;
            if bytes < max_bytes && Instant::now() < next_collection {
                return self.finish_dispose_objects();
            }
        }

        self.collect(flags.difference(CollectionFlags::PARTIAL), partial_requested)
    }

    fn collect(&self, flags: CollectionFlags, partial_requested: bool) -> bool {
        self.setup_post_collection_flags(flags);
        self.status.set(StatusFlags::PARTIAL_REQUESTED, partial_requested);
        self.do_collect_wrapped(flags)
    }

    fn setup_post_collection_flags(&self, flags: CollectionFlags) {
        if flags.contains(CollectionFlags::EXHAUSTIVE)
            && !flags.contains(CollectionFlags::NO_EXHAUSTIVE_COLLECT)
        {
            self.status.insert(StatusFlags::IN_EXHAUSTIVE_COLLECTION);
        }
        if flags.contains(CollectionFlags::DECOMMIT_NOW) {
            self.status.insert(StatusFlags::IN_DECOMMIT_NOW_COLLECTION);
        }
        if flags.contains(CollectionFlags::CACHE_CLEANUP) {
            self.status.insert(StatusFlags::IN_CACHE_CLEANUP_COLLECTION);
        }
    }

    fn do_collect_wrapped(&self, flags: CollectionFlags) -> bool {
        self.status
            .set(StatusFlags::SKIP_STACK, flags.contains(CollectionFlags::SKIP_STACK));
        self.status
            .set(StatusFlags::ALLOW_DISPOSE, flags.contains(CollectionFlags::ALLOW_DISPOSE));
        self.wrapper()
            .execute_recycler_collection_function(flags, &mut |flags| self.do_collect(flags))
    }

    pub(super) fn do_collect(&self, flags: CollectionFlags) -> bool {
        self.finish_dispose_objects();

        if self.collection_in_progress() {
            self.finish_concurrent_work(flags.union(CollectionFlags::FORCE_FINISH));
            if self.collection_in_progress() {
                return true;
            }
        }

        let mut collected;
        loop {
            #[cfg(feature = "tracing")]
            let _span = crate::tracing::internal::trace_collection(
                if flags.contains(CollectionFlags::PARTIAL) { "partial" } else { "full" },
                crate::tracing::next_collection_id(),
            );

            self.begin_collection();
            if flags.contains(CollectionFlags::PARTIAL)
                && self.status.contains(StatusFlags::IN_PARTIAL_COLLECT_MODE)
            {
                collected = self.partial_collect(flags);
            } else {
                self.status.insert(StatusFlags::DECOMMIT_ON_FINISH);
                if self.status.contains(StatusFlags::IN_PARTIAL_COLLECT_MODE) {
                    self.finish_partial_collect();
                }
                collected = self.collect_full(flags);
            }

            if self.collection_in_progress() {
                return collected;
            }
            if !self.need_exhaustive_repeat_collect() {
                break;
            }
            self.heuristics.lock().exhaustive_repeat_count += 1;
        }
        self.end_collection();
        collected
    }

    fn collect_full(&self, flags: CollectionFlags) -> bool {
        let force_in_thread = flags.contains(CollectionFlags::FORCE_IN_THREAD);
        if flags.contains(CollectionFlags::CONCURRENT) && !force_in_thread {
            if self.start_background_mark_collect(flags) {
                return true;
            }
            if self.status.contains(StatusFlags::ENABLE_CONCURRENT_SWEEP)
                && self.start_concurrent_sweep_collect(flags)
            {
                return true;
            }
        }
        if !force_in_thread
            && self.status.contains(StatusFlags::ENABLE_CONCURRENT_MARK)
            && self.ensure_background()
        {
            return self.collect_on_concurrent_thread(flags);
        }
        self.collect_on_allocator_thread(flags)
    }

    /// Marks on the background thread while the caller waits, then finishes
    /// in thread.
    fn collect_on_concurrent_thread(&self, flags: CollectionFlags) -> bool {
        if !self.start_background_mark_collect(flags) {
            return self.collect_on_allocator_thread(flags);
        }
        self.finish_concurrent_collect(
            flags
                .difference(CollectionFlags::CONCURRENT)
                .union(CollectionFlags::FORCE_FINISH),
        )
    }

    fn begin_collection(&self) {
        self.with_callback_state(
            CollectionState::PRE_COLLECTION,
            CollectionState::NOT_COLLECTING,
            |wrapper| wrapper.pre_collection_callback(),
        );
        self.status.remove(StatusFlags::HAS_EXHAUSTIVE_CANDIDATE);
        self.abort_mark.store(false, Ordering::Release);
        *self.stats.lock() = Default::default();
        let suspend = {
            let mut heuristics = self.heuristics.lock();
            heuristics.collection_start = Some(Instant::now());
            !std::mem::replace(&mut heuristics.idle_decommit_suspended, true)
        };
        if suspend {
            self.heap.suspend_idle_decommit();
        }
        self.heap.reset_uncollected_alloc_bytes();
        self.heap.reset_uncollected_new_page_count();
    }

    fn need_exhaustive_repeat_collect(&self) -> bool {
        self.status.contains(
            StatusFlags::IN_EXHAUSTIVE_COLLECTION.union(StatusFlags::HAS_EXHAUSTIVE_CANDIDATE),
        ) && self.heuristics.lock().exhaustive_repeat_count < MAX_EXHAUSTIVE_REPEAT_COUNT
    }

    fn end_collection(&self) {
        debug_assert!(!self.collection_in_progress());
        let status = self.status.load();
        if status.intersects(
            StatusFlags::IN_DECOMMIT_NOW_COLLECTION.union(StatusFlags::IN_EXHAUSTIVE_COLLECTION),
        ) {
            self.heap.decommit_now();
            self.mark_pages.decommit_now();
        }
        if status.contains(StatusFlags::IN_CACHE_CLEANUP_COLLECTION) {
            self.heap.release_empty_segments();
            self.mark_pages.release_empty_segments();
        }
        self.status.remove(
            StatusFlags::IN_DECOMMIT_NOW_COLLECTION
                | StatusFlags::IN_EXHAUSTIVE_COLLECTION
                | StatusFlags::IN_CACHE_CLEANUP_COLLECTION
                | StatusFlags::PARTIAL_REQUESTED,
        );
        let resume = {
            let mut heuristics = self.heuristics.lock();
            heuristics.exhaustive_repeat_count = 0;
            std::mem::take(&mut heuristics.idle_decommit_suspended)
        };
        if resume {
            self.heap.resume_idle_decommit();
        }
    }

    /// Advances the in-flight collection on behalf of a new request.
    fn try_finish_concurrent_collect(&self, flags: CollectionFlags) -> bool {
        let state = self.state();
        if flags.contains(CollectionFlags::CONCURRENT) && self.ensure_background() {
            let heuristics = &self.config.heuristics;
            if state.is_concurrent_executing_state() {
                let elapsed = self
                    .heuristics
                    .lock()
                    .start_concurrent
                    .map_or(Duration::ZERO, |start| start.elapsed());
                if self.heap.uncollected_alloc_bytes()
                    > heuristics.uncollected_alloc_bytes_concurrent_priority_boost
                    || elapsed >= heuristics.priority_boost_timeout
                {
                    self.status.insert(StatusFlags::PRIORITY_BOOST);
                }
                let force = self.status.contains(StatusFlags::PRIORITY_BOOST)
                    && elapsed >= heuristics.priority_boost_timeout;
                if !force {
                    return self.finish_dispose_objects();
                }
                return self.finish_concurrent_collect_wrapped(
                    flags.union(CollectionFlags::FORCE_FINISH),
                );
            }
            if flags.contains(CollectionFlags::FINISH_CONCURRENT_TIMEOUT)
                && Instant::now() <= self.heuristics.lock().next_finish_collection
            {
                return self.finish_dispose_objects();
            }
        }
        self.finish_concurrent_collect_wrapped(flags)
    }

    fn finish_concurrent_collect_wrapped(&self, flags: CollectionFlags) -> bool {
        self.status
            .set(StatusFlags::ALLOW_DISPOSE, flags.contains(CollectionFlags::ALLOW_DISPOSE));
        self.status
            .set(StatusFlags::SKIP_STACK, flags.contains(CollectionFlags::SKIP_STACK));
        self.wrapper()
            .execute_recycler_collection_function(flags, &mut |flags| {
                self.finish_concurrent_collect(flags)
            })
    }

    fn finish_concurrent_collect(&self, flags: CollectionFlags) -> bool {
        if !self.collection_in_progress() {
            return false;
        }
        let finished = self.finish_concurrent_work(flags);
        if finished && !self.collection_in_progress() {
            if self.need_exhaustive_repeat_collect() {
                self.heuristics.lock().exhaustive_repeat_count += 1;
                self.do_collect(flags.difference(CollectionFlags::PARTIAL));
            } else {
                self.end_collection();
            }
        }
        finished
    }

    /// Waits for the background thread and runs the in-thread half of the
    /// current phase. Returns `false` when the wait or a background finish
    /// mark timed out; the collection is then still in flight.
    fn finish_concurrent_work(&self, flags: CollectionFlags) -> bool {
        let force = flags.intersects(
            CollectionFlags::FORCE_FINISH.union(CollectionFlags::FORCE_IN_THREAD),
        );
        let single_rescan_boost = self.status.contains(StatusFlags::PRIORITY_BOOST)
            && self.heuristics.lock().background_rescan_count == 1;
        let concurrent = flags.contains(CollectionFlags::CONCURRENT)
            && !flags.contains(CollectionFlags::FORCE_IN_THREAD)
            && !single_rescan_boost;
        let wait = if force {
            None
        } else if flags.intersects(
            CollectionFlags::FINISH_CONCURRENT.union(CollectionFlags::FINISH_CONCURRENT_TIMEOUT),
        ) {
            Some(self.config.heuristics.finish_concurrent_collect_wait_time)
        } else {
            Some(Duration::ZERO)
        };

        if !self.wait_for_concurrent_thread(wait) {
            return false;
        }

        let state = self.state();
        let need_concurrent_sweep = if state == CollectionState::RESCAN_WAIT {
            let background_finish =
                !force && concurrent && flags.contains(CollectionFlags::BACKGROUND_FINISH_MARK);
            if !self.finish_mark(background_finish) {
                return false;
            }
            self.sweep(concurrent)
        } else if state == CollectionState::TRANSFER_SWEPT_WAIT {
            self.set_state(CollectionState::TRANSFER_SWEPT);
            self.heap.transfer_swept();
            false
        } else {
            self.fatal(FatalError::InvalidState)
        };
        self.finish_collection(need_concurrent_sweep);
        true
    }

    /// Waits for the background thread to finish its current work.
    ///
    /// `None` waits without a timeout. A non-zero wait that expires raises
    /// the priority boost.
    pub(super) fn wait_for_concurrent_thread(&self, wait: Option<Duration>) -> bool {
        let blocking = wait != Some(Duration::ZERO);
        if blocking {
            self.wrapper().wait_collection_callback();
        }
        match self.work_done.wait_timeout(wait) {
            WaitOutcome::Signaled => true,
            WaitOutcome::TimedOut => {
                if blocking {
                    self.status.insert(StatusFlags::PRIORITY_BOOST);
                }
                false
            }
            WaitOutcome::PeerExited => self.fatal(FatalError::BackgroundThreadLost),
        }
    }

    /// Host entry point for finishing a concurrent collection at idle time,
    /// or when entering or leaving script.
    pub(super) fn finish_concurrent(&self, flags: CollectionFlags) -> bool {
        let _guard = self.collect_lock.lock();
        if !self.collection_in_progress() || self.state().is_callback_state() {
            return false;
        }
        let force = flags.contains(CollectionFlags::FORCE_FINISH);
        if !force && self.state().is_concurrent_executing_state() {
            return false;
        }
        let flags = if force {
            flags.difference(CollectionFlags::SKIP_STACK)
        } else {
            flags
        };
        self.finish_concurrent_collect_wrapped(flags)
    }

    pub(super) fn ensure_not_collecting(&self) {
        let _guard = self.collect_lock.lock();
        while self.collection_in_progress() && !self.state().is_callback_state() {
            if !self.finish_concurrent_collect_wrapped(FORCE_FINISH_COLLECTION) {
                break;
            }
        }
    }

    /// Stops the in-flight concurrent collection.
    ///
    /// Waits for the background thread to reach a rendezvous, then rolls the
    /// heap back to a consistent state. Without `restore` the background
    /// mark is asked to stop early.
    pub(super) fn abort_concurrent(&self, restore: bool) {
        let state = self.state();
        if !state.is_concurrent_state() {
            return;
        }
        self.status.insert(StatusFlags::IS_ABORTING);
        if !restore {
            self.abort_mark.store(true, Ordering::Release);
        }

        #[cfg(feature = "tracing")]
        crate::background::tracing::log_abort(restore, state);

        if self.work_done.wait() == WaitOutcome::Signaled {
            let state = self.state();
            if state.is_mark_state() {
                for ctx in &self.contexts {
                    ctx.lock().abort();
                }
                while self.tracked.pop().is_some() {}
                self.heap.clear_marks();
            } else if state == CollectionState::TRANSFER_SWEPT_WAIT {
                self.heap.transfer_swept();
            }
        }

        self.stack_snapshot.lock().clear();
        self.pinned.enable_resize();
        self.pinned.cleanup_pending_unroot();
        self.arenas.cleanup_pending_delete();
        self.status.remove(
            StatusFlags::IN_PARTIAL_COLLECT_MODE
                | StatusFlags::IS_ABORTING
                | StatusFlags::PRIORITY_BOOST
                | StatusFlags::HAS_PENDING_UNPINNED_OBJECT
                | StatusFlags::HAS_PENDING_CONCURRENT_FIND_ROOT
                | StatusFlags::HAS_PENDING_DELETE_GUEST_ARENA
                | StatusFlags::NEED_OOM_RESCAN,
        );
        self.abort_mark.store(false, Ordering::Release);
        {
            let mut heuristics = self.heuristics.lock();
            heuristics.background_rescan_count = 0;
            heuristics.background_finish_mark_count = 0;
            heuristics.start_concurrent = None;
        }
        self.with_stats(|stats| stats.kind = CollectionKind::None);
        self.set_state(CollectionState::NOT_COLLECTING);
        self.end_collection();
    }
}
