//! Reset, root finding and marking on the collecting thread.

use std::sync::atomic::Ordering;

use bitflags::bitflags;

use super::status::StatusFlags;
use super::{BeforeCollectCallback, RecyclerCore};
use crate::background::ParallelThread;
use crate::error::{FatalError, MarkOutcome};
use crate::event::WaitOutcome;
use crate::flags::CollectionFlags;
use crate::heap::ObjectInfoBits;
use crate::mark::{MarkCandidate, MarkContext, MarkEnv, RootMarker};
use crate::metrics::CollectionKind;
use crate::stack::capture_stack;
use crate::state::CollectionState;

#[cfg(feature = "tracing")]
use crate::tracing::internal::{trace_phase, Phase};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct ResetMarkFlags: u8 {
        const BACKGROUND = 1 << 0;
        const SCAN_IMPLICIT_ROOTS = 1 << 1;
        const RESET_WRITE_WATCH = 1 << 2;
    }
}

impl ResetMarkFlags {
    pub(super) fn for_config(core: &RecyclerCore, background: bool) -> Self {
        let mut flags = Self::RESET_WRITE_WATCH;
        flags.set(Self::BACKGROUND, background);
        flags.set(Self::SCAN_IMPLICIT_ROOTS, core.config.scan_implicit_roots);
        flags
    }
}

impl RecyclerCore {
    /// Clears every mark bit and re-arms root scanning.
    pub(super) fn reset_marks(&self, flags: ResetMarkFlags) {
        debug_assert!(self.contexts[0].lock().is_empty());
        self.set_state(if flags.contains(ResetMarkFlags::BACKGROUND) {
            CollectionState::CONCURRENT_RESET_MARKS
        } else {
            CollectionState::RESET_MARKS
        });
        self.with_stats(|stats| stats.phases.start());
        #[cfg(feature = "tracing")]
        let _phase = trace_phase(Phase::ResetMarks);

        if flags.contains(ResetMarkFlags::RESET_WRITE_WATCH) {
            self.heap.reset_write_watch();
        }
        self.heap.clear_marks();
        self.status.insert(StatusFlags::SCAN_PINNED_OBJECT_MAP);
        self.status.set(
            StatusFlags::SCAN_IMPLICIT_ROOTS,
            flags.contains(ResetMarkFlags::SCAN_IMPLICIT_ROOTS),
        );
        self.with_stats(|stats| stats.phases.end_reset_marks());
    }

    /// Marks the roots the recycler knows about, except the stack.
    pub(super) fn find_roots(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>, in_thread: bool) {
        if !self.status.contains(StatusFlags::IN_PARTIAL_COLLECT_MODE) {
            let marker = self.external_root_marker.read().clone();
            if let Some(marker) = marker {
                marker(&mut RootMarker::new(ctx, env));
            }
        }
        if in_thread {
            self.wrapper()
                .root_mark_callback(&mut RootMarker::new(ctx, env));
        }
        if self.status.take(StatusFlags::SCAN_PINNED_OBJECT_MAP) {
            ctx.scan_words(env, &self.pinned.roots());
        }
        ctx.scan_words(env, &self.arenas.root_words());
        if self.status.contains(StatusFlags::SCAN_IMPLICIT_ROOTS) {
            self.heap
                .for_each_with(ObjectInfoBits::IMPLICIT_ROOT, |obj, _| {
                    ctx.mark(env, obj);
                });
        }
    }

    pub(super) fn scan_stack(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        let words = capture_stack();
        ctx.scan_words(env, &words);
    }

    fn find_roots_in_thread(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        self.find_roots(ctx, env, true);
        if !self.status.contains(StatusFlags::SKIP_STACK) {
            self.scan_stack(ctx, env);
        }
    }

    /// Queues the marked objects on dirty pages. Returns `(pages, bytes)`.
    pub(super) fn rescan_dirty_pages(&self, ctx: &mut MarkContext) -> (usize, usize) {
        let mut bytes = 0;
        let pages = self.heap.rescan_dirty(true, |obj, size| {
            bytes += size;
            ctx.push(MarkCandidate { obj, size });
        });
        self.with_stats(|stats| {
            stats.rescan_pages += pages;
            stats.rescan_bytes += bytes;
        });
        (pages, bytes)
    }

    /// Scans tracked objects queued while marking in parallel.
    fn process_tracked_objects(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        if self.tracked.is_empty() {
            return;
        }
        while let Some(candidate) = self.tracked.pop() {
            ctx.push(candidate);
        }
        ctx.process_mark(env);
    }

    pub(super) fn process_mark_in_thread(
        &self,
        ctx: &mut MarkContext,
        env: &MarkEnv<'_>,
        allow_parallel: bool,
    ) -> MarkOutcome {
        if allow_parallel && self.status.contains(StatusFlags::ENABLE_PARALLEL_MARK) {
            self.parallel_mark(ctx, true);
        }
        ctx.process_mark(env)
    }

    /// Shares the work in `ctx` with the helper threads and marks until all
    /// of it is done.
    ///
    /// `in_thread` is `false` when called from the background thread, which
    /// then only enlists the parallel threads. Returns `false` when nothing
    /// was shared.
    pub(super) fn parallel_mark(&self, ctx: &mut MarkContext, in_thread: bool) -> bool {
        let mut threads = self.parallel.lock();
        self.ensure_parallel_threads(&mut threads);

        let use_background = in_thread && self.ensure_background();
        let mut helpers: Vec<usize> = Vec::with_capacity(3);
        if use_background {
            helpers.push(1);
        }
        helpers.extend(threads.iter().map(|thread| thread.index() + 2));
        if helpers.is_empty() {
            return false;
        }

        {
            let mut guards: Vec<_> = helpers.iter().map(|&i| self.contexts[i].lock()).collect();
            let mut others: Vec<&mut MarkContext> = guards.iter_mut().map(|g| &mut **g).collect();
            if !ctx.split(&mut others) {
                return false;
            }
        }

        self.status.insert(StatusFlags::QUEUE_TRACKED_OBJECT);
        let previous = self.state();
        self.set_state(if in_thread {
            CollectionState::PARALLEL_MARK
        } else {
            CollectionState::BACKGROUND_PARALLEL_MARK
        });

        let background_dispatched = use_background && self.dispatch_background();
        for thread in threads.iter() {
            thread.signal();
        }

        let env = self.mark_env(true);
        let outcome = ctx.process_mark(&env);

        if background_dispatched && self.work_done.wait() == WaitOutcome::PeerExited {
            self.background_failed.store(true, Ordering::Release);
        }
        for thread in threads.iter() {
            if thread.wait(None) == WaitOutcome::PeerExited {
                self.parallel_failed.store(true, Ordering::Release);
            }
        }

        let aborted = outcome == MarkOutcome::Aborted || self.abort_mark.load(Ordering::Acquire);
        for &index in &helpers {
            let mut helper = self.contexts[index].lock();
            if !aborted {
                helper.process_mark(&env);
            }
            ctx.merge_stats(&mut helper);
        }

        self.status.remove(StatusFlags::QUEUE_TRACKED_OBJECT);
        self.set_state(previous);
        true
    }

    fn ensure_parallel_threads(&self, threads: &mut Vec<ParallelThread>) {
        if self.parallel_failed.load(Ordering::Acquire) {
            return;
        }
        while threads.len() < self.config.parallel_thread_count() {
            let index = threads.len();
            let core = self.this.clone();
            let spawned = ParallelThread::spawn(index, move || {
                core.upgrade()
                    .is_some_and(|core| core.parallel_work(index + 2))
            });
            match spawned {
                Ok(thread) => threads.push(thread),
                Err(_err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %_err, "parallel mark thread unavailable");
                    self.parallel_failed.store(true, Ordering::Release);
                    break;
                }
            }
        }
    }

    /// Body of a parallel mark thread. Returns `false` once the recycler exits.
    fn parallel_work(&self, ctx_index: usize) -> bool {
        if self.state() == CollectionState::EXIT {
            return false;
        }
        let env = self.mark_env(true);
        self.contexts[ctx_index].lock().process_mark(&env);
        true
    }

    /// Mark and sweep entirely on the calling thread.
    pub(super) fn collect_on_allocator_thread(&self, flags: CollectionFlags) -> bool {
        self.reset_marks(ResetMarkFlags::for_config(self, false));
        self.with_stats(|stats| stats.kind = CollectionKind::InThread);
        let env = self.mark_env(false);
        {
            let mut ctx = self.contexts[0].lock();

            self.set_state(CollectionState::FIND_ROOTS);
            self.with_stats(|stats| stats.phases.start());
            {
                #[cfg(feature = "tracing")]
                let _phase = trace_phase(Phase::FindRoots);
                self.find_roots_in_thread(&mut ctx, &env);
            }
            self.with_stats(|stats| stats.phases.end_find_roots());

            self.set_state(CollectionState::MARK);
            self.with_stats(|stats| stats.phases.start());
            {
                #[cfg(feature = "tracing")]
                let _phase = trace_phase(Phase::Mark);
                self.process_mark_in_thread(&mut ctx, &env, true);
                self.process_tracked_objects(&mut ctx, &env);
                self.end_mark(&mut ctx, &env);
            }
            self.with_stats(|stats| stats.phases.end_mark());
        }

        let need_concurrent_sweep = self.sweep(
            flags.contains(CollectionFlags::CONCURRENT)
                && !flags.contains(CollectionFlags::FORCE_IN_THREAD),
        );
        self.finish_collection(need_concurrent_sweep);
        true
    }

    /// Completes a concurrent mark.
    ///
    /// With `background_finish` one more rescan is first given to the
    /// background thread. Returns `false` if that rescan did not finish in
    /// time; the collection then stays in flight.
    pub(super) fn finish_mark(&self, background_finish: bool) -> bool {
        if background_finish && self.try_background_finish_mark() == Some(false) {
            return false;
        }

        self.wrapper().pre_rescan_mark_callback();
        let env = self.mark_env(false);
        {
            let mut ctx = self.contexts[0].lock();
            self.set_state(CollectionState::RESCAN_FIND_ROOTS);
            self.with_stats(|stats| stats.phases.start());
            self.find_roots_in_thread(&mut ctx, &env);
            self.with_stats(|stats| stats.phases.end_find_roots());

            self.set_state(CollectionState::RESCAN_MARK);
            self.with_stats(|stats| stats.phases.start());
            {
                #[cfg(feature = "tracing")]
                let _phase = trace_phase(Phase::Rescan);
                self.rescan_dirty_pages(&mut ctx);
                self.process_mark_in_thread(&mut ctx, &env, true);
                self.process_tracked_objects(&mut ctx, &env);
                self.end_mark(&mut ctx, &env);
            }
            self.with_stats(|stats| stats.phases.end_mark());
        }

        self.pinned.enable_resize();
        self.pinned.cleanup_pending_unroot();
        self.status.remove(
            StatusFlags::HAS_PENDING_UNPINNED_OBJECT
                | StatusFlags::HAS_PENDING_CONCURRENT_FIND_ROOT,
        );
        self.arenas.cleanup_pending_delete();
        self.status
            .remove(StatusFlags::HAS_PENDING_DELETE_GUEST_ARENA);
        true
    }

    /// `None` when no background rescan ran, otherwise whether it finished
    /// within the wait.
    fn try_background_finish_mark(&self) -> Option<bool> {
        let heuristics = &self.config.heuristics;
        {
            let mut state = self.heuristics.lock();
            if state.background_finish_mark_count >= heuristics.max_background_finish_mark_count {
                return None;
            }
            state.background_finish_mark_count += 1;
        }
        self.set_state(CollectionState::CONCURRENT_FINISH_MARK);
        if !self.dispatch_background() {
            self.set_state(CollectionState::RESCAN_WAIT);
            return None;
        }
        match self
            .work_done
            .wait_timeout(Some(heuristics.background_finish_mark_wait_time))
        {
            WaitOutcome::Signaled => Some(true),
            WaitOutcome::TimedOut => {
                self.wrapper().rescan_mark_timeout_callback();
                Some(false)
            }
            WaitOutcome::PeerExited => self.fatal(FatalError::BackgroundThreadLost),
        }
    }

    /// Runs after the mark stacks drained: recovers from stack overflow,
    /// fires before-collect callbacks and folds the mark counters into the
    /// cycle statistics.
    pub(super) fn end_mark(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        if ctx.need_oom_rescan() || self.helpers_need_oom_rescan() {
            self.status.insert(StatusFlags::NEED_OOM_RESCAN);
        }
        if self.status.contains(StatusFlags::NEED_OOM_RESCAN) {
            self.end_mark_on_low_memory(ctx, env);
        }
        self.process_before_collect_callbacks(ctx, env);

        let (objects, bytes, _scanned) = ctx.take_stats();
        self.with_stats(|stats| {
            stats.marked_objects += objects;
            stats.marked_bytes += bytes;
        });
        self.wrapper().end_mark_callback();
    }

    fn helpers_need_oom_rescan(&self) -> bool {
        self.contexts[1..]
            .iter()
            .any(|helper| helper.lock().need_oom_rescan())
    }

    fn marked_object_count(&self) -> usize {
        let mut count = 0;
        self.heap.for_each_block(|block| count += block.marked_count());
        count
    }

    /// Rescans from the roots and every marked object, one object at a
    /// time, until a pass no longer overflows a mark stack.
    fn end_mark_on_low_memory(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        self.heap.decommit_now();
        self.mark_pages.decommit_now();
        for helper in &self.contexts[1..] {
            helper.lock().clear_oom();
        }

        let mut passes = 0;
        loop {
            passes += 1;
            ctx.clear_oom();
            let before = self.marked_object_count();

            self.status.insert(StatusFlags::SCAN_PINNED_OBJECT_MAP);
            self.find_roots_in_thread(ctx, env);
            ctx.process_mark(env);
            self.heap.for_each_block(|block| {
                block.for_each_marked(|obj, size| {
                    ctx.push(MarkCandidate { obj, size });
                    ctx.process_mark(env);
                });
            });

            if !ctx.need_oom_rescan() {
                break;
            }
            if self.marked_object_count() == before {
                self.fatal(FatalError::MarkStackOom);
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(passes, "oom_rescan");
        self.with_stats(|stats| stats.oom_rescan_passes += passes);
        self.status.remove(StatusFlags::NEED_OOM_RESCAN);
    }

    /// Fires the callbacks of objects found unreachable. Each such object
    /// is then marked, with everything it references, for this cycle.
    fn process_before_collect_callbacks(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        loop {
            let due: Vec<(usize, BeforeCollectCallback)> = {
                let mut callbacks = self.before_collect.lock();
                if callbacks.is_empty() {
                    return;
                }
                let unmarked: Vec<usize> = callbacks
                    .keys()
                    .copied()
                    .filter(|&obj| {
                        self.heap
                            .find_object(obj, false)
                            .is_none_or(|info| !info.marked)
                    })
                    .collect();
                unmarked
                    .into_iter()
                    .filter_map(|obj| callbacks.remove(&obj).map(|callback| (obj, callback)))
                    .filter(|&(obj, _)| self.heap.is_valid_object(obj))
                    .collect()
            };
            if due.is_empty() {
                return;
            }
            for (obj, callback) in due {
                callback(obj);
                ctx.mark(env, obj);
            }
            if ctx.process_mark(env) == MarkOutcome::OutOfMemory {
                self.end_mark_on_low_memory(ctx, env);
            }
        }
    }
}
