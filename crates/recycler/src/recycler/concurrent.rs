//! Work handed to the background thread.
//!
//! The mutator moves the recycler into a concurrent state and signals the
//! background thread, either the dedicated one or a task on the host's
//! [`ThreadService`](crate::background::ThreadService). The background thread
//! reads the state to find out what to do, runs the phase, moves the state
//! to the matching wait state and signals `work_done`.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Instant;

use super::mark::ResetMarkFlags;
use super::status::StatusFlags;
use super::RecyclerCore;
use crate::background::spawn_collector_thread;
use crate::event::{Event, WaitOutcome};
use crate::flags::CollectionFlags;
use crate::mark::{MarkContext, MarkEnv};
use crate::metrics::CollectionKind;
use crate::stack::capture_stack;
use crate::state::CollectionState;

#[cfg(feature = "tracing")]
use crate::background::tracing::{
    log_fallback, log_repeat_mark, span_background_mark, span_concurrent_sweep, span_repeat_mark,
};

const BACKGROUND_THREAD_NAME: &str = "recycler-background";

fn background_thread_main(weak: &Weak<RecyclerCore>, ready: &Event, done: &Event) {
    loop {
        let idle_wait = match weak.upgrade() {
            Some(core) => core.heap.idle_decommit_wait(),
            None => return,
        };
        let outcome = ready.wait_timeout(idle_wait);
        let Some(core) = weak.upgrade() else {
            return;
        };
        match outcome {
            WaitOutcome::Signaled => {}
            WaitOutcome::TimedOut => {
                core.heap.idle_decommit();
                continue;
            }
            WaitOutcome::PeerExited => return,
        }
        if core.state() == CollectionState::EXIT {
            return;
        }
        core.do_background_work();
        drop(core);
        done.set();
    }
}

impl RecyclerCore {
    /// Whether background work can be dispatched, starting the dedicated
    /// thread if needed.
    pub(super) fn ensure_background(&self) -> bool {
        self.config.background_enabled()
            && (self.thread_service.read().is_some() || self.ensure_background_thread())
    }

    fn ensure_background_thread(&self) -> bool {
        if self.background_failed.load(Ordering::Acquire) {
            return false;
        }
        let mut background = self.background.lock();
        if background.is_some() {
            return true;
        }
        if self.status.contains(StatusFlags::IS_SHUTTING_DOWN) {
            return false;
        }
        let core = self.this.clone();
        let ready = Arc::clone(&self.work_ready);
        let done = Arc::clone(&self.work_done);
        let spawned = spawn_collector_thread(
            BACKGROUND_THREAD_NAME.to_owned(),
            Arc::clone(&self.work_done),
            move || background_thread_main(&core, &ready, &done),
        );
        match spawned {
            Ok(handle) => {
                *background = Some(handle);
                true
            }
            Err(_err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_err, "background thread unavailable");
                self.background_failed.store(true, Ordering::Release);
                false
            }
        }
    }

    /// Hands the current state's work to the background. The thread service
    /// gets the first chance.
    pub(super) fn dispatch_background(&self) -> bool {
        let service = self.thread_service.read().clone();
        if let Some(service) = service {
            let core = self.this.clone();
            let done = Arc::clone(&self.work_done);
            let accepted = service.invoke(Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.do_background_work();
                }
                done.set();
            }));
            if accepted {
                return true;
            }
            #[cfg(feature = "tracing")]
            log_fallback("thread service refused background work");
        }
        if self.ensure_background_thread() {
            self.work_ready.set();
            return true;
        }
        false
    }

    fn do_background_work(&self) {
        let state = self.state();
        if state == CollectionState::CONCURRENT_RESET_MARKS {
            self.background_mark_collect();
        } else if state == CollectionState::CONCURRENT_FINISH_MARK {
            self.background_finish_mark();
        } else if state == CollectionState::PARALLEL_MARK {
            let env = self.mark_env(true);
            self.contexts[1].lock().process_mark(&env);
        } else if state == CollectionState::CONCURRENT_SWEEP {
            self.background_sweep();
        }
    }

    fn background_process_mark(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        if self.status.contains(StatusFlags::ENABLE_PARALLEL_MARK) {
            self.parallel_mark(ctx, false);
        }
        ctx.process_mark(env);
    }

    fn background_mark_collect(&self) {
        #[cfg(feature = "tracing")]
        let _span = span_background_mark(false).entered();

        self.reset_marks(ResetMarkFlags::for_config(self, true));
        let env = self.mark_env(false);
        {
            let mut ctx = self.contexts[0].lock();
            self.set_state(CollectionState::CONCURRENT_FIND_ROOTS);
            self.with_stats(|stats| stats.phases.start());
            self.find_roots(&mut ctx, &env, false);
            let snapshot = std::mem::take(&mut *self.stack_snapshot.lock());
            ctx.scan_words(&env, &snapshot);
            self.with_stats(|stats| stats.phases.end_find_roots());

            self.set_state(CollectionState::CONCURRENT_MARK);
            self.with_stats(|stats| stats.phases.start());
            self.background_process_mark(&mut ctx, &env);
            if !self.abort_mark.load(Ordering::Acquire) {
                self.background_repeat_mark(&mut ctx, &env);
            }
            self.with_stats(|stats| stats.phases.end_mark());
        }

        self.with_callback_state(
            CollectionState::CONCURRENT_WRAPPER_CALLBACK,
            CollectionState::RESCAN_WAIT,
            |wrapper| wrapper.concurrent_callback(),
        );
    }

    /// Rescans dirty pages while the mutator keeps writing, so less is left
    /// for the in-thread finish.
    fn background_repeat_mark(&self, ctx: &mut MarkContext, env: &MarkEnv<'_>) {
        let heuristics = &self.config.heuristics;
        let mut passes = 0;
        while passes < heuristics.max_background_repeat_mark_count
            && !self.abort_mark.load(Ordering::Acquire)
        {
            #[cfg(feature = "tracing")]
            let _span = span_repeat_mark(passes).entered();

            let (pages, bytes) = self.rescan_dirty_pages(ctx);
            self.background_process_mark(ctx, env);
            passes += 1;
            self.with_stats(|stats| stats.background_repeat_marks += 1);
            #[cfg(feature = "tracing")]
            log_repeat_mark(bytes, pages);

            if bytes < heuristics.min_background_repeat_mark_rescan_bytes
                || (passes == 1 && pages < heuristics.background_second_repeat_mark_threshold)
            {
                break;
            }
        }
        self.heuristics.lock().background_rescan_count = passes;
    }

    fn background_finish_mark(&self) {
        let env = self.mark_env(false);
        {
            let mut ctx = self.contexts[0].lock();
            self.rescan_dirty_pages(&mut ctx);
            self.background_process_mark(&mut ctx, &env);
        }
        self.set_state(CollectionState::RESCAN_WAIT);
    }

    fn background_sweep(&self) {
        #[cfg(feature = "tracing")]
        let _span = span_concurrent_sweep().entered();

        let counts = self.heap.background_sweep();
        self.with_stats(|stats| {
            stats.swept_objects += counts.objects;
            stats.swept_bytes += counts.bytes;
        });
        self.set_state(CollectionState::TRANSFER_SWEPT_WAIT);
    }

    /// Starts a mark on the background thread and returns at once.
    pub(super) fn start_background_mark_collect(&self, flags: CollectionFlags) -> bool {
        if !self.status.contains(StatusFlags::ENABLE_CONCURRENT_MARK) || !self.ensure_background()
        {
            return false;
        }
        if !flags.contains(CollectionFlags::SKIP_STACK) {
            *self.stack_snapshot.lock() = capture_stack();
        }
        self.pinned.disable_resize();
        self.status
            .insert(StatusFlags::HAS_PENDING_CONCURRENT_FIND_ROOT);
        {
            let now = Instant::now();
            let mut heuristics = self.heuristics.lock();
            heuristics.start_concurrent = Some(now);
            heuristics.next_finish_collection =
                now + self.config.heuristics.tick_count_finish_collection;
            heuristics.background_rescan_count = 0;
        }
        self.with_stats(|stats| stats.kind = CollectionKind::Concurrent);
        self.set_state(CollectionState::CONCURRENT_RESET_MARKS);

        if self.dispatch_background() {
            return true;
        }

        #[cfg(feature = "tracing")]
        log_fallback("background mark not dispatched");
        self.set_state(CollectionState::NOT_COLLECTING);
        self.pinned.enable_resize();
        self.pinned.cleanup_pending_unroot();
        self.status
            .remove(StatusFlags::HAS_PENDING_CONCURRENT_FIND_ROOT);
        self.stack_snapshot.lock().clear();
        false
    }

    /// Marks in thread and leaves the free pass to the background thread.
    pub(super) fn start_concurrent_sweep_collect(&self, flags: CollectionFlags) -> bool {
        if !self.status.contains(StatusFlags::ENABLE_CONCURRENT_SWEEP) || !self.ensure_background()
        {
            return false;
        }
        self.collect_on_allocator_thread(flags)
    }

    /// Stops the background and parallel threads. The state must be `EXIT`.
    pub(super) fn stop_threads(&self) {
        debug_assert_eq!(self.state(), CollectionState::EXIT);
        self.work_ready.set();
        let background = self.background.lock().take();
        if let Some(handle) = background {
            let _ = handle.join();
        }
        let threads = std::mem::take(&mut *self.parallel.lock());
        for mut thread in threads {
            thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::background::ThreadService;
    use crate::config::RecyclerConfig;
    use crate::flags::{
        COLLECT_NOW_CONCURRENT, COLLECT_NOW_FORCE_IN_THREAD, FORCE_FINISH_COLLECTION,
    };
    use crate::Recycler;

    fn concurrent_config() -> RecyclerConfig {
        RecyclerConfig::new()
            .set_collect_on_allocation(false)
            .set_parallel_mark(false)
    }

    #[test]
    fn test_background_mark_keeps_rooted_objects() {
        let recycler = Recycler::new(concurrent_config());
        let root = recycler.alloc_zero(32);
        let child = recycler.alloc_zero(16);
        recycler.store(root, 0, child).unwrap();
        recycler.root_add_ref(root);

        assert!(recycler.collect_now(COLLECT_NOW_CONCURRENT.union(CollectionFlags::SKIP_STACK)));
        recycler.ensure_not_collecting();
        assert!(!recycler.collection_in_progress());
        assert!(recycler.is_valid_object(root));
        assert!(recycler.is_valid_object(child));
        assert_eq!(recycler.collection_count(), 1);
        let stats = recycler.last_collection_stats().unwrap();
        assert_eq!(stats.kind, CollectionKind::Concurrent);
    }

    #[test]
    fn test_store_during_background_mark_is_rescanned() {
        let recycler = Recycler::new(concurrent_config());
        let root = recycler.alloc_zero(32);
        recycler.root_add_ref(root);

        assert!(recycler.collect_now(COLLECT_NOW_CONCURRENT.union(CollectionFlags::SKIP_STACK)));
        let late = recycler.alloc_zero(16);
        recycler.store(root, 1, late).unwrap();
        assert!(
            recycler.finish_concurrent(FORCE_FINISH_COLLECTION)
                || !recycler.collection_in_progress()
        );
        recycler.ensure_not_collecting();
        assert!(recycler.is_valid_object(late));
    }

    struct InlineService {
        invoked: AtomicUsize,
    }

    impl ThreadService for InlineService {
        fn invoke(&self, work: Box<dyn FnOnce() + Send>) -> bool {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            std::thread::spawn(work);
            true
        }
    }

    #[test]
    fn test_thread_service_runs_background_work() {
        let recycler = Recycler::new(concurrent_config());
        let service = Arc::new(InlineService {
            invoked: AtomicUsize::new(0),
        });
        recycler.set_thread_service(Some(service.clone()));
        let root = recycler.alloc_zero(32);
        recycler.root_add_ref(root);

        assert!(recycler.collect_now(COLLECT_NOW_CONCURRENT.union(CollectionFlags::SKIP_STACK)));
        recycler.ensure_not_collecting();
        assert!(service.invoked.load(Ordering::SeqCst) >= 1);
        assert!(recycler.is_valid_object(root));
        assert!(recycler.core.background.lock().is_none());
    }

    #[test]
    fn test_abort_rolls_back_to_not_collecting() {
        let recycler = Recycler::new(concurrent_config());
        let root = recycler.alloc_zero(32);
        recycler.root_add_ref(root);
        assert!(recycler.collect_now(COLLECT_NOW_CONCURRENT.union(CollectionFlags::SKIP_STACK)));
        recycler.core.abort_concurrent(false);
        assert_eq!(recycler.collection_state(), CollectionState::NOT_COLLECTING);
        assert!(recycler.is_valid_object(root));
        assert_eq!(recycler.collection_count(), 0);

        assert!(
            recycler.collect_now(COLLECT_NOW_FORCE_IN_THREAD.union(CollectionFlags::SKIP_STACK))
        );
        assert_eq!(recycler.collection_count(), 1);
    }

    #[test]
    fn test_idle_background_thread_stops_on_drop() {
        let recycler = Recycler::new(concurrent_config());
        assert!(recycler.core.ensure_background());
        std::thread::sleep(Duration::from_millis(5));
        drop(recycler);
    }
}
