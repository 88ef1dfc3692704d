//! The recycler: one garbage-collected heap and the collector driving it.
//!
//! A [`Recycler`] owns its heap, its mark contexts and its collector threads.
//! Collections run through a state machine (see [`CollectionState`]) that can
//! be driven entirely on the calling thread, or split between the calling
//! thread, a background thread and up to two parallel mark threads.
//!
//! The submodules hold the phases:
//!
//! - `collect`: triggers, heuristics and the finish/abort paths
//! - `mark`: reset, root finding, in-thread and parallel marking
//! - `sweep`: sweep, partial mode, dispose and the end of a cycle
//! - `concurrent`: background thread dispatch and the background phases

mod collect;
mod concurrent;
mod mark;
mod status;
mod sweep;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam::utils::CachePadded;
use crossbeam_queue::SegQueue;
use parking_lot::{Mutex, ReentrantMutex, RwLock};

use crate::arena::{GuestArena, GuestArenas};
use crate::background::{ParallelThread, ThreadService};
use crate::config::RecyclerConfig;
use crate::error::{fatal_error, FatalError, GcError};
use crate::event::Event;
use crate::flags::{
    CollectionFlags, COLLECT_EXHAUSTIVE_CANDIDATE, COLLECT_ON_ALLOCATION,
    COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY,
};
use crate::heap::{size_class, Finalizer, HeapInfo, HeapObjectInfo, ObjectInfoBits};
use crate::mark::{MarkCandidate, MarkContext, MarkEnv, RootMarker, MARK_CONTEXT_COUNT};
use crate::metrics::CollectionStats;
use crate::page::PageAllocator;
use crate::pin::{PinnedObject, PinnedObjectMap};
use crate::registry;
use crate::state::CollectionState;
use crate::weak::WeakReferenceMap;
use crate::wrapper::{CollectionWrapper, DefaultCollectionWrapper};

use status::{AtomicStatus, StatusFlags};

const WORD: usize = std::mem::size_of::<usize>();

/// Callback run once for an object that is about to be collected.
pub type BeforeCollectCallback = Box<dyn FnOnce(usize) + Send>;

/// Host function that marks roots the recycler cannot see.
pub type ExternalRootMarker = Arc<dyn Fn(&mut RootMarker<'_, '_>) + Send + Sync>;

/// Host function invoked before the process aborts on out of memory.
pub type OutOfMemoryCallback = Arc<dyn Fn() + Send + Sync>;

/// Timing and counters that steer the heuristics.
#[derive(Debug)]
struct HeuristicState {
    next_collection: Instant,
    next_finish_collection: Instant,
    next_dispose: Instant,
    start_concurrent: Option<Instant>,
    collection_start: Option<Instant>,
    partial_new_page_threshold: usize,
    background_rescan_count: usize,
    background_finish_mark_count: usize,
    exhaustive_repeat_count: usize,
    idle_decommit_suspended: bool,
}

impl HeuristicState {
    fn new(config: &RecyclerConfig) -> Self {
        let now = Instant::now();
        Self {
            next_collection: now,
            next_finish_collection: now,
            next_dispose: now,
            start_concurrent: None,
            collection_start: None,
            partial_new_page_threshold: config.heuristics.min_partial_uncollected_new_page_count,
            background_rescan_count: 0,
            background_finish_mark_count: 0,
            exhaustive_repeat_count: 0,
            idle_decommit_suspended: false,
        }
    }
}

/// State shared between the [`Recycler`] handle and the collector threads.
pub(crate) struct RecyclerCore {
    this: Weak<Self>,
    config: RecyclerConfig,
    heap: HeapInfo,
    mark_pages: Arc<PageAllocator>,
    state: AtomicU32,
    status: AtomicStatus,
    /// Serializes collection requests of the mutator. Reentrant so host
    /// callbacks may call back into the recycler.
    collect_lock: ReentrantMutex<()>,
    /// Context 0 belongs to the marking thread, 1 to the background thread
    /// while it helps an in-thread mark, 2 and 3 to the parallel threads.
    contexts: [CachePadded<Mutex<MarkContext>>; MARK_CONTEXT_COUNT],
    tracked: SegQueue<MarkCandidate>,
    abort_mark: AtomicBool,
    pinned: PinnedObjectMap,
    weak: WeakReferenceMap,
    before_collect: Mutex<HashMap<usize, BeforeCollectCallback>>,
    arenas: GuestArenas,
    stack_snapshot: Mutex<Vec<usize>>,
    external_root_marker: RwLock<Option<ExternalRootMarker>>,
    wrapper: RwLock<Arc<dyn CollectionWrapper>>,
    thread_service: RwLock<Option<Arc<dyn ThreadService>>>,
    out_of_memory: RwLock<Option<OutOfMemoryCallback>>,
    background: Mutex<Option<JoinHandle<()>>>,
    background_failed: AtomicBool,
    work_ready: Arc<Event>,
    work_done: Arc<Event>,
    parallel: Mutex<Vec<ParallelThread>>,
    parallel_failed: AtomicBool,
    heuristics: Mutex<HeuristicState>,
    stats: Mutex<CollectionStats>,
    last_stats: Mutex<Option<CollectionStats>>,
    collection_count: AtomicUsize,
}

impl std::fmt::Debug for RecyclerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecyclerCore")
            .field("state", &self.state())
            .field("status", &self.status.load())
            .field("heap", &self.heap)
            .finish_non_exhaustive()
    }
}

impl RecyclerCore {
    fn new(config: RecyclerConfig) -> Arc<Self> {
        let mark_pages = Arc::new(PageAllocator::new("mark", config.mark_stack_page_limit));
        let mut status = StatusFlags::empty();
        status.set(
            StatusFlags::ENABLE_CONCURRENT_MARK,
            config.concurrent_mark && !config.force_in_thread,
        );
        status.set(StatusFlags::ENABLE_PARALLEL_MARK, config.parallel_mark);
        status.set(
            StatusFlags::ENABLE_CONCURRENT_SWEEP,
            config.concurrent_sweep && !config.force_in_thread,
        );
        status.set(StatusFlags::ENABLE_PARTIAL_COLLECT, config.partial_collect);

        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            heap: HeapInfo::new(&config.heuristics),
            contexts: std::array::from_fn(|_| {
                CachePadded::new(Mutex::new(MarkContext::new(Arc::clone(&mark_pages))))
            }),
            mark_pages,
            state: AtomicU32::new(CollectionState::NOT_COLLECTING.bits()),
            status: AtomicStatus::new(status),
            collect_lock: ReentrantMutex::new(()),
            tracked: SegQueue::new(),
            abort_mark: AtomicBool::new(false),
            pinned: PinnedObjectMap::new(config.track_pinned_stacks),
            weak: WeakReferenceMap::new(),
            before_collect: Mutex::new(HashMap::new()),
            arenas: GuestArenas::new(),
            stack_snapshot: Mutex::new(Vec::new()),
            external_root_marker: RwLock::new(None),
            wrapper: RwLock::new(Arc::new(DefaultCollectionWrapper)),
            thread_service: RwLock::new(None),
            out_of_memory: RwLock::new(None),
            background: Mutex::new(None),
            background_failed: AtomicBool::new(false),
            work_ready: Arc::new(Event::auto_reset()),
            work_done: Arc::new(Event::auto_reset()),
            parallel: Mutex::new(Vec::new()),
            parallel_failed: AtomicBool::new(false),
            heuristics: Mutex::new(HeuristicState::new(&config)),
            stats: Mutex::new(CollectionStats::default()),
            last_stats: Mutex::new(None),
            collection_count: AtomicUsize::new(0),
            config,
        })
    }

    fn state(&self) -> CollectionState {
        CollectionState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CollectionState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    fn collection_in_progress(&self) -> bool {
        let state = self.state();
        state != CollectionState::NOT_COLLECTING && state != CollectionState::EXIT
    }

    fn mark_env(&self, queue_tracked: bool) -> MarkEnv<'_> {
        MarkEnv {
            heap: &self.heap,
            tracked: &self.tracked,
            queue_tracked,
            interior: self.config.interior_pointers,
            abort: &self.abort_mark,
        }
    }

    fn wrapper(&self) -> Arc<dyn CollectionWrapper> {
        Arc::clone(&self.wrapper.read())
    }

    /// Runs a host callback in `entry`, leaving the recycler in `exit`.
    fn with_callback_state(
        &self,
        entry: CollectionState,
        exit: CollectionState,
        callback: impl FnOnce(&dyn CollectionWrapper),
    ) {
        self.set_state(entry);
        callback(&*self.wrapper());
        self.set_state(exit);
    }

    fn with_stats(&self, update: impl FnOnce(&mut CollectionStats)) {
        update(&mut self.stats.lock());
    }

    fn fatal(&self, kind: FatalError) -> ! {
        let callback = self.out_of_memory.read().clone();
        fatal_error(kind, callback.as_deref())
    }

    fn need_oom_rescan(&self) -> bool {
        self.status.contains(StatusFlags::NEED_OOM_RESCAN)
            || self
                .contexts
                .iter()
                .any(|ctx| ctx.try_lock().is_some_and(|ctx| ctx.need_oom_rescan()))
    }

    fn alloc(
        &self,
        size: usize,
        bits: ObjectInfoBits,
        finalizer: Option<&Arc<dyn Finalizer>>,
    ) -> Result<usize, GcError> {
        if self.status.contains(StatusFlags::IS_SHUTTING_DOWN) {
            return Err(GcError::Shutdown);
        }
        self.collect_on_allocation();
        let attempt = || match finalizer {
            Some(finalizer) => self.heap.alloc_finalizable(size, bits, Arc::clone(finalizer)),
            None => self.heap.alloc(size, bits),
        };
        match attempt() {
            Err(GcError::OutOfMemory { .. } | GcError::PageAllocation(_)) => {
                self.collect_now(COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY);
                attempt()
            }
            result => result,
        }
    }

    fn collect_on_allocation(&self) {
        if self.config.collect_on_allocation
            && self.heap.uncollected_alloc_bytes()
                >= self.config.heuristics.uncollected_alloc_bytes_collection
        {
            self.collect_now(COLLECT_ON_ALLOCATION);
        }
    }

    fn set_before_collect_callback(
        &self,
        obj: usize,
        callback: Option<BeforeCollectCallback>,
    ) -> Result<(), GcError> {
        if !self.heap.is_valid_object(obj) {
            return Err(GcError::InvalidObject(obj));
        }
        let mut callbacks = self.before_collect.lock();
        match callback {
            Some(callback) => {
                callbacks.insert(obj, callback);
            }
            None => {
                callbacks.remove(&obj);
            }
        }
        Ok(())
    }

    fn delete_guest_arena(&self, arena: &Arc<GuestArena>) -> bool {
        let _guard = self.collect_lock.lock();
        let defer = self.collection_in_progress();
        let deleted = self.arenas.delete(arena, defer);
        if deleted && defer {
            self.status.insert(StatusFlags::HAS_PENDING_DELETE_GUEST_ARENA);
        }
        deleted
    }

    /// Decommits the free pages of an idle recycler. Used under memory pressure.
    pub(crate) fn decommit_if_idle(&self) -> usize {
        let Some(_guard) = self.collect_lock.try_lock() else {
            return 0;
        };
        if self.collection_in_progress() || self.status.contains(StatusFlags::IS_SHUTTING_DOWN) {
            return 0;
        }
        self.heap.decommit_now() + self.mark_pages.decommit_now()
    }

    fn shutdown(&self) {
        let _guard = self.collect_lock.lock();
        if self.status.contains(StatusFlags::IS_SHUTTING_DOWN) {
            return;
        }
        self.status.insert(StatusFlags::IS_SHUTTING_DOWN);
        if self.collection_in_progress() {
            self.abort_concurrent(true);
        }
        self.set_state(CollectionState::EXIT);
        self.stop_threads();
        self.heap.shutdown_finalize();
        registry::unregister(self);
    }
}

/// A garbage-collected heap with a concurrent, partial, conservative
/// mark-and-sweep collector.
///
/// Objects are plain word arrays addressed by `usize`. Every word of a
/// scanned object, every pinned object, every guest arena word and every
/// word on the mutator's stack is treated as a potential pointer.
///
/// # Example
///
/// ```
/// use recycler::{Recycler, RecyclerConfig, ObjectInfoBits};
/// use recycler::flags::COLLECT_NOW_EXHAUSTIVE_SKIP_STACK;
///
/// let recycler = Recycler::new(RecyclerConfig::in_thread().set_collect_on_allocation(false));
/// let root = recycler.alloc(32, ObjectInfoBits::empty());
/// let child = recycler.alloc_leaf(16);
/// recycler.store(root, 0, child).unwrap();
/// recycler.root_add_ref(root);
///
/// recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK);
/// assert!(recycler.is_valid_object(child));
/// ```
#[derive(Debug)]
pub struct Recycler {
    core: Arc<RecyclerCore>,
}

impl Recycler {
    /// Creates a recycler and registers it in the process-wide registry.
    ///
    /// Collector threads are started lazily on the first collection that
    /// needs them.
    #[must_use]
    pub fn new(config: RecyclerConfig) -> Self {
        let core = RecyclerCore::new(config);
        registry::register(&core);
        Self { core }
    }

    #[must_use]
    pub fn config(&self) -> &RecyclerConfig {
        &self.core.config
    }

    /// Allocates a zeroed object of at least `size` bytes.
    ///
    /// Allocation pressure may run a collection first. When the heap cannot
    /// grow, one in-thread collection is attempted before the error is
    /// returned.
    ///
    /// # Errors
    ///
    /// [`GcError::OutOfMemory`] or [`GcError::PageAllocation`] when memory is
    /// exhausted, [`GcError::Shutdown`] during shutdown.
    pub fn try_alloc(&self, size: usize, bits: ObjectInfoBits) -> Result<usize, GcError> {
        self.core.alloc(size, bits, None)
    }

    /// Allocates a zeroed object. Running out of memory is fatal.
    #[must_use]
    pub fn alloc(&self, size: usize, bits: ObjectInfoBits) -> usize {
        self.try_alloc(size, bits)
            .unwrap_or_else(|_| self.core.fatal(FatalError::OutOfMemory))
    }

    /// Allocates an object whose contents are never scanned.
    #[must_use]
    pub fn alloc_leaf(&self, size: usize) -> usize {
        self.alloc(size, ObjectInfoBits::LEAF)
    }

    /// Allocates a zeroed, scanned object.
    #[must_use]
    pub fn alloc_zero(&self, size: usize) -> usize {
        self.alloc(size, ObjectInfoBits::empty())
    }

    /// Allocates an object whose `finalizer` runs once it is unreachable.
    ///
    /// `Finalizer::finalize` runs during the sweep, `Finalizer::dispose` later
    /// on the mutator when dispose is allowed. The slot is freed after dispose.
    #[must_use]
    pub fn alloc_finalizable(
        &self,
        size: usize,
        bits: ObjectInfoBits,
        finalizer: Arc<dyn Finalizer>,
    ) -> usize {
        self.core
            .alloc(size, bits, Some(&finalizer))
            .unwrap_or_else(|_| self.core.fatal(FatalError::OutOfMemory))
    }

    /// Resizes `obj` to `size` bytes.
    ///
    /// Returns `obj` itself when the size class does not change. Otherwise a
    /// new object with the same info bits receives the leading words and the
    /// old object is left for the collector.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidObject`] when `obj` is not an object start or is
    /// finalizable.
    pub fn realloc(&self, obj: usize, size: usize) -> Result<usize, GcError> {
        let info = self
            .core
            .heap
            .find_object(obj, false)
            .ok_or(GcError::InvalidObject(obj))?;
        if info.bits.contains(ObjectInfoBits::FINALIZE) {
            return Err(GcError::InvalidObject(obj));
        }
        if size_class(size) == info.size {
            return Ok(obj);
        }
        let replacement = self.try_alloc(size, info.bits)?;
        let words = info.size.min(size_class(size)) / WORD;
        for index in 0..words {
            let value = self.core.heap.load(obj, index)?;
            if value != 0 {
                self.core.heap.store(replacement, index, value)?;
            }
        }
        Ok(replacement)
    }

    /// Writes word `index` of `obj`, recording the store for rescans.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidObject`] when `obj` is not an object or `index` is
    /// out of bounds.
    pub fn store(&self, obj: usize, index: usize, value: usize) -> Result<(), GcError> {
        self.core.heap.store(obj, index, value)
    }

    /// Reads word `index` of `obj`.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidObject`] when `obj` is not an object or `index` is
    /// out of bounds.
    pub fn load(&self, obj: usize, index: usize) -> Result<usize, GcError> {
        self.core.heap.load(obj, index)
    }

    /// Requests a collection.
    ///
    /// Returns `true` if a collection ran, was started, or an in-flight one
    /// was advanced. Heuristic requests may decide that no work is due.
    pub fn collect_now(&self, flags: CollectionFlags) -> bool {
        self.core.collect_now(flags)
    }

    /// Finishes a concurrent collection whose background work is done.
    ///
    /// With [`CollectionFlags::FORCE_FINISH`] the call also waits for
    /// background work still running.
    pub fn finish_concurrent(&self, flags: CollectionFlags) -> bool {
        self.core.finish_concurrent(flags)
    }

    /// Completes the in-flight collection, if any.
    pub fn ensure_not_collecting(&self) {
        self.core.ensure_not_collecting();
    }

    /// Runs pending dispose work now if `flags` allow it.
    pub fn finish_dispose_objects_now(&self, flags: CollectionFlags) -> bool {
        self.core.finish_dispose_objects_now(flags)
    }

    /// Enables or disables non-explicit collections.
    pub fn set_collection_enabled(&self, enabled: bool) {
        self.core.status.set(StatusFlags::COLLECTION_DISABLED, !enabled);
    }

    /// Pins `obj` as a root. Returns the new pin count.
    pub fn root_add_ref(&self, obj: usize) -> usize {
        let count = self.core.pinned.add_ref(obj);
        self.core.status.insert(StatusFlags::SCAN_PINNED_OBJECT_MAP);
        count
    }

    /// Drops one pin of `obj`. Returns the remaining count, `0` if `obj` was
    /// not pinned.
    pub fn root_release(&self, obj: usize) -> usize {
        let Some(count) = self.core.pinned.release(obj) else {
            return 0;
        };
        if count == 0 && self.core.pinned.has_pending_unpinned() {
            self.core.status.insert(StatusFlags::HAS_PENDING_UNPINNED_OBJECT);
        }
        self.core.collect_now(COLLECT_EXHAUSTIVE_CANDIDATE);
        count
    }

    /// Returns the weak handle of `obj`, creating it on first use.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidObject`] when `obj` is not an object start.
    pub fn create_weak_reference(&self, obj: usize) -> Result<usize, GcError> {
        self.core.weak.create(&self.core.heap, obj)
    }

    /// Resolves a weak handle. `None` once the referent was collected.
    #[must_use]
    pub fn weak_reference_target(&self, handle: usize) -> Option<usize> {
        self.core.weak.target(&self.core.heap, handle)
    }

    /// Bumped by every sweep that cleared a weak referent.
    #[must_use]
    pub fn weak_reference_cleanup_id(&self) -> u64 {
        self.core.weak.cleanup_id()
    }

    /// Installs or revokes a callback for the collection of `obj`.
    ///
    /// The callback runs once, after marking, when `obj` is found
    /// unreachable. The object and everything it references survive that
    /// cycle.
    ///
    /// # Errors
    ///
    /// [`GcError::InvalidObject`] when `obj` is not an object start.
    pub fn set_object_before_collect_callback(
        &self,
        obj: usize,
        callback: Option<BeforeCollectCallback>,
    ) -> Result<(), GcError> {
        self.core.set_before_collect_callback(obj, callback)
    }

    /// Creates a guest arena whose words are scanned as roots.
    #[must_use]
    pub fn create_guest_arena(&self) -> Arc<GuestArena> {
        self.core.arenas.create()
    }

    /// Deletes an arena created by [`Recycler::create_guest_arena`].
    ///
    /// While a collection is in flight the arena stops being a root at once
    /// and is removed when the collection reaches a safe point.
    pub fn delete_guest_arena(&self, arena: &Arc<GuestArena>) -> bool {
        self.core.delete_guest_arena(arena)
    }

    /// Scans an arena owned by someone else as a root.
    pub fn add_external_guest_arena(&self, arena: Arc<GuestArena>) {
        self.core.arenas.add_external(arena);
    }

    pub fn remove_external_guest_arena(&self, arena: &Arc<GuestArena>) -> bool {
        self.core.arenas.remove_external(arena)
    }

    /// Installs the host's root marker. It is skipped in partial collections.
    pub fn set_external_root_marker(&self, marker: Option<ExternalRootMarker>) {
        *self.core.external_root_marker.write() = marker;
    }

    pub fn set_collection_wrapper(&self, wrapper: Arc<dyn CollectionWrapper>) {
        *self.core.wrapper.write() = wrapper;
    }

    /// Runs background work on `service` instead of the dedicated thread.
    pub fn set_thread_service(&self, service: Option<Arc<dyn ThreadService>>) {
        *self.core.thread_service.write() = service;
    }

    pub fn set_out_of_memory_callback(&self, callback: Option<OutOfMemoryCallback>) {
        *self.core.out_of_memory.write() = callback;
    }

    /// Looks up the object containing `addr`.
    ///
    /// Interior addresses resolve only with `interior_pointers` enabled.
    #[must_use]
    pub fn find_heap_object(&self, addr: usize) -> Option<HeapObjectInfo> {
        self.core
            .heap
            .find_object(addr, self.core.config.interior_pointers)
    }

    #[must_use]
    pub fn is_valid_object(&self, addr: usize) -> bool {
        self.core.heap.is_valid_object(addr)
    }

    /// Bytes held by allocated objects.
    #[must_use]
    pub fn get_used_bytes(&self) -> usize {
        self.core.heap.used_bytes()
    }

    #[must_use]
    pub fn collection_in_progress(&self) -> bool {
        self.core.collection_in_progress()
    }

    #[must_use]
    pub fn collection_state(&self) -> CollectionState {
        self.core.state()
    }

    /// Whether a mark stack failed to grow and the low-memory rescan is due.
    #[must_use]
    pub fn need_oom_rescan(&self) -> bool {
        self.core.need_oom_rescan()
    }

    /// Completed collection cycles.
    #[must_use]
    pub fn collection_count(&self) -> usize {
        self.core.collection_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn last_collection_stats(&self) -> Option<CollectionStats> {
        *self.core.last_stats.lock()
    }

    /// Pinned objects, with their pin history when `track_pinned_stacks` is set.
    #[must_use]
    pub fn pinned_objects(&self) -> Vec<PinnedObject> {
        self.core.pinned.pinned_objects()
    }

    #[must_use]
    pub fn in_partial_collect_mode(&self) -> bool {
        self.core
            .status
            .contains(StatusFlags::IN_PARTIAL_COLLECT_MODE)
    }
}

impl Default for Recycler {
    fn default() -> Self {
        Self::new(RecyclerConfig::default())
    }
}

impl Drop for Recycler {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::{COLLECT_NOW_EXHAUSTIVE_SKIP_STACK, COLLECT_NOW_FORCE_IN_THREAD};

    fn in_thread() -> Recycler {
        Recycler::new(RecyclerConfig::in_thread().set_collect_on_allocation(false))
    }

    #[test]
    fn test_pinned_object_survives() {
        let recycler = in_thread();
        let obj = recycler.alloc_zero(64);
        recycler.root_add_ref(obj);
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert!(recycler.is_valid_object(obj));
        assert_eq!(recycler.collection_count(), 1);
        assert!(!recycler.collection_in_progress());
    }

    #[test]
    fn test_unreachable_object_swept() {
        let recycler = in_thread();
        let obj = recycler.alloc_zero(64);
        assert!(recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
        assert!(!recycler.is_valid_object(obj));
        let stats = recycler.last_collection_stats().unwrap();
        assert!(stats.swept_objects >= 1);
    }

    #[test]
    fn test_realloc_same_class_keeps_object() {
        let recycler = in_thread();
        let obj = recycler.alloc_zero(40);
        assert_eq!(recycler.realloc(obj, 48).unwrap(), obj);
        recycler.store(obj, 1, 7).unwrap();
        let grown = recycler.realloc(obj, 256).unwrap();
        assert_ne!(grown, obj);
        assert_eq!(recycler.load(grown, 1).unwrap(), 7);
    }

    #[test]
    fn test_disabled_collection_needs_explicit() {
        let recycler = in_thread();
        recycler.set_collection_enabled(false);
        assert!(!recycler.collect_now(COLLECT_NOW_FORCE_IN_THREAD));
        assert!(recycler.collect_now(
            COLLECT_NOW_FORCE_IN_THREAD
                .union(CollectionFlags::EXPLICIT)
                .union(CollectionFlags::SKIP_STACK)
        ));
    }

    #[test]
    fn test_before_collect_callback_rejects_non_objects() {
        let recycler = in_thread();
        assert!(recycler
            .set_object_before_collect_callback(0x10, Some(Box::new(|_| {})))
            .is_err());
    }
}
