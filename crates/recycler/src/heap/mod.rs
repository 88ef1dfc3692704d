//! Heap storage.
//!
//! Objects are carved out of blocks by size class. Small objects (up to
//! [`MAX_SMALL_OBJECT_SIZE`]) share blocks of equal slots, larger objects get
//! a block each. Object memory is only ever accessed as atomic words so the
//! mutator and collector threads can read and write it concurrently.

mod bitmap;
mod block;
mod bucket;
mod map;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::Mutex;

pub use bitmap::Bitmap;
pub use block::{BlockId, HeapBlock, SweepCounts};
pub use bucket::SMALL_BLOCK_PAGES;
pub use map::HeapBlockMap;
pub use crate::page::PAGE_SIZE;

use bucket::HeapBucket;

use crate::config::RecyclerHeuristic;
use crate::error::GcError;
use crate::page::IdleDecommitPageAllocator;

/// Allocation granularity. Every object size is a multiple of this.
pub const GRANULE: usize = 16;

/// Largest object served from a shared small block.
pub const MAX_SMALL_OBJECT_SIZE: usize = 1024;

const BUCKET_COUNT: usize = MAX_SMALL_OBJECT_SIZE / GRANULE;

const WORD: usize = std::mem::size_of::<usize>();

bitflags! {
    /// Per-object attributes chosen at allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectInfoBits: u8 {
        /// Contains no pointers and is never scanned.
        const LEAF = 0x01;
        /// Has a finalizer that runs before the memory is reused.
        const FINALIZE = 0x02;
        /// Scanned after the main mark on the collecting thread.
        const TRACK = 0x04;
        /// Treated as a root while it is allocated.
        const IMPLICIT_ROOT = 0x08;
    }
}

/// Host hooks for objects allocated with [`ObjectInfoBits::FINALIZE`].
///
/// `finalize` runs during sweep, `dispose` later on the mutator thread. Both
/// may read the object's own words but not other heap objects, which may
/// already be reclaimed.
pub trait Finalizer: Send + Sync {
    fn finalize(&self, object: usize, is_shutdown: bool);

    fn dispose(&self, object: usize, is_shutdown: bool);
}

/// What the heap knows about an allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObjectInfo {
    pub address: usize,
    pub size: usize,
    pub bits: ObjectInfoBits,
    pub block: BlockId,
    pub marked: bool,
}

/// Views heap memory at `addr` as an atomic word.
///
/// # Safety
///
/// `addr` must be word aligned and lie inside a committed heap block.
pub(crate) unsafe fn word_at<'a>(addr: usize) -> &'a AtomicUsize {
    // SAFETY: upheld by the caller.
    unsafe { &*(addr as *const AtomicUsize) }
}

/// Rounds a request up to its allocation size.
#[must_use]
pub const fn size_class(size: usize) -> usize {
    if size == 0 {
        GRANULE
    } else {
        size.div_ceil(GRANULE) * GRANULE
    }
}

type PendingDispose = (usize, Arc<dyn Finalizer>);

/// All heap storage owned by one recycler.
pub(crate) struct HeapInfo {
    buckets: Box<[HeapBucket]>,
    large: HeapBucket,
    map: HeapBlockMap,
    small_pages: IdleDecommitPageAllocator,
    large_pages: IdleDecommitPageAllocator,
    finalizers: Mutex<HashMap<usize, Arc<dyn Finalizer>>>,
    pending_dispose: Mutex<Vec<PendingDispose>>,
    uncollected_alloc_bytes: AtomicUsize,
    uncollected_new_page_count: AtomicUsize,
}

impl std::fmt::Debug for HeapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapInfo")
            .field("blocks", &self.map.block_count())
            .field("used_bytes", &self.used_bytes())
            .finish_non_exhaustive()
    }
}

impl HeapInfo {
    pub fn new(heuristics: &RecyclerHeuristic) -> Self {
        Self {
            buckets: (1..=BUCKET_COUNT)
                .map(|i| HeapBucket::new(i * GRANULE))
                .collect(),
            large: HeapBucket::new(0),
            map: HeapBlockMap::new(),
            small_pages: IdleDecommitPageAllocator::new("small", heuristics.idle_decommit_time),
            large_pages: IdleDecommitPageAllocator::new("large", heuristics.idle_decommit_time),
            finalizers: Mutex::new(HashMap::new()),
            pending_dispose: Mutex::new(Vec::new()),
            uncollected_alloc_bytes: AtomicUsize::new(0),
            uncollected_new_page_count: AtomicUsize::new(0),
        }
    }

    pub const fn map(&self) -> &HeapBlockMap {
        &self.map
    }

    fn bucket_for(&self, size: usize) -> &HeapBucket {
        if size > MAX_SMALL_OBJECT_SIZE {
            &self.large
        } else {
            &self.buckets[size / GRANULE - 1]
        }
    }

    fn buckets(&self) -> impl Iterator<Item = &HeapBucket> {
        self.buckets.iter().chain(std::iter::once(&self.large))
    }

    /// Allocates a zeroed object of at least `size` bytes.
    pub fn alloc(&self, size: usize, bits: ObjectInfoBits) -> Result<usize, GcError> {
        let size = size_class(size);
        let bucket = self.bucket_for(size);
        let pages = if bucket.is_large() {
            &*self.large_pages
        } else {
            &*self.small_pages
        };
        let allocation = bucket.alloc(&self.map, pages, size, bits)?;
        self.uncollected_alloc_bytes
            .fetch_add(allocation.block.object_size(), Ordering::Relaxed);
        if allocation.new_pages > 0 {
            self.uncollected_new_page_count
                .fetch_add(allocation.new_pages, Ordering::Relaxed);
        }
        Ok(allocation.block.slot_addr(allocation.slot))
    }

    /// Allocates an object whose `finalizer` runs once it becomes unreachable.
    pub fn alloc_finalizable(
        &self,
        size: usize,
        bits: ObjectInfoBits,
        finalizer: Arc<dyn Finalizer>,
    ) -> Result<usize, GcError> {
        let addr = self.alloc(size, bits | ObjectInfoBits::FINALIZE)?;
        self.finalizers.lock().insert(addr, finalizer);
        Ok(addr)
    }

    #[cfg(test)]
    pub fn lookup(&self, addr: usize) -> Option<Arc<HeapBlock>> {
        self.map.lookup(addr)
    }

    pub fn find_object(&self, addr: usize, interior: bool) -> Option<HeapObjectInfo> {
        self.map.with_block(addr, |block| {
            block.find_slot(addr, interior).map(|slot| HeapObjectInfo {
                address: block.slot_addr(slot),
                size: block.object_size(),
                bits: block.info(slot),
                block: block.id(),
                marked: block.is_marked(slot),
            })
        })?
    }

    pub fn is_valid_object(&self, addr: usize) -> bool {
        self.find_object(addr, false).is_some()
    }

    /// Reads word `index` of the object at `obj`.
    pub fn load(&self, obj: usize, index: usize) -> Result<usize, GcError> {
        self.map
            .with_block(obj, |block| {
                let slot = block.find_slot(obj, false)?;
                (index < block.object_size() / WORD).then(|| {
                    // SAFETY: the word lies inside an allocated slot.
                    unsafe { word_at(block.slot_addr(slot) + index * WORD) }.load(Ordering::Acquire)
                })
            })
            .flatten()
            .ok_or(GcError::InvalidObject(obj))
    }

    /// Writes word `index` of the object at `obj` and records the page as dirty.
    pub fn store(&self, obj: usize, index: usize, value: usize) -> Result<(), GcError> {
        self.map
            .with_block(obj, |block| {
                let slot = block.find_slot(obj, false)?;
                if index >= block.object_size() / WORD {
                    return None;
                }
                let addr = block.slot_addr(slot) + index * WORD;
                // SAFETY: the word lies inside an allocated slot.
                unsafe { word_at(addr) }.store(value, Ordering::Relaxed);
                block.set_dirty(addr);
                Some(())
            })
            .flatten()
            .ok_or(GcError::InvalidObject(obj))
    }

    pub fn clear_marks(&self) {
        for block in self.map.snapshot() {
            block.clear_marks();
        }
    }

    pub fn reset_write_watch(&self) {
        for block in self.map.snapshot() {
            block.reset_write_watch();
        }
    }

    /// Visits marked objects on dirty pages. Returns the dirty page count.
    pub fn rescan_dirty(&self, reset: bool, mut visit: impl FnMut(usize, usize)) -> usize {
        self.map
            .snapshot()
            .iter()
            .map(|block| block.rescan_dirty(reset, &mut visit))
            .sum()
    }

    pub fn for_each_block(&self, mut f: impl FnMut(&HeapBlock)) {
        for block in self.map.snapshot() {
            f(&block);
        }
    }

    pub fn for_each_with(&self, bits: ObjectInfoBits, mut visit: impl FnMut(usize, usize)) {
        for block in self.map.snapshot() {
            block.for_each_with(bits, &mut visit);
        }
    }

    /// Runs finalizers of unreachable finalizable objects and queues them for dispose.
    ///
    /// Must run before the free pass so queued objects stay allocated.
    pub fn finalize_garbage(&self) -> usize {
        let garbage: Vec<usize> = self
            .buckets()
            .flat_map(HeapBucket::take_finalizable_garbage)
            .collect();
        if garbage.is_empty() {
            return 0;
        }
        let queued: Vec<PendingDispose> = {
            let mut finalizers = self.finalizers.lock();
            garbage
                .into_iter()
                .filter_map(|addr| finalizers.remove(&addr).map(|f| (addr, f)))
                .collect()
        };
        for (addr, finalizer) in &queued {
            finalizer.finalize(*addr, false);
        }
        let count = queued.len();
        self.pending_dispose.lock().extend(queued);
        count
    }

    pub fn sweep(&self, concurrent: bool) -> SweepCounts {
        let mut counts = SweepCounts::default();
        for bucket in self.buckets() {
            counts += bucket.sweep(concurrent);
        }
        counts
    }

    pub fn background_sweep(&self) -> SweepCounts {
        let mut counts = SweepCounts::default();
        for bucket in self.buckets() {
            counts += bucket.background_sweep();
        }
        counts
    }

    pub fn transfer_swept(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.transfer_swept(&self.map, &self.small_pages))
            .sum::<usize>()
            + self.large.transfer_swept(&self.map, &self.large_pages)
    }

    pub fn release_empty_blocks(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.release_empty_blocks(&self.map, &self.small_pages))
            .sum::<usize>()
            + self.large.release_empty_blocks(&self.map, &self.large_pages)
    }

    pub fn has_pending_dispose(&self) -> bool {
        !self.pending_dispose.lock().is_empty()
    }

    /// Runs `dispose` for every queued object.
    ///
    /// With `free_now` the slots are reclaimed immediately, otherwise they are
    /// left unmarked for the next sweep.
    pub fn dispose_objects(&self, free_now: bool) -> usize {
        let queued = std::mem::take(&mut *self.pending_dispose.lock());
        for (addr, finalizer) in &queued {
            finalizer.dispose(*addr, false);
        }
        for (addr, _) in &queued {
            let Some(block) = self.map.lookup(*addr) else {
                continue;
            };
            let Some(slot) = block.find_slot(*addr, false) else {
                continue;
            };
            if free_now {
                block.free_slot(slot);
                self.bucket_for(block.object_size()).reset_cursor();
            } else {
                block.clear_pending_dispose(slot);
            }
        }
        queued.len()
    }

    /// Runs every outstanding finalizer and dispose with `is_shutdown` set.
    pub fn shutdown_finalize(&self) {
        let live: Vec<PendingDispose> = self.finalizers.lock().drain().collect();
        for (addr, finalizer) in &live {
            finalizer.finalize(*addr, true);
        }
        let mut queued = std::mem::take(&mut *self.pending_dispose.lock());
        queued.extend(live);
        for (addr, finalizer) in &queued {
            finalizer.dispose(*addr, true);
        }
    }

    pub fn used_bytes(&self) -> usize {
        self.buckets().map(HeapBucket::used_bytes).sum()
    }

    pub fn uncollected_alloc_bytes(&self) -> usize {
        self.uncollected_alloc_bytes.load(Ordering::Relaxed)
    }

    pub fn reset_uncollected_alloc_bytes(&self) {
        self.uncollected_alloc_bytes.store(0, Ordering::Relaxed);
    }

    pub fn uncollected_new_page_count(&self) -> usize {
        self.uncollected_new_page_count.load(Ordering::Relaxed)
    }

    pub fn reset_uncollected_new_page_count(&self) {
        self.uncollected_new_page_count.store(0, Ordering::Relaxed);
    }

    fn page_allocators(&self) -> [&IdleDecommitPageAllocator; 2] {
        [&self.small_pages, &self.large_pages]
    }

    pub fn idle_decommit_wait(&self) -> Option<Duration> {
        self.page_allocators()
            .into_iter()
            .filter_map(IdleDecommitPageAllocator::idle_decommit_wait)
            .min()
    }

    pub fn idle_decommit(&self) -> usize {
        self.page_allocators()
            .into_iter()
            .map(IdleDecommitPageAllocator::idle_decommit)
            .sum()
    }

    pub fn suspend_idle_decommit(&self) {
        for pages in self.page_allocators() {
            pages.suspend_idle_decommit();
        }
    }

    pub fn resume_idle_decommit(&self) {
        for pages in self.page_allocators() {
            pages.resume_idle_decommit();
        }
    }

    pub fn decommit_excess(&self, keep: usize) -> usize {
        self.page_allocators()
            .into_iter()
            .map(|pages| pages.decommit_excess(keep))
            .sum()
    }

    pub fn decommit_now(&self) -> usize {
        self.decommit_excess(0)
    }

    pub fn release_empty_segments(&self) -> usize {
        self.page_allocators()
            .into_iter()
            .map(|pages| pages.release_empty_segments())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> HeapInfo {
        HeapInfo::new(&RecyclerHeuristic::default())
    }

    #[test]
    fn test_size_class_rounding() {
        assert_eq!(size_class(0), 16);
        assert_eq!(size_class(1), 16);
        assert_eq!(size_class(17), 32);
        assert_eq!(size_class(1024), 1024);
    }

    #[test]
    fn test_alloc_load_store() {
        let heap = heap();
        let obj = heap.alloc(24, ObjectInfoBits::empty()).unwrap();
        assert_eq!(obj % GRANULE, 0);
        assert_eq!(heap.load(obj, 0).unwrap(), 0);
        heap.store(obj, 2, 0xabc).unwrap();
        assert_eq!(heap.load(obj, 2).unwrap(), 0xabc);
        assert!(matches!(heap.store(obj, 4, 1), Err(GcError::InvalidObject(_))));
        assert!(matches!(heap.load(obj + 8, 0), Err(GcError::InvalidObject(_))));
        assert_eq!(heap.uncollected_alloc_bytes(), 32);
    }

    #[test]
    fn test_store_sets_dirty_page() {
        let heap = heap();
        let obj = heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        let block = heap.lookup(obj).unwrap();
        assert_eq!(block.dirty_page_count(), 0);
        heap.store(obj, 0, 1).unwrap();
        assert_eq!(block.dirty_page_count(), 1);
        heap.reset_write_watch();
        assert_eq!(block.dirty_page_count(), 0);
    }

    #[test]
    fn test_large_object_routing() {
        let heap = heap();
        let obj = heap.alloc(MAX_SMALL_OBJECT_SIZE + 1, ObjectInfoBits::empty()).unwrap();
        let info = heap.find_object(obj, false).unwrap();
        assert_eq!(info.size, MAX_SMALL_OBJECT_SIZE + GRANULE);
        assert!(heap.lookup(obj).unwrap().is_large());
    }

    struct Counting {
        finalized: AtomicUsize,
        disposed: AtomicUsize,
    }

    impl Finalizer for Counting {
        fn finalize(&self, _object: usize, _is_shutdown: bool) {
            self.finalized.fetch_add(1, Ordering::SeqCst);
        }

        fn dispose(&self, _object: usize, _is_shutdown: bool) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_finalize_then_dispose_frees() {
        let heap = heap();
        let counter = Arc::new(Counting {
            finalized: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
        });
        let obj = heap
            .alloc_finalizable(32, ObjectInfoBits::empty(), counter.clone())
            .unwrap();

        assert_eq!(heap.finalize_garbage(), 1);
        assert_eq!(counter.finalized.load(Ordering::SeqCst), 1);
        assert_eq!(heap.sweep(false).objects, 0);
        assert!(heap.is_valid_object(obj));
        assert!(heap.has_pending_dispose());

        assert_eq!(heap.dispose_objects(true), 1);
        assert_eq!(counter.disposed.load(Ordering::SeqCst), 1);
        assert!(!heap.is_valid_object(obj));
    }

    #[test]
    fn test_shutdown_finalize_runs_everything() {
        let heap = heap();
        let counter = Arc::new(Counting {
            finalized: AtomicUsize::new(0),
            disposed: AtomicUsize::new(0),
        });
        heap.alloc_finalizable(16, ObjectInfoBits::empty(), counter.clone())
            .unwrap();
        heap.alloc_finalizable(16, ObjectInfoBits::empty(), counter.clone())
            .unwrap();
        heap.shutdown_finalize();
        assert_eq!(counter.finalized.load(Ordering::SeqCst), 2);
        assert_eq!(counter.disposed.load(Ordering::SeqCst), 2);
    }
}
