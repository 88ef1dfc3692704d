//! Heap blocks: fixed-size slot containers and single large objects.

use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;

use super::bitmap::Bitmap;
use super::{word_at, ObjectInfoBits, GRANULE};
use crate::page::{PageRun, PAGE_SIZE};

/// Index of a block in the block map arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub(crate) u32);

impl BlockId {
    /// Sentinel stored in weak handles whose referent was collected.
    pub const COLLECTED: Self = Self(u32::MAX);

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn to_word(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_word(word: usize) -> Self {
        Self(word as u32)
    }
}

/// Objects and bytes a sweep released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepCounts {
    pub objects: usize,
    pub bytes: usize,
}

impl std::ops::AddAssign for SweepCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.objects += rhs.objects;
        self.bytes += rhs.bytes;
    }
}

/// A run of pages holding objects of one size.
///
/// Small blocks are carved into equal slots. A large block holds exactly
/// one object spanning the whole run.
#[derive(Debug)]
pub struct HeapBlock {
    id: BlockId,
    run: PageRun,
    object_size: usize,
    slot_count: usize,
    large: bool,
    alloc_bits: Bitmap,
    mark_bits: Bitmap,
    pending_dispose: Bitmap,
    dirty: Bitmap,
    info: Box<[AtomicU8]>,
    free: Mutex<Vec<u32>>,
}

impl HeapBlock {
    /// Creates a block over `run`.
    ///
    /// # Safety
    ///
    /// `run` must be committed, exclusively owned by the new block, and not yet
    /// reachable by any other thread.
    pub(crate) unsafe fn new(id: BlockId, run: PageRun, object_size: usize, large: bool) -> Self {
        debug_assert!(object_size >= GRANULE && object_size % GRANULE == 0);
        let slot_count = if large { 1 } else { run.len() / object_size };
        debug_assert!(slot_count > 0 && slot_count * object_size <= run.len());

        // SAFETY: the caller hands over an unpublished, committed run.
        unsafe { std::ptr::write_bytes(run.addr() as *mut u8, 0, run.len()) };

        #[allow(clippy::cast_possible_truncation)]
        let free = (0..slot_count as u32).rev().collect();
        Self {
            id,
            run,
            object_size,
            slot_count,
            large,
            alloc_bits: Bitmap::new(slot_count),
            mark_bits: Bitmap::new(slot_count),
            pending_dispose: Bitmap::new(slot_count),
            dirty: Bitmap::new(run.pages()),
            info: (0..slot_count).map(|_| AtomicU8::new(0)).collect(),
            free: Mutex::new(free),
        }
    }

    #[must_use]
    pub const fn id(&self) -> BlockId {
        self.id
    }

    #[must_use]
    pub const fn run(&self) -> PageRun {
        self.run
    }

    #[must_use]
    pub const fn base(&self) -> usize {
        self.run.addr()
    }

    #[must_use]
    pub const fn object_size(&self) -> usize {
        self.object_size
    }

    #[must_use]
    pub const fn slot_count(&self) -> usize {
        self.slot_count
    }

    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.large
    }

    #[must_use]
    pub const fn slot_addr(&self, slot: usize) -> usize {
        self.base() + slot * self.object_size
    }

    /// Resolves `addr` to an allocated slot.
    ///
    /// Without `interior`, only the exact object start resolves.
    #[must_use]
    pub fn find_slot(&self, addr: usize, interior: bool) -> Option<usize> {
        let offset = addr.checked_sub(self.base())?;
        if offset >= self.slot_count * self.object_size {
            return None;
        }
        if !interior && offset % self.object_size != 0 {
            return None;
        }
        let slot = offset / self.object_size;
        self.alloc_bits.get(slot).then_some(slot)
    }

    #[must_use]
    pub fn is_allocated(&self, slot: usize) -> bool {
        self.alloc_bits.get(slot)
    }

    #[must_use]
    pub fn is_marked(&self, slot: usize) -> bool {
        self.mark_bits.get(slot)
    }

    /// Marks `slot`. Returns `true` if it was unmarked.
    pub fn try_mark(&self, slot: usize) -> bool {
        self.mark_bits.set(slot)
    }

    #[must_use]
    pub fn info(&self, slot: usize) -> ObjectInfoBits {
        ObjectInfoBits::from_bits_truncate(self.info[slot].load(Ordering::Acquire))
    }

    pub fn set_info(&self, slot: usize, bits: ObjectInfoBits) {
        self.info[slot].store(bits.bits(), Ordering::Release);
    }

    #[must_use]
    pub fn is_pending_dispose(&self, slot: usize) -> bool {
        self.pending_dispose.get(slot)
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.alloc_bits.count()
    }

    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.mark_bits.count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alloc_bits.count() == 0
    }

    #[must_use]
    pub fn has_free_slot(&self) -> bool {
        !self.free.lock().is_empty()
    }

    /// Takes a free slot and records it as allocated with `bits`.
    pub fn alloc_slot(&self, bits: ObjectInfoBits) -> Option<usize> {
        let slot = self.free.lock().pop()? as usize;
        self.mark_bits.clear_bit(slot);
        self.set_info(slot, bits);
        self.alloc_bits.set(slot);
        Some(slot)
    }

    /// Records a store into `addr`.
    pub fn set_dirty(&self, addr: usize) {
        let page = (addr - self.base()) / PAGE_SIZE;
        self.dirty.set_release(page);
    }

    #[must_use]
    pub fn dirty_page_count(&self) -> usize {
        self.dirty.count()
    }

    pub fn reset_write_watch(&self) {
        self.dirty.clear();
    }

    pub fn clear_marks(&self) {
        self.mark_bits.clear();
    }

    /// Unmarked finalizable objects not yet queued for dispose.
    ///
    /// They are flagged pending so the free pass keeps them allocated.
    pub fn take_finalizable_garbage(&self) -> Vec<usize> {
        let mut found = Vec::new();
        for slot in self.alloc_bits.ones() {
            if self.mark_bits.get(slot)
                || !self.info(slot).contains(ObjectInfoBits::FINALIZE)
                || self.pending_dispose.get(slot)
            {
                continue;
            }
            self.pending_dispose.set(slot);
            found.push(self.slot_addr(slot));
        }
        found
    }

    /// Frees every unmarked object that is not waiting for dispose.
    pub fn sweep_free(&self) -> SweepCounts {
        let mut counts = SweepCounts::default();
        let garbage: Vec<usize> = self
            .alloc_bits
            .ones()
            .filter(|&slot| !self.mark_bits.get(slot) && !self.pending_dispose.get(slot))
            .collect();
        for slot in garbage {
            self.free_slot(slot);
            counts.objects += 1;
            counts.bytes += self.object_size;
        }
        counts
    }

    /// Returns `slot` to the free list, zeroing its memory.
    pub fn free_slot(&self, slot: usize) {
        let addr = self.slot_addr(slot);
        for offset in (0..self.object_size).step_by(std::mem::size_of::<usize>()) {
            // SAFETY: the slot lies inside this block's committed run.
            unsafe { word_at(addr + offset) }.store(0, Ordering::Relaxed);
        }
        self.info[slot].store(0, Ordering::Release);
        self.pending_dispose.clear_bit(slot);
        self.alloc_bits.clear_bit(slot);
        #[allow(clippy::cast_possible_truncation)]
        self.free.lock().push(slot as u32);
    }

    /// Clears the pending-dispose flag, leaving the object for the next sweep.
    pub fn clear_pending_dispose(&self, slot: usize) {
        self.pending_dispose.clear_bit(slot);
        let bits = self.info(slot).difference(ObjectInfoBits::FINALIZE);
        self.set_info(slot, bits);
    }

    /// Visits marked, scannable objects on dirty pages.
    ///
    /// With `reset`, the dirty bits are cleared before the objects are read.
    /// Returns the number of dirty pages visited.
    pub fn rescan_dirty(&self, reset: bool, mut visit: impl FnMut(usize, usize)) -> usize {
        let pages = if reset {
            self.dirty.take()
        } else {
            self.dirty.ones().collect()
        };
        let mut last_slot = None;
        for &page in &pages {
            let first = page * PAGE_SIZE / self.object_size;
            let last = (((page + 1) * PAGE_SIZE - 1) / self.object_size).min(self.slot_count - 1);
            for slot in first..=last {
                if last_slot.is_some_and(|prev| slot <= prev) {
                    continue;
                }
                last_slot = Some(slot);
                if self.is_scannable_marked(slot) {
                    visit(self.slot_addr(slot), self.object_size);
                }
            }
        }
        pages.len()
    }

    /// Visits every marked, scannable object.
    pub fn for_each_marked(&self, mut visit: impl FnMut(usize, usize)) {
        for slot in self.mark_bits.ones() {
            if self.is_scannable_marked(slot) {
                visit(self.slot_addr(slot), self.object_size);
            }
        }
    }

    /// Visits allocated objects carrying all of `bits`.
    pub fn for_each_with(&self, bits: ObjectInfoBits, mut visit: impl FnMut(usize, usize)) {
        for slot in self.alloc_bits.ones() {
            if self.info(slot).contains(bits) {
                visit(self.slot_addr(slot), self.object_size);
            }
        }
    }

    fn is_scannable_marked(&self, slot: usize) -> bool {
        self.alloc_bits.get(slot)
            && self.mark_bits.get(slot)
            && !self.info(slot).contains(ObjectInfoBits::LEAF)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageAllocator;

    fn block(pages: &PageAllocator, object_size: usize) -> HeapBlock {
        let run = pages.alloc(1).expect("alloc");
        // SAFETY: fresh run owned by the test.
        unsafe { HeapBlock::new(BlockId(0), run, object_size, false) }
    }

    #[test]
    fn test_alloc_and_find_slot() {
        let pages = PageAllocator::new("test", None);
        let block = block(&pages, 32);
        assert_eq!(block.slot_count(), PAGE_SIZE / 32);

        let slot = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        let addr = block.slot_addr(slot);
        assert_eq!(block.find_slot(addr, false), Some(slot));
        assert_eq!(block.find_slot(addr + 8, false), None);
        assert_eq!(block.find_slot(addr + 8, true), Some(slot));
        assert_eq!(block.find_slot(block.slot_addr(slot + 1), false), None);
    }

    #[test]
    fn test_sweep_frees_unmarked_only() {
        let pages = PageAllocator::new("test", None);
        let block = block(&pages, 16);
        let live = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        let dead = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        block.try_mark(live);

        let counts = block.sweep_free();
        assert_eq!(counts, SweepCounts { objects: 1, bytes: 16 });
        assert!(block.is_allocated(live));
        assert!(!block.is_allocated(dead));
        assert_eq!(block.allocated_count(), 1);
    }

    #[test]
    fn test_finalizable_garbage_survives_free_pass() {
        let pages = PageAllocator::new("test", None);
        let block = block(&pages, 16);
        let slot = block.alloc_slot(ObjectInfoBits::FINALIZE).unwrap();

        let found = block.take_finalizable_garbage();
        assert_eq!(found, vec![block.slot_addr(slot)]);
        assert!(block.take_finalizable_garbage().is_empty());

        assert_eq!(block.sweep_free().objects, 0);
        assert!(block.is_allocated(slot));

        block.free_slot(slot);
        assert!(block.is_empty());
    }

    #[test]
    fn test_rescan_dirty_visits_marked_objects_once() {
        let pages = PageAllocator::new("test", None);
        let block = block(&pages, 1024);
        let a = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        let b = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        let leaf = block.alloc_slot(ObjectInfoBits::LEAF).unwrap();
        block.try_mark(a);
        block.try_mark(leaf);

        block.set_dirty(block.slot_addr(a));
        block.set_dirty(block.slot_addr(b));
        block.set_dirty(block.slot_addr(leaf));

        let mut visited = Vec::new();
        let dirty_pages = block.rescan_dirty(true, |addr, _| visited.push(addr));
        assert_eq!(dirty_pages, 1);
        assert_eq!(visited, vec![block.slot_addr(a)]);
        assert_eq!(block.dirty_page_count(), 0);
    }

    #[test]
    fn test_freed_memory_is_zeroed() {
        let pages = PageAllocator::new("test", None);
        let block = block(&pages, 16);
        let slot = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        let addr = block.slot_addr(slot);
        // SAFETY: slot memory is committed.
        unsafe { word_at(addr) }.store(99, Ordering::Relaxed);
        block.free_slot(slot);
        let again = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        assert_eq!(again, slot);
        // SAFETY: as above.
        assert_eq!(unsafe { word_at(addr) }.load(Ordering::Relaxed), 0);
    }
}
