//! Size-class buckets.

use std::sync::Arc;

use parking_lot::Mutex;

use super::block::{HeapBlock, SweepCounts};
use super::map::HeapBlockMap;
use crate::error::GcError;
use crate::heap::ObjectInfoBits;
use crate::page::{PageAllocator, PAGE_SIZE};

/// Pages per small-object block.
pub const SMALL_BLOCK_PAGES: usize = 4;

#[derive(Debug, Default)]
struct BucketInner {
    blocks: Vec<Arc<HeapBlock>>,
    /// Blocks handed to the background sweep. The allocator skips them.
    pending: Vec<Arc<HeapBlock>>,
    cursor: usize,
}

/// Blocks of one size class, or all large blocks when `object_size` is zero.
#[derive(Debug)]
pub struct HeapBucket {
    object_size: usize,
    inner: Mutex<BucketInner>,
}

/// A freshly allocated object.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub block: Arc<HeapBlock>,
    pub slot: usize,
    pub new_pages: usize,
}

impl HeapBucket {
    #[must_use]
    pub fn new(object_size: usize) -> Self {
        Self {
            object_size,
            inner: Mutex::new(BucketInner::default()),
        }
    }

    #[must_use]
    pub const fn is_large(&self) -> bool {
        self.object_size == 0
    }

    /// Allocates one object of `size` bytes, adding a block if every block is full.
    pub fn alloc(
        &self,
        map: &HeapBlockMap,
        pages: &PageAllocator,
        size: usize,
        bits: ObjectInfoBits,
    ) -> Result<Allocation, GcError> {
        let mut inner = self.inner.lock();
        if !self.is_large() {
            let start = inner.cursor;
            for index in start..inner.blocks.len() {
                if let Some(slot) = inner.blocks[index].alloc_slot(bits) {
                    inner.cursor = index;
                    return Ok(Allocation {
                        block: Arc::clone(&inner.blocks[index]),
                        slot,
                        new_pages: 0,
                    });
                }
            }
        }

        let (page_count, object_size) = if self.is_large() {
            (size.div_ceil(PAGE_SIZE), size)
        } else {
            (SMALL_BLOCK_PAGES, self.object_size)
        };
        let run = pages.alloc(page_count)?;
        // SAFETY: the run was just allocated and is owned by the new block.
        let block = unsafe { map.insert(run, object_size, self.is_large()) };
        let slot = block
            .alloc_slot(bits)
            .ok_or(GcError::OutOfMemory { requested: size })?;
        inner.blocks.push(Arc::clone(&block));
        inner.cursor = inner.blocks.len() - 1;
        Ok(Allocation {
            block,
            slot,
            new_pages: page_count,
        })
    }

    pub fn reset_cursor(&self) {
        self.inner.lock().cursor = 0;
    }

    /// Flags unmarked finalizable objects and returns their addresses.
    pub fn take_finalizable_garbage(&self) -> Vec<usize> {
        let inner = self.inner.lock();
        inner
            .blocks
            .iter()
            .flat_map(|block| block.take_finalizable_garbage())
            .collect()
    }

    /// Sweeps in thread, or parks every block for the background sweep.
    pub fn sweep(&self, concurrent: bool) -> SweepCounts {
        let mut inner = self.inner.lock();
        inner.cursor = 0;
        if concurrent {
            let blocks = std::mem::take(&mut inner.blocks);
            inner.pending.extend(blocks);
            return SweepCounts::default();
        }
        let mut counts = SweepCounts::default();
        for block in &inner.blocks {
            counts += block.sweep_free();
        }
        counts
    }

    /// Sweeps the parked blocks. Runs on the background thread.
    pub fn background_sweep(&self) -> SweepCounts {
        let pending = self.inner.lock().pending.clone();
        let mut counts = SweepCounts::default();
        for block in pending {
            counts += block.sweep_free();
        }
        counts
    }

    /// Makes parked blocks allocatable again and releases empty blocks.
    pub fn transfer_swept(&self, map: &HeapBlockMap, pages: &PageAllocator) -> usize {
        let mut inner = self.inner.lock();
        let pending = std::mem::take(&mut inner.pending);
        inner.blocks.extend(pending);
        Self::release_empty(&mut inner, map, pages)
    }

    /// Releases empty blocks after an in-thread sweep.
    pub fn release_empty_blocks(&self, map: &HeapBlockMap, pages: &PageAllocator) -> usize {
        let mut inner = self.inner.lock();
        Self::release_empty(&mut inner, map, pages)
    }

    fn release_empty(inner: &mut BucketInner, map: &HeapBlockMap, pages: &PageAllocator) -> usize {
        let mut released = 0;
        inner.blocks.retain(|block| {
            if block.is_empty() {
                map.remove(block);
                pages.release(block.run());
                released += 1;
                false
            } else {
                true
            }
        });
        inner.cursor = 0;
        released
    }

    /// Bytes held by allocated objects.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .blocks
            .iter()
            .chain(inner.pending.iter())
            .map(|block| block.allocated_count() * block.object_size())
            .sum()
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        !self.inner.lock().pending.is_empty()
    }

    #[cfg(test)]
    pub fn block_count(&self) -> usize {
        let inner = self.inner.lock();
        inner.blocks.len() + inner.pending.len()
    }
}
