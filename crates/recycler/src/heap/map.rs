//! Page-to-block lookup.
//!
//! Blocks live in an arena indexed by [`BlockId`]. Every page a block covers
//! maps back to its id, so any address can be resolved to its block without
//! trusting the address itself. The map is read on every mark candidate and
//! written only when blocks come and go.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::block::{BlockId, HeapBlock};
use crate::page::{PageRun, PAGE_SIZE};

#[derive(Debug, Default)]
struct MapInner {
    pages: HashMap<usize, BlockId>,
    blocks: Vec<Option<Arc<HeapBlock>>>,
    free_ids: Vec<BlockId>,
}

/// Arena of heap blocks with an address index.
#[derive(Debug, Default)]
pub struct HeapBlockMap {
    inner: RwLock<MapInner>,
}

impl HeapBlockMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a block over `run` and publishes it.
    ///
    /// # Safety
    ///
    /// `run` must be committed and exclusively owned by the new block.
    pub(crate) unsafe fn insert(
        &self,
        run: PageRun,
        object_size: usize,
        large: bool,
    ) -> Arc<HeapBlock> {
        let mut inner = self.inner.write();
        let id = match inner.free_ids.pop() {
            Some(id) => id,
            None => {
                #[allow(clippy::cast_possible_truncation)]
                let id = BlockId(inner.blocks.len() as u32);
                inner.blocks.push(None);
                id
            }
        };
        // SAFETY: forwarded from the caller; the block is published only below.
        let block = Arc::new(unsafe { HeapBlock::new(id, run, object_size, large) });
        let first_page = run.addr() / PAGE_SIZE;
        for page in first_page..first_page + run.pages() {
            inner.pages.insert(page, id);
        }
        inner.blocks[id.index()] = Some(Arc::clone(&block));
        block
    }

    /// Unpublishes `block`. Its pages may be reused once this returns.
    pub fn remove(&self, block: &HeapBlock) {
        let mut inner = self.inner.write();
        let first_page = block.base() / PAGE_SIZE;
        for page in first_page..first_page + block.run().pages() {
            inner.pages.remove(&page);
        }
        inner.blocks[block.id().index()] = None;
        inner.free_ids.push(block.id());
    }

    /// Finds the block covering `addr`.
    #[must_use]
    pub fn lookup(&self, addr: usize) -> Option<Arc<HeapBlock>> {
        let inner = self.inner.read();
        let id = inner.pages.get(&(addr / PAGE_SIZE))?;
        inner.blocks[id.index()].clone()
    }

    /// Runs `f` on the block covering `addr` without cloning the handle.
    pub fn with_block<R>(&self, addr: usize, f: impl FnOnce(&HeapBlock) -> R) -> Option<R> {
        let inner = self.inner.read();
        let id = inner.pages.get(&(addr / PAGE_SIZE))?;
        inner.blocks[id.index()].as_deref().map(f)
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<Arc<HeapBlock>> {
        self.inner.read().blocks.get(id.index()).cloned().flatten()
    }

    /// Handles to every live block.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<HeapBlock>> {
        self.inner.read().blocks.iter().flatten().cloned().collect()
    }

    #[must_use]
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::ObjectInfoBits;
    use crate::page::PageAllocator;

    #[test]
    fn test_lookup_every_page_of_block() {
        let pages = PageAllocator::new("test", None);
        let map = HeapBlockMap::new();
        let run = pages.alloc(3).expect("alloc");
        // SAFETY: fresh run.
        let block = unsafe { map.insert(run, 3 * PAGE_SIZE, true) };

        for offset in [0, PAGE_SIZE, 3 * PAGE_SIZE - 8] {
            let found = map.lookup(run.addr() + offset).expect("mapped");
            assert_eq!(found.id(), block.id());
        }
        assert!(map.lookup(run.addr() + 3 * PAGE_SIZE).is_none());
    }

    #[test]
    fn test_remove_recycles_id() {
        let pages = PageAllocator::new("test", None);
        let map = HeapBlockMap::new();
        // SAFETY: fresh runs.
        let first = unsafe { map.insert(pages.alloc(1).unwrap(), 16, false) };
        let id = first.id();
        map.remove(&first);
        assert!(map.lookup(first.base()).is_none());
        assert_eq!(map.block_count(), 0);

        let second = unsafe { map.insert(pages.alloc(1).unwrap(), 16, false) };
        assert_eq!(second.id(), id);
        assert!(map.get(id).is_some());
    }

    #[test]
    fn test_with_block_resolves_slot() {
        let pages = PageAllocator::new("test", None);
        let map = HeapBlockMap::new();
        // SAFETY: fresh run.
        let block = unsafe { map.insert(pages.alloc(1).unwrap(), 64, false) };
        let slot = block.alloc_slot(ObjectInfoBits::empty()).unwrap();
        let addr = block.slot_addr(slot);
        assert_eq!(map.with_block(addr, |b| b.find_slot(addr, false)), Some(Some(slot)));
        assert_eq!(map.snapshot().len(), 1);
    }
}
