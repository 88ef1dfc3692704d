//! Weak references.
//!
//! A weak handle is a two-word leaf object: the referent address and the id
//! of the block that held the referent. Leaf objects are never scanned, so
//! the handle does not keep its referent alive. The map from referent to
//! handle makes handles unique per referent and lets the sweep find the
//! handles it has to clear.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::GcError;
use crate::heap::{word_at, BlockId, HeapInfo, ObjectInfoBits};

const WORD: usize = std::mem::size_of::<usize>();
const HANDLE_SIZE: usize = 2 * WORD;

#[derive(Debug, Default)]
pub(crate) struct WeakReferenceMap {
    /// Referent address to handle address.
    entries: Mutex<HashMap<usize, usize>>,
    cleanup_id: AtomicU64,
}

impl WeakReferenceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `target`, allocating it on first use.
    pub fn create(&self, heap: &HeapInfo, target: usize) -> Result<usize, GcError> {
        let info = heap
            .find_object(target, false)
            .ok_or(GcError::InvalidObject(target))?;
        let mut entries = self.entries.lock();
        if let Some(&handle) = entries.get(&target) {
            if heap.load(handle, 0).ok() == Some(target) {
                return Ok(handle);
            }
        }
        let handle = heap.alloc(HANDLE_SIZE, ObjectInfoBits::LEAF)?;
        heap.store(handle, 0, target)?;
        heap.store(handle, 1, info.block.to_word())?;
        entries.insert(target, handle);
        Ok(handle)
    }

    /// The live referent of `handle`, or `None` once it was collected.
    pub fn target(&self, heap: &HeapInfo, handle: usize) -> Option<usize> {
        let entries = self.entries.lock();
        let target = heap.load(handle, 0).ok()?;
        if target == 0 || entries.get(&target) != Some(&handle) {
            return None;
        }
        let block = BlockId::from_word(heap.load(handle, 1).ok()?);
        (block != BlockId::COLLECTED).then_some(target)
    }

    /// Clears handles whose referent is unmarked and forgets unmarked handles.
    ///
    /// Must run after marking and before the free pass. Returns the number
    /// of referents cleared.
    pub fn sweep(&self, heap: &HeapInfo) -> usize {
        let mut cleared = 0;
        self.entries.lock().retain(|&target, &mut handle| {
            match heap.find_object(handle, false) {
                Some(info) if info.marked => {}
                _ => return false,
            }
            if heap.find_object(target, false).is_some_and(|info| info.marked) {
                return true;
            }
            // SAFETY: the handle is a live two-word object.
            unsafe {
                word_at(handle).store(0, Ordering::Release);
                word_at(handle + WORD).store(BlockId::COLLECTED.to_word(), Ordering::Release);
            }
            cleared += 1;
            false
        });
        if cleared > 0 {
            self.cleanup_id.fetch_add(1, Ordering::AcqRel);
        }
        cleared
    }

    /// Bumped by every sweep that cleared a referent.
    #[must_use]
    pub fn cleanup_id(&self) -> u64 {
        self.cleanup_id.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecyclerHeuristic;

    fn mark(heap: &HeapInfo, obj: usize) {
        let block = heap.lookup(obj).unwrap();
        block.try_mark(block.find_slot(obj, false).unwrap());
    }

    #[test]
    fn test_handle_unique_per_target() {
        let heap = HeapInfo::new(&RecyclerHeuristic::default());
        let map = WeakReferenceMap::new();
        let target = heap.alloc(32, ObjectInfoBits::empty()).unwrap();
        let a = map.create(&heap, target).unwrap();
        let b = map.create(&heap, target).unwrap();
        assert_eq!(a, b);
        assert_eq!(map.target(&heap, a), Some(target));
        assert!(heap.find_object(a, false).unwrap().bits.contains(ObjectInfoBits::LEAF));
    }

    #[test]
    fn test_create_rejects_non_objects() {
        let heap = HeapInfo::new(&RecyclerHeuristic::default());
        let map = WeakReferenceMap::new();
        assert!(matches!(map.create(&heap, 0x1000), Err(GcError::InvalidObject(0x1000))));
    }

    #[test]
    fn test_sweep_clears_unmarked_referent() {
        let heap = HeapInfo::new(&RecyclerHeuristic::default());
        let map = WeakReferenceMap::new();
        let target = heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        let handle = map.create(&heap, target).unwrap();
        mark(&heap, handle);

        assert_eq!(map.sweep(&heap), 1);
        assert_eq!(map.cleanup_id(), 1);
        assert_eq!(map.target(&heap, handle), None);
        assert_eq!(map.len(), 0);
        assert_eq!(heap.load(handle, 1).unwrap(), BlockId::COLLECTED.to_word());
    }

    #[test]
    fn test_sweep_keeps_marked_pair() {
        let heap = HeapInfo::new(&RecyclerHeuristic::default());
        let map = WeakReferenceMap::new();
        let target = heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        let handle = map.create(&heap, target).unwrap();
        mark(&heap, handle);
        mark(&heap, target);

        assert_eq!(map.sweep(&heap), 0);
        assert_eq!(map.cleanup_id(), 0);
        assert_eq!(map.target(&heap, handle), Some(target));
    }

    #[test]
    fn test_sweep_drops_unmarked_handle() {
        let heap = HeapInfo::new(&RecyclerHeuristic::default());
        let map = WeakReferenceMap::new();
        let target = heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        map.create(&heap, target).unwrap();
        mark(&heap, target);

        assert_eq!(map.sweep(&heap), 0);
        assert_eq!(map.len(), 0);
    }
}
