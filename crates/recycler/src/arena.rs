//! Guest arenas.
//!
//! A guest arena is host-side storage whose words are scanned as roots.
//! Arenas created through the recycler are owned by it; external arenas are
//! owned by the host and only registered for scanning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Root storage scanned conservatively on every collection.
///
/// # Example
///
/// ```
/// use recycler::GuestArena;
///
/// let arena = GuestArena::new();
/// let slot = arena.push(0x1000);
/// arena.set(slot, 0x2000);
/// assert_eq!(arena.get(slot), Some(0x2000));
/// ```
#[derive(Debug, Default)]
pub struct GuestArena {
    words: Mutex<Vec<usize>>,
    pending_delete: AtomicBool,
}

impl GuestArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a root word and returns its index.
    pub fn push(&self, word: usize) -> usize {
        let mut words = self.words.lock();
        words.push(word);
        words.len() - 1
    }

    /// Overwrites the word at `index`. Returns `false` if it is out of range.
    pub fn set(&self, index: usize, word: usize) -> bool {
        match self.words.lock().get_mut(index) {
            Some(slot) => {
                *slot = word;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<usize> {
        self.words.lock().get(index).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.lock().is_empty()
    }

    /// Drops every root word.
    pub fn clear(&self) {
        self.words.lock().clear();
    }

    pub(crate) fn snapshot(&self) -> Vec<usize> {
        self.words.lock().clone()
    }

    fn is_pending_delete(&self) -> bool {
        self.pending_delete.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default)]
struct ArenaLists {
    owned: Vec<Arc<GuestArena>>,
    external: Vec<Arc<GuestArena>>,
}

/// Every arena a recycler scans.
#[derive(Debug, Default)]
pub(crate) struct GuestArenas {
    lists: Mutex<ArenaLists>,
    has_pending_delete: AtomicBool,
}

impl GuestArenas {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> Arc<GuestArena> {
        let arena = Arc::new(GuestArena::new());
        self.lists.lock().owned.push(Arc::clone(&arena));
        arena
    }

    /// Deletes an owned arena. While a collection may be scanning, the arena
    /// is only flagged and [`GuestArenas::cleanup_pending_delete`] removes it.
    pub fn delete(&self, arena: &Arc<GuestArena>, defer: bool) -> bool {
        let mut lists = self.lists.lock();
        let Some(index) = lists.owned.iter().position(|a| Arc::ptr_eq(a, arena)) else {
            return false;
        };
        if defer {
            arena.pending_delete.store(true, Ordering::Release);
            self.has_pending_delete.store(true, Ordering::Release);
        } else {
            lists.owned.swap_remove(index);
        }
        true
    }

    pub fn has_pending_delete(&self) -> bool {
        self.has_pending_delete.load(Ordering::Acquire)
    }

    pub fn cleanup_pending_delete(&self) -> usize {
        if !self.has_pending_delete.swap(false, Ordering::AcqRel) {
            return 0;
        }
        let mut lists = self.lists.lock();
        let before = lists.owned.len();
        lists.owned.retain(|arena| !arena.is_pending_delete());
        before - lists.owned.len()
    }

    pub fn add_external(&self, arena: Arc<GuestArena>) {
        self.lists.lock().external.push(arena);
    }

    pub fn remove_external(&self, arena: &Arc<GuestArena>) -> bool {
        let mut lists = self.lists.lock();
        let before = lists.external.len();
        lists.external.retain(|a| !Arc::ptr_eq(a, arena));
        lists.external.len() != before
    }

    /// Root words of every live arena.
    pub fn root_words(&self) -> Vec<usize> {
        let arenas: Vec<Arc<GuestArena>> = {
            let lists = self.lists.lock();
            lists
                .owned
                .iter()
                .filter(|a| !a.is_pending_delete())
                .chain(lists.external.iter())
                .cloned()
                .collect()
        };
        arenas.iter().flat_map(|a| a.snapshot()).collect()
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        let lists = self.lists.lock();
        lists.owned.len() + lists.external.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_words_cover_owned_and_external() {
        let arenas = GuestArenas::new();
        let owned = arenas.create();
        owned.push(1);
        let external = Arc::new(GuestArena::new());
        external.push(2);
        arenas.add_external(Arc::clone(&external));

        let mut words = arenas.root_words();
        words.sort_unstable();
        assert_eq!(words, vec![1, 2]);

        assert!(arenas.remove_external(&external));
        assert!(!arenas.remove_external(&external));
        assert_eq!(arenas.root_words(), vec![1]);
    }

    #[test]
    fn test_deferred_delete() {
        let arenas = GuestArenas::new();
        let arena = arenas.create();
        arena.push(7);
        assert!(arenas.delete(&arena, true));
        assert!(arenas.has_pending_delete());
        assert!(arenas.root_words().is_empty());
        assert_eq!(arenas.count(), 1);

        assert_eq!(arenas.cleanup_pending_delete(), 1);
        assert_eq!(arenas.count(), 0);
        assert!(!arenas.delete(&arena, false));
    }

    #[test]
    fn test_set_out_of_range() {
        let arena = GuestArena::new();
        assert!(!arena.set(0, 1));
        assert_eq!(arena.get(0), None);
        assert!(arena.is_empty());
    }
}
