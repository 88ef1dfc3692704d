//! Explicit roots.
//!
//! The host pins objects it keeps outside the heap. Each pin is a reference
//! count keyed by object address. While the background thread walks the map
//! its entries must stay put, so releases that hit zero during that window
//! leave a zero-count record behind that a later cleanup removes.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;

/// What happened to a pin count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinEventKind {
    AddRef,
    Release,
}

/// One entry of a pin history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinEvent {
    pub kind: PinEventKind,
    /// Count after the operation.
    pub count: usize,
    pub thread: ThreadId,
}

/// A currently pinned object, as reported by [`crate::Recycler::pinned_objects`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedObject {
    pub address: usize,
    pub count: usize,
    /// Empty unless pin tracking is enabled.
    pub history: Vec<PinEvent>,
}

#[derive(Debug, Default)]
struct PinRecord {
    count: usize,
    history: Option<Vec<PinEvent>>,
}

impl PinRecord {
    fn record(&mut self, kind: PinEventKind) {
        if let Some(history) = &mut self.history {
            history.push(PinEvent {
                kind,
                count: self.count,
                thread: thread::current().id(),
            });
        }
    }
}

#[derive(Debug, Default)]
struct PinInner {
    records: HashMap<usize, PinRecord>,
    resize_disabled: bool,
    has_pending_unpinned: bool,
}

#[derive(Debug)]
pub(crate) struct PinnedObjectMap {
    inner: Mutex<PinInner>,
    track_history: bool,
}

impl PinnedObjectMap {
    pub fn new(track_history: bool) -> Self {
        Self {
            inner: Mutex::new(PinInner::default()),
            track_history,
        }
    }

    pub fn add_ref(&self, obj: usize) -> usize {
        let mut inner = self.inner.lock();
        let track = self.track_history;
        let record = inner.records.entry(obj).or_insert_with(|| PinRecord {
            count: 0,
            history: track.then(Vec::new),
        });
        record.count += 1;
        record.record(PinEventKind::AddRef);
        record.count
    }

    /// Drops one pin. Returns the remaining count, or `None` if `obj` was not pinned.
    pub fn release(&self, obj: usize) -> Option<usize> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&obj).filter(|r| r.count > 0)?;
        record.count -= 1;
        record.record(PinEventKind::Release);
        let count = record.count;
        if count == 0 {
            if inner.resize_disabled {
                inner.has_pending_unpinned = true;
            } else {
                inner.records.remove(&obj);
            }
        }
        Some(count)
    }

    /// Freezes the set of records while a background root scan runs.
    pub fn disable_resize(&self) {
        self.inner.lock().resize_disabled = true;
    }

    pub fn enable_resize(&self) {
        self.inner.lock().resize_disabled = false;
    }

    #[must_use]
    pub fn has_pending_unpinned(&self) -> bool {
        self.inner.lock().has_pending_unpinned
    }

    /// Removes zero-count records left by deferred releases.
    pub fn cleanup_pending_unroot(&self) -> usize {
        let mut inner = self.inner.lock();
        if !inner.has_pending_unpinned {
            return 0;
        }
        let before = inner.records.len();
        inner.records.retain(|_, record| record.count > 0);
        inner.has_pending_unpinned = false;
        before - inner.records.len()
    }

    /// Addresses with a positive pin count.
    #[must_use]
    pub fn roots(&self) -> Vec<usize> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|(_, record)| record.count > 0)
            .map(|(&obj, _)| obj)
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    #[must_use]
    pub fn pinned_objects(&self) -> Vec<PinnedObject> {
        let inner = self.inner.lock();
        let mut pinned: Vec<PinnedObject> = inner
            .records
            .iter()
            .filter(|(_, record)| record.count > 0)
            .map(|(&address, record)| PinnedObject {
                address,
                count: record.count,
                history: record.history.clone().unwrap_or_default(),
            })
            .collect();
        pinned.sort_by_key(|p| p.address);
        pinned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_ref_release_round_trip() {
        let map = PinnedObjectMap::new(false);
        assert_eq!(map.add_ref(0x100), 1);
        assert_eq!(map.add_ref(0x100), 2);
        assert_eq!(map.release(0x100), Some(1));
        assert_eq!(map.release(0x100), Some(0));
        assert_eq!(map.len(), 0);
        assert_eq!(map.release(0x100), None);
    }

    #[test]
    fn test_release_deferred_while_resize_disabled() {
        let map = PinnedObjectMap::new(false);
        map.add_ref(0x200);
        map.disable_resize();
        assert_eq!(map.release(0x200), Some(0));
        assert_eq!(map.len(), 1);
        assert!(map.has_pending_unpinned());
        assert!(map.roots().is_empty());
        // A deferred record can not go negative.
        assert_eq!(map.release(0x200), None);

        map.enable_resize();
        assert_eq!(map.cleanup_pending_unroot(), 1);
        assert_eq!(map.len(), 0);
        assert!(!map.has_pending_unpinned());
    }

    #[test]
    fn test_repin_of_deferred_record() {
        let map = PinnedObjectMap::new(false);
        map.add_ref(0x300);
        map.disable_resize();
        map.release(0x300);
        assert_eq!(map.add_ref(0x300), 1);
        map.enable_resize();
        assert_eq!(map.cleanup_pending_unroot(), 0);
        assert_eq!(map.roots(), vec![0x300]);
    }

    #[test]
    fn test_history_tracking() {
        let map = PinnedObjectMap::new(true);
        map.add_ref(0x400);
        map.add_ref(0x400);
        map.release(0x400);
        let pinned = map.pinned_objects();
        assert_eq!(pinned.len(), 1);
        let kinds: Vec<_> = pinned[0].history.iter().map(|e| (e.kind, e.count)).collect();
        assert_eq!(
            kinds,
            vec![
                (PinEventKind::AddRef, 1),
                (PinEventKind::AddRef, 2),
                (PinEventKind::Release, 1)
            ]
        );
    }
}
