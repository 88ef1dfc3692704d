use std::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Boolean state of a recycler that is not part of the phase.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct StatusFlags: u32 {
        const ENABLE_CONCURRENT_MARK = 1 << 0;
        const ENABLE_PARALLEL_MARK = 1 << 1;
        const ENABLE_CONCURRENT_SWEEP = 1 << 2;
        const ENABLE_PARTIAL_COLLECT = 1 << 3;
        const IN_PARTIAL_COLLECT_MODE = 1 << 4;
        const IS_SHUTTING_DOWN = 1 << 5;
        const IS_ABORTING = 1 << 6;
        const IN_EXHAUSTIVE_COLLECTION = 1 << 7;
        const HAS_EXHAUSTIVE_CANDIDATE = 1 << 8;
        const IN_DECOMMIT_NOW_COLLECTION = 1 << 9;
        const IN_CACHE_CLEANUP_COLLECTION = 1 << 10;
        const DECOMMIT_ON_FINISH = 1 << 11;
        const IN_DISPOSE = 1 << 12;
        const ALLOW_DISPOSE = 1 << 13;
        const HAS_DISPOSABLE_OBJECT = 1 << 14;
        const HAS_PENDING_UNPINNED_OBJECT = 1 << 15;
        const HAS_PENDING_CONCURRENT_FIND_ROOT = 1 << 16;
        const HAS_PENDING_DELETE_GUEST_ARENA = 1 << 17;
        const NEED_OOM_RESCAN = 1 << 18;
        const PRIORITY_BOOST = 1 << 19;
        const SKIP_STACK = 1 << 20;
        const QUEUE_TRACKED_OBJECT = 1 << 21;
        const SCAN_PINNED_OBJECT_MAP = 1 << 22;
        const SCAN_IMPLICIT_ROOTS = 1 << 23;
        const PARTIAL_REQUESTED = 1 << 24;
        const COLLECTION_DISABLED = 1 << 25;
    }
}

/// [`StatusFlags`] shared between the mutator and the collector threads.
#[derive(Debug)]
pub(crate) struct AtomicStatus(AtomicU32);

impl AtomicStatus {
    pub const fn new(flags: StatusFlags) -> Self {
        Self(AtomicU32::new(flags.bits()))
    }

    pub fn load(&self) -> StatusFlags {
        StatusFlags::from_bits_retain(self.0.load(Ordering::Acquire))
    }

    pub fn contains(&self, flags: StatusFlags) -> bool {
        self.load().contains(flags)
    }

    pub fn insert(&self, flags: StatusFlags) {
        self.0.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove(&self, flags: StatusFlags) {
        self.0.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub fn set(&self, flags: StatusFlags, value: bool) {
        if value {
            self.insert(flags);
        } else {
            self.remove(flags);
        }
    }

    /// Clears `flags` and reports whether any of them was set.
    pub fn take(&self, flags: StatusFlags) -> bool {
        StatusFlags::from_bits_retain(self.0.fetch_and(!flags.bits(), Ordering::AcqRel))
            .intersects(flags)
    }
}
