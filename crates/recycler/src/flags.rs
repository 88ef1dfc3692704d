//! Collection request flags and the named policies hosts pass to `collect_now`.

use bitflags::bitflags;

bitflags! {
    /// Heuristic, override and mode bits describing a collection request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CollectionFlags: u32 {
        // Heuristics
        const HEURISTIC_ALLOC_SIZE = 0x0000_0001;
        const HEURISTIC_TIME = 0x0000_0002;
        const HEURISTIC_TIME_IF_SCRIPT_ACTIVE = 0x0000_0004;
        const HEURISTIC_TIME_IF_IN_SCRIPT = 0x0000_0008;
        const HEURISTIC_NEVER = 0x0000_0080;

        // Overrides
        const FINISH_CONCURRENT = 0x0000_0100;
        const EXHAUSTIVE_CANDIDATE = 0x0000_0200;
        const FORCE_IN_THREAD = 0x0000_0400;
        const ALLOW_DISPOSE = 0x0000_0800;
        const ALLOW_REENTRANT = 0x0000_1000;
        const FORCE_FINISH = 0x0000_2000;
        const EXPLICIT = 0x0000_4000;
        const DISABLE_IDLE_FINISH = 0x0000_8000;
        const BACKGROUND_FINISH_MARK = 0x0001_0000;
        const FINISH_CONCURRENT_TIMEOUT = 0x0002_0000;
        const NO_EXHAUSTIVE_COLLECT = 0x0004_0000;
        const SKIP_STACK = 0x0100_0000;
        const CHECK_SCRIPT_CONTEXT_CLOSE = 0x0200_0000;

        // Modes
        const PARTIAL = 0x0800_0000;
        const CONCURRENT = 0x1000_0000;
        const EXHAUSTIVE = 0x2000_0000;
        const DECOMMIT_NOW = 0x4000_0000;
        const CACHE_CLEANUP = 0x8000_0000;
    }
}

impl CollectionFlags {
    /// All heuristic bits.
    pub const HEURISTICS: Self = Self::HEURISTIC_ALLOC_SIZE
        .union(Self::HEURISTIC_TIME)
        .union(Self::HEURISTIC_TIME_IF_SCRIPT_ACTIVE)
        .union(Self::HEURISTIC_TIME_IF_IN_SCRIPT)
        .union(Self::HEURISTIC_NEVER);

    /// Heuristic bits that consult the collection clock.
    pub const TIME_HEURISTICS: Self = Self::HEURISTIC_TIME
        .union(Self::HEURISTIC_TIME_IF_SCRIPT_ACTIVE)
        .union(Self::HEURISTIC_TIME_IF_IN_SCRIPT);

    /// `true` when the request consults a heuristic before collecting.
    #[must_use]
    pub const fn has_heuristic(self) -> bool {
        self.intersects(Self::HEURISTICS)
    }

    /// A forced in-thread request may not run concurrent or partial work.
    #[must_use]
    pub const fn is_consistent(self) -> bool {
        !(self.contains(Self::FORCE_IN_THREAD)
            && self.intersects(Self::CONCURRENT.union(Self::PARTIAL)))
    }
}

impl Default for CollectionFlags {
    fn default() -> Self {
        COLLECT_NOW_DEFAULT
    }
}

pub const COLLECT_NOW_FORCE_IN_THREAD: CollectionFlags = CollectionFlags::FORCE_IN_THREAD;
pub const COLLECT_NOW_FORCE_IN_THREAD_EXTERNAL: CollectionFlags =
    CollectionFlags::FORCE_IN_THREAD.union(CollectionFlags::ALLOW_DISPOSE);
pub const COLLECT_NOW_FORCE_IN_THREAD_EXTERNAL_NO_STACK: CollectionFlags =
    COLLECT_NOW_FORCE_IN_THREAD_EXTERNAL.union(CollectionFlags::SKIP_STACK);
pub const COLLECT_NOW_DEFAULT: CollectionFlags = CollectionFlags::FINISH_CONCURRENT;
pub const COLLECT_NOW_DEFAULT_LS_CLEANUP: CollectionFlags =
    CollectionFlags::FINISH_CONCURRENT.union(CollectionFlags::ALLOW_DISPOSE);
pub const COLLECT_NOW_DECOMMIT_NOW_EXPLICIT: CollectionFlags = COLLECT_NOW_DEFAULT
    .union(CollectionFlags::DECOMMIT_NOW)
    .union(CollectionFlags::CACHE_CLEANUP)
    .union(CollectionFlags::EXPLICIT)
    .union(CollectionFlags::ALLOW_DISPOSE);
pub const COLLECT_NOW_CONCURRENT: CollectionFlags =
    CollectionFlags::FINISH_CONCURRENT.union(CollectionFlags::CONCURRENT);
pub const COLLECT_NOW_EXHAUSTIVE: CollectionFlags = CollectionFlags::FINISH_CONCURRENT
    .union(CollectionFlags::EXHAUSTIVE)
    .union(CollectionFlags::ALLOW_DISPOSE);
pub const COLLECT_NOW_EXHAUSTIVE_SKIP_STACK: CollectionFlags =
    COLLECT_NOW_EXHAUSTIVE.union(CollectionFlags::SKIP_STACK);
pub const COLLECT_NOW_PARTIAL: CollectionFlags =
    CollectionFlags::FINISH_CONCURRENT.union(CollectionFlags::PARTIAL);
pub const COLLECT_NOW_CONCURRENT_PARTIAL: CollectionFlags =
    COLLECT_NOW_PARTIAL.union(CollectionFlags::CONCURRENT);
pub const COLLECT_NOW_FINAL_GC: CollectionFlags = COLLECT_NOW_EXHAUSTIVE
    .union(CollectionFlags::FORCE_IN_THREAD)
    .union(CollectionFlags::SKIP_STACK)
    .union(CollectionFlags::EXPLICIT)
    .union(CollectionFlags::ALLOW_DISPOSE);

pub const COLLECT_ON_ALLOCATION: CollectionFlags = CollectionFlags::HEURISTIC_ALLOC_SIZE
    .union(CollectionFlags::HEURISTIC_TIME)
    .union(CollectionFlags::CONCURRENT)
    .union(CollectionFlags::PARTIAL)
    .union(CollectionFlags::FINISH_CONCURRENT)
    .union(CollectionFlags::ALLOW_REENTRANT)
    .union(CollectionFlags::FINISH_CONCURRENT_TIMEOUT);
pub const COLLECT_ON_TYPED_ARRAY_ALLOCATION: CollectionFlags =
    COLLECT_ON_ALLOCATION.union(CollectionFlags::ALLOW_DISPOSE);
pub const COLLECT_ON_SCRIPT_IDLE: CollectionFlags = CollectionFlags::CHECK_SCRIPT_CONTEXT_CLOSE
    .union(CollectionFlags::HEURISTIC_ALLOC_SIZE)
    .union(CollectionFlags::HEURISTIC_TIME)
    .union(CollectionFlags::CONCURRENT)
    .union(CollectionFlags::PARTIAL)
    .union(CollectionFlags::FINISH_CONCURRENT)
    .union(CollectionFlags::ALLOW_DISPOSE)
    .union(CollectionFlags::FINISH_CONCURRENT_TIMEOUT);
pub const COLLECT_ON_SCRIPT_EXIT: CollectionFlags = CollectionFlags::CHECK_SCRIPT_CONTEXT_CLOSE
    .union(CollectionFlags::HEURISTIC_ALLOC_SIZE)
    .union(CollectionFlags::HEURISTIC_TIME_IF_SCRIPT_ACTIVE)
    .union(CollectionFlags::CONCURRENT)
    .union(CollectionFlags::PARTIAL)
    .union(CollectionFlags::FINISH_CONCURRENT)
    .union(CollectionFlags::ALLOW_DISPOSE)
    .union(CollectionFlags::FINISH_CONCURRENT_TIMEOUT);
pub const COLLECT_EXHAUSTIVE_CANDIDATE: CollectionFlags =
    CollectionFlags::HEURISTIC_NEVER.union(CollectionFlags::EXHAUSTIVE_CANDIDATE);
pub const COLLECT_ON_SCRIPT_CLOSE_NON_PRIMARY: CollectionFlags = COLLECT_NOW_CONCURRENT
    .union(CollectionFlags::EXHAUSTIVE_CANDIDATE)
    .union(CollectionFlags::ALLOW_DISPOSE);
pub const COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY: CollectionFlags =
    CollectionFlags::FORCE_IN_THREAD.union(CollectionFlags::DECOMMIT_NOW);
pub const COLLECT_ON_SUSPEND_CLEANUP: CollectionFlags = COLLECT_NOW_CONCURRENT
    .union(CollectionFlags::EXHAUSTIVE)
    .union(CollectionFlags::DECOMMIT_NOW)
    .union(CollectionFlags::DISABLE_IDLE_FINISH);

pub const FINISH_CONCURRENT_ON_IDLE: CollectionFlags =
    CollectionFlags::CONCURRENT.union(CollectionFlags::DISABLE_IDLE_FINISH);
pub const FINISH_CONCURRENT_ON_IDLE_AT_ROOT: CollectionFlags =
    FINISH_CONCURRENT_ON_IDLE.union(CollectionFlags::SKIP_STACK);
pub const FINISH_CONCURRENT_ON_EXIT_SCRIPT: CollectionFlags = CollectionFlags::CONCURRENT
    .union(CollectionFlags::DISABLE_IDLE_FINISH)
    .union(CollectionFlags::BACKGROUND_FINISH_MARK);
pub const FINISH_CONCURRENT_ON_ENTER_SCRIPT: CollectionFlags = FINISH_CONCURRENT_ON_EXIT_SCRIPT;
pub const FINISH_CONCURRENT_ON_ALLOCATION: CollectionFlags = FINISH_CONCURRENT_ON_EXIT_SCRIPT;
pub const FINISH_DISPOSE: CollectionFlags = CollectionFlags::ALLOW_DISPOSE;
pub const FINISH_DISPOSE_TIMED: CollectionFlags =
    CollectionFlags::ALLOW_DISPOSE.union(CollectionFlags::HEURISTIC_TIME_IF_SCRIPT_ACTIVE);
pub const FORCE_FINISH_COLLECTION: CollectionFlags =
    CollectionFlags::FORCE_FINISH.union(CollectionFlags::FORCE_IN_THREAD);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_policies_are_consistent() {
        for flags in [
            COLLECT_NOW_FORCE_IN_THREAD,
            COLLECT_NOW_FORCE_IN_THREAD_EXTERNAL,
            COLLECT_NOW_FORCE_IN_THREAD_EXTERNAL_NO_STACK,
            COLLECT_NOW_DEFAULT,
            COLLECT_NOW_DEFAULT_LS_CLEANUP,
            COLLECT_NOW_DECOMMIT_NOW_EXPLICIT,
            COLLECT_NOW_CONCURRENT,
            COLLECT_NOW_EXHAUSTIVE,
            COLLECT_NOW_EXHAUSTIVE_SKIP_STACK,
            COLLECT_NOW_PARTIAL,
            COLLECT_NOW_CONCURRENT_PARTIAL,
            COLLECT_NOW_FINAL_GC,
            COLLECT_ON_ALLOCATION,
            COLLECT_ON_TYPED_ARRAY_ALLOCATION,
            COLLECT_ON_SCRIPT_IDLE,
            COLLECT_ON_SCRIPT_EXIT,
            COLLECT_EXHAUSTIVE_CANDIDATE,
            COLLECT_ON_SCRIPT_CLOSE_NON_PRIMARY,
            COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY,
            COLLECT_ON_SUSPEND_CLEANUP,
            FINISH_CONCURRENT_ON_IDLE,
            FINISH_CONCURRENT_ON_IDLE_AT_ROOT,
            FINISH_CONCURRENT_ON_EXIT_SCRIPT,
            FINISH_DISPOSE,
            FINISH_DISPOSE_TIMED,
            FORCE_FINISH_COLLECTION,
        ] {
            assert!(flags.is_consistent(), "{flags:?} mixes forced and concurrent work");
        }
    }

    #[test]
    fn test_heuristic_detection() {
        assert!(COLLECT_ON_ALLOCATION.has_heuristic());
        assert!(COLLECT_EXHAUSTIVE_CANDIDATE.has_heuristic());
        assert!(!COLLECT_NOW_EXHAUSTIVE.has_heuristic());
        assert!(!COLLECT_ON_RECOVER_FROM_OUT_OF_MEMORY.has_heuristic());
    }

    #[test]
    fn test_inconsistent_request_detected() {
        let bad = CollectionFlags::FORCE_IN_THREAD | CollectionFlags::CONCURRENT;
        assert!(!bad.is_consistent());
    }
}
