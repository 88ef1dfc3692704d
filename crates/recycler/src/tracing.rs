//! Collection tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for collection cycles and their phases.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// Phases of a collection cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Phase {
        /// Clear mark bits and reset the write watch.
        ResetMarks,
        /// Mark pinned objects, arenas, implicit roots and the stack.
        FindRoots,
        /// Drain the mark stacks.
        Mark,
        /// Rescan roots and dirty pages before sweeping.
        Rescan,
        /// Release unmarked objects.
        Sweep,
        /// Run dispose for finalized objects.
        Dispose,
    }

    /// Identifier correlating every event of one collection.
    ///
    /// Monotonically increasing, starting at 1.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectionId(pub u64);

    static NEXT_COLLECTION_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next collection id.
    pub fn next_collection_id() -> CollectionId {
        CollectionId(NEXT_COLLECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for a whole collection.
    pub fn trace_collection(kind: &str, id: CollectionId) -> span::EnteredSpan {
        span!(Level::DEBUG, "recycler_collect", kind = kind, collection_id = id.0).entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: Phase) -> span::EnteredSpan {
        span!(Level::DEBUG, "recycler_phase", phase = ?phase).entered()
    }

    /// Log the start of a phase.
    pub fn log_phase_start(phase: Phase, used_bytes: usize) {
        tracing::debug!(phase = ?phase, used_bytes, "phase_start");
    }

    /// Log the end of a phase.
    pub fn log_phase_end(phase: Phase, bytes: usize) {
        tracing::debug!(phase = ?phase, bytes, "phase_end");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CollectionId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_collection_id() -> CollectionId {
        CollectionId(0)
    }
}

pub use internal::{next_collection_id, CollectionId};
