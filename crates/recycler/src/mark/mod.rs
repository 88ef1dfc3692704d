//! Mark engine.
//!
//! Marking is conservative: any word that resolves to an allocated object
//! through the block map marks that object. Gray objects wait on a
//! per-thread [`MarkContext`] stack until their words are scanned.

mod context;
mod stack;

pub use context::RootMarker;
pub use stack::MarkCandidate;

pub(crate) use context::{MarkContext, MarkEnv};

/// Number of mark contexts: the primary one plus three parallel ones.
pub(crate) const MARK_CONTEXT_COUNT: usize = 4;
