//! Host hooks around collection phases.

use crate::flags::CollectionFlags;
use crate::mark::RootMarker;

/// Callbacks the recycler invokes around each phase of a collection.
///
/// Every method has a no-op default. Callbacks marked as running on the
/// background thread must not touch the mutator's state.
pub trait CollectionWrapper: Send + Sync {
    /// Before a collection starts, on the collecting thread.
    fn pre_collection_callback(&self) {}

    /// During in-thread root finding. Extra roots can be marked through `marker`.
    fn root_mark_callback(&self, marker: &mut RootMarker<'_, '_>) {
        let _ = marker;
    }

    /// Before the in-thread rescan that finishes a concurrent mark.
    fn pre_rescan_mark_callback(&self) {}

    /// A finish-mark wait on the background thread timed out.
    fn rescan_mark_timeout_callback(&self) {}

    /// Marking is complete, before the sweep.
    fn end_mark_callback(&self) {}

    /// On the background thread when it finished its share of the work.
    fn concurrent_callback(&self) {}

    /// Before the mutator blocks on the background thread.
    fn wait_collection_callback(&self) {}

    /// After the sweep, before dispose.
    fn post_sweep_redeferral_callback(&self) {}

    /// After the collection finished.
    fn post_collection_callback(&self) {}

    /// Runs the pending dispose work. Hosts may defer it by not calling `dispose`.
    fn dispose_objects(&self, dispose: &mut dyn FnMut()) {
        dispose();
    }

    /// Wraps every collection. Hosts can set up state around `collect`.
    fn execute_recycler_collection_function(
        &self,
        flags: CollectionFlags,
        collect: &mut dyn FnMut(CollectionFlags) -> bool,
    ) -> bool {
        collect(flags)
    }
}

/// The wrapper used when the host does not install one.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCollectionWrapper;

impl CollectionWrapper for DefaultCollectionWrapper {}
