//! Process-wide registry of live recyclers.
//!
//! Every recycler registers itself on construction and unregisters when it
//! shuts down. Process-level memory pressure handlers use the registry to
//! reach every heap at once.

use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use crate::recycler::RecyclerCore;

static REGISTRY: LazyLock<Mutex<Vec<Weak<RecyclerCore>>>> =
    LazyLock::new(|| Mutex::new(Vec::new()));

pub(crate) fn register(core: &Arc<RecyclerCore>) {
    let mut registry = REGISTRY.lock();
    registry.retain(|entry| entry.strong_count() > 0);
    registry.push(Arc::downgrade(core));
}

pub(crate) fn unregister(core: &RecyclerCore) {
    REGISTRY
        .lock()
        .retain(|entry| entry.strong_count() > 0 && !std::ptr::eq(entry.as_ptr(), core));
}

fn live_recyclers() -> Vec<Arc<RecyclerCore>> {
    REGISTRY.lock().iter().filter_map(Weak::upgrade).collect()
}

/// Number of recyclers currently alive in this process.
#[must_use]
pub fn registered_recycler_count() -> usize {
    REGISTRY
        .lock()
        .iter()
        .filter(|entry| entry.strong_count() > 0)
        .count()
}

/// Returns the free pages of every idle recycler to the OS.
///
/// Recyclers in the middle of a collection are skipped. Returns the number
/// of pages decommitted.
pub fn decommit_all_recyclers() -> usize {
    live_recyclers()
        .iter()
        .map(|core| core.decommit_if_idle())
        .sum()
}
