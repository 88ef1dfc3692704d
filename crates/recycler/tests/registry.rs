//! Process-wide registry of recyclers.
//!
//! Kept to a single test: the registry is global to the test binary.

use recycler::flags::COLLECT_NOW_EXHAUSTIVE_SKIP_STACK;
use recycler::registry::{decommit_all_recyclers, registered_recycler_count};
use recycler::{Recycler, RecyclerConfig};

#[test]
fn test_register_decommit_unregister() {
    assert_eq!(registered_recycler_count(), 0);

    let config = RecyclerConfig::in_thread().set_collect_on_allocation(false);
    let first = Recycler::new(config);
    let second = Recycler::new(config);
    assert_eq!(registered_recycler_count(), 2);

    // Free a large batch so the heap holds empty pages.
    let garbage: Vec<usize> = (0..4096).map(|_| first.alloc_zero(256)).collect();
    assert!(garbage.iter().all(|&obj| first.is_valid_object(obj)));
    assert!(first.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK));
    assert_eq!(first.get_used_bytes(), 0);

    // The exhaustive collection already decommitted, so nothing is left.
    assert_eq!(decommit_all_recyclers(), 0);

    drop(first);
    assert_eq!(registered_recycler_count(), 1);
    drop(second);
    assert_eq!(registered_recycler_count(), 0);
    assert_eq!(decommit_all_recyclers(), 0);
}
