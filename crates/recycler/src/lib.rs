//! A concurrent, partial, conservative mark-and-sweep garbage collector for
//! language runtimes.
//!
//! `recycler` manages a heap of untyped, word-addressed objects on behalf of
//! a host runtime. Every word of a scanned object, every pinned object,
//! every guest arena word and the mutator's stack are treated as potential
//! pointers, so the host needs no precise type information.
//!
//! # Features
//!
//! - **Concurrent mark**: reset-marks, root finding and marking run on a
//!   background thread; a write watch records mutator stores for the rescan
//! - **Parallel mark**: the mark stack is split across up to three helpers
//! - **Concurrent sweep**: freeing runs in the background, swept blocks are
//!   handed back at a rendezvous
//! - **Partial collection**: marks survive a cycle and only roots and dirty
//!   pages are rescanned
//! - **Fail-safe mark**: a mark stack that cannot grow triggers a low-memory
//!   rescan instead of a crash
//!
//! # Quick Start
//!
//! ```
//! use recycler::{Recycler, RecyclerConfig};
//! use recycler::flags::COLLECT_NOW_EXHAUSTIVE_SKIP_STACK;
//!
//! let recycler = Recycler::new(RecyclerConfig::in_thread());
//! let list = recycler.alloc_zero(64);
//! let item = recycler.alloc_zero(16);
//! recycler.store(list, 0, item).unwrap();
//! recycler.root_add_ref(list);
//!
//! recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK);
//! assert!(recycler.is_valid_object(item));
//!
//! recycler.root_release(list);
//! recycler.collect_now(COLLECT_NOW_EXHAUSTIVE_SKIP_STACK);
//! assert!(!recycler.is_valid_object(item));
//! ```
//!
//! # Concurrent collection
//!
//! ```
//! use recycler::{Recycler, RecyclerConfig};
//! use recycler::flags::{COLLECT_NOW_CONCURRENT, FORCE_FINISH_COLLECTION};
//!
//! let recycler = Recycler::new(RecyclerConfig::new().set_collect_on_allocation(false));
//! let root = recycler.alloc_zero(32);
//! recycler.root_add_ref(root);
//!
//! // Marking proceeds on the background thread.
//! recycler.collect_now(COLLECT_NOW_CONCURRENT);
//! // ... the mutator keeps running ...
//! recycler.finish_concurrent(FORCE_FINISH_COLLECTION);
//! assert!(!recycler.collection_in_progress());
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

mod arena;
mod config;
mod error;
mod event;
mod mark;
mod page;
mod pin;
mod recycler;
mod stack;
mod state;
mod weak;
mod wrapper;

/// Collector threads and the host thread service hook.
pub mod background;

/// Named [`CollectionFlags`] combinations used by hosts.
pub mod flags;

/// Heap storage internals.
///
/// Public for diagnostics and tests. Hosts normally go through [`Recycler`].
pub mod heap;

/// Generic job queues run in thread or on background threads.
pub mod jobs;

/// Collection statistics and process-wide counters.
pub mod metrics;

/// The process-wide registry of live recyclers.
pub mod registry;

/// Collection ids and, with the `tracing` feature, spans for cycles and phases.
pub mod tracing;

pub use arena::GuestArena;
pub use background::ThreadService;
pub use config::{RecyclerConfig, RecyclerHeuristic};
pub use error::{FatalError, GcError, MarkOutcome};
pub use event::{Event, WaitOutcome};
pub use flags::CollectionFlags;
pub use heap::{Finalizer, HeapObjectInfo, ObjectInfoBits};
pub use mark::RootMarker;
pub use metrics::{CollectionKind, CollectionStats};
pub use pin::{PinEvent, PinEventKind, PinnedObject};
pub use recycler::{BeforeCollectCallback, ExternalRootMarker, OutOfMemoryCallback, Recycler};
pub use state::CollectionState;
pub use wrapper::{CollectionWrapper, DefaultCollectionWrapper};
