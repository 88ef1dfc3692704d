//! Per-thread mark state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;

use super::stack::{MarkCandidate, PageStack};
use crate::error::MarkOutcome;
use crate::heap::{word_at, HeapInfo, ObjectInfoBits, GRANULE};
use crate::page::PageAllocator;

const WORD: usize = std::mem::size_of::<usize>();

/// Objects scanned between abort checks.
const ABORT_CHECK_INTERVAL: usize = 64;

/// Shared inputs of every mark context in a phase.
#[derive(Clone, Copy)]
pub(crate) struct MarkEnv<'a> {
    pub heap: &'a HeapInfo,
    /// Tracked objects deferred while marking in parallel.
    pub tracked: &'a SegQueue<MarkCandidate>,
    pub queue_tracked: bool,
    pub interior: bool,
    pub abort: &'a AtomicBool,
}

impl std::fmt::Debug for MarkEnv<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarkEnv")
            .field("queue_tracked", &self.queue_tracked)
            .field("interior", &self.interior)
            .finish_non_exhaustive()
    }
}

/// Gray-object stack of one marking thread.
#[derive(Debug)]
pub(crate) struct MarkContext {
    stack: PageStack,
    need_oom_rescan: bool,
    marked_objects: usize,
    marked_bytes: usize,
    scanned_bytes: usize,
}

impl MarkContext {
    pub fn new(pages: Arc<PageAllocator>) -> Self {
        Self {
            stack: PageStack::new(pages),
            need_oom_rescan: false,
            marked_objects: 0,
            marked_bytes: 0,
            scanned_bytes: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub const fn need_oom_rescan(&self) -> bool {
        self.need_oom_rescan
    }

    pub fn clear_oom(&mut self) {
        self.need_oom_rescan = false;
    }

    /// Marks the object `candidate` resolves to, if any.
    ///
    /// Returns `true` if an object was newly marked.
    pub fn mark(&mut self, env: &MarkEnv<'_>, candidate: usize) -> bool {
        if candidate < GRANULE || (!env.interior && candidate % GRANULE != 0) {
            return false;
        }
        let found = env.heap.map().with_block(candidate, |block| {
            let slot = block.find_slot(candidate, env.interior)?;
            block
                .try_mark(slot)
                .then(|| (block.slot_addr(slot), block.object_size(), block.info(slot)))
        });
        let Some(Some((obj, size, bits))) = found else {
            return false;
        };
        self.marked_objects += 1;
        self.marked_bytes += size;
        if bits.contains(ObjectInfoBits::LEAF) {
            return true;
        }
        let candidate = MarkCandidate { obj, size };
        if env.queue_tracked && bits.contains(ObjectInfoBits::TRACK) {
            env.tracked.push(candidate);
        } else {
            self.push(candidate);
        }
        true
    }

    /// Queues an already marked object for scanning.
    pub fn push(&mut self, candidate: MarkCandidate) {
        if !self.stack.push(candidate) {
            self.need_oom_rescan = true;
        }
    }

    /// Marks every word of `[start, start + len)` as a potential pointer.
    ///
    /// # Safety
    ///
    /// The range must be readable and word aligned.
    pub unsafe fn scan_memory(&mut self, env: &MarkEnv<'_>, start: usize, len: usize) {
        for offset in (0..len).step_by(WORD) {
            // SAFETY: forwarded from the caller.
            let word = unsafe { word_at(start + offset) }.load(Ordering::Relaxed);
            self.mark(env, word);
        }
        self.scanned_bytes += len;
    }

    /// Marks every value of `words` as a potential pointer.
    pub fn scan_words(&mut self, env: &MarkEnv<'_>, words: &[usize]) {
        for &word in words {
            self.mark(env, word);
        }
        self.scanned_bytes += std::mem::size_of_val(words);
    }

    /// Scans gray objects until the stack is empty.
    pub fn process_mark(&mut self, env: &MarkEnv<'_>) -> MarkOutcome {
        let mut scanned = 0usize;
        while let Some(MarkCandidate { obj, size }) = self.stack.pop() {
            // SAFETY: candidates are allocated heap objects; nothing frees
            // memory while a mark phase runs.
            unsafe { self.scan_memory(env, obj, size) };
            scanned += 1;
            if scanned % ABORT_CHECK_INTERVAL == 0 && env.abort.load(Ordering::Acquire) {
                return MarkOutcome::Aborted;
            }
        }
        if self.need_oom_rescan {
            MarkOutcome::OutOfMemory
        } else {
            MarkOutcome::Completed
        }
    }

    /// Moves part of this stack into `others` so they can mark in parallel.
    ///
    /// Returns `false` when there was too little work to share.
    pub fn split(&mut self, others: &mut [&mut Self]) -> bool {
        let total = self.stack.len();
        if others.is_empty() || total < others.len() + 1 {
            return false;
        }
        let share = total * others.len() / (others.len() + 1);
        for i in 0..share {
            let Some(candidate) = self.stack.pop() else {
                break;
            };
            let target = &mut others[i % others.len()];
            if !target.stack.push(candidate) {
                self.push(candidate);
                break;
            }
        }
        true
    }

    /// Drops pending work. The objects stay marked.
    pub fn abort(&mut self) {
        self.stack.clear();
        self.need_oom_rescan = false;
    }

    /// Moves the counters of `other` into this context.
    pub fn merge_stats(&mut self, other: &mut Self) {
        let (objects, bytes, scanned) = other.take_stats();
        self.marked_objects += objects;
        self.marked_bytes += bytes;
        self.scanned_bytes += scanned;
    }

    /// Returns and resets `(marked objects, marked bytes, scanned bytes)`.
    pub fn take_stats(&mut self) -> (usize, usize, usize) {
        (
            std::mem::take(&mut self.marked_objects),
            std::mem::take(&mut self.marked_bytes),
            std::mem::take(&mut self.scanned_bytes),
        )
    }
}

/// Handle given to external root markers.
pub struct RootMarker<'a, 'env> {
    context: &'a mut MarkContext,
    env: &'a MarkEnv<'env>,
}

impl<'a, 'env> RootMarker<'a, 'env> {
    pub(crate) fn new(context: &'a mut MarkContext, env: &'a MarkEnv<'env>) -> Self {
        Self { context, env }
    }

    /// Marks the object `addr` points at, if it is a heap object.
    pub fn mark(&mut self, addr: usize) {
        self.context.mark(self.env, addr);
    }

    /// Marks every word of `words` that points at a heap object.
    pub fn mark_words(&mut self, words: &[usize]) {
        self.context.scan_words(self.env, words);
    }
}

impl std::fmt::Debug for RootMarker<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootMarker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecyclerHeuristic;

    struct Fixture {
        heap: HeapInfo,
        tracked: SegQueue<MarkCandidate>,
        abort: AtomicBool,
        pages: Arc<PageAllocator>,
    }

    impl Fixture {
        fn new(limit: Option<usize>) -> Self {
            Self {
                heap: HeapInfo::new(&RecyclerHeuristic::default()),
                tracked: SegQueue::new(),
                abort: AtomicBool::new(false),
                pages: Arc::new(PageAllocator::new("mark", limit)),
            }
        }

        fn env(&self, queue_tracked: bool) -> MarkEnv<'_> {
            MarkEnv {
                heap: &self.heap,
                tracked: &self.tracked,
                queue_tracked,
                interior: false,
                abort: &self.abort,
            }
        }

        fn marked(&self, obj: usize) -> bool {
            self.heap.find_object(obj, false).unwrap().marked
        }
    }

    #[test]
    fn test_mark_transitive() {
        let fx = Fixture::new(None);
        let a = fx.heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        let b = fx.heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        let c = fx.heap.alloc(16, ObjectInfoBits::LEAF).unwrap();
        let unreached = fx.heap.alloc(16, ObjectInfoBits::empty()).unwrap();
        fx.heap.store(a, 0, b).unwrap();
        fx.heap.store(b, 1, c).unwrap();

        let env = fx.env(false);
        let mut ctx = MarkContext::new(Arc::clone(&fx.pages));
        assert!(ctx.mark(&env, a));
        assert!(!ctx.mark(&env, a));
        assert_eq!(ctx.process_mark(&env), MarkOutcome::Completed);
        assert!(ctx.is_empty());

        assert!(fx.marked(a) && fx.marked(b) && fx.marked(c));
        assert!(!fx.marked(unreached));
    }

    #[test]
    fn test_non_pointers_ignored() {
        let fx = Fixture::new(None);
        let a = fx.heap.alloc(32, ObjectInfoBits::empty()).unwrap();
        let env = fx.env(false);
        let mut ctx = MarkContext::new(Arc::clone(&fx.pages));
        assert!(!ctx.mark(&env, 0));
        assert!(!ctx.mark(&env, 7));
        assert!(!ctx.mark(&env, a + 8));
        assert!(!ctx.mark(&env, usize::MAX & !15));
        assert!(!fx.marked(a));
    }

    #[test]
    fn test_tracked_objects_queued_in_parallel_phase() {
        let fx = Fixture::new(None);
        let tracked = fx.heap.alloc(16, ObjectInfoBits::TRACK).unwrap();
        let env = fx.env(true);
        let mut ctx = MarkContext::new(Arc::clone(&fx.pages));
        assert!(ctx.mark(&env, tracked));
        assert!(ctx.is_empty());
        assert_eq!(fx.tracked.pop().map(|c| c.obj), Some(tracked));
    }

    #[test]
    fn test_split_shares_work() {
        let fx = Fixture::new(None);
        let env = fx.env(false);
        let mut main = MarkContext::new(Arc::clone(&fx.pages));
        let objects: Vec<usize> = (0..30)
            .map(|_| fx.heap.alloc(16, ObjectInfoBits::empty()).unwrap())
            .collect();
        for &obj in &objects {
            main.mark(&env, obj);
        }
        let mut a = MarkContext::new(Arc::clone(&fx.pages));
        let mut b = MarkContext::new(Arc::clone(&fx.pages));
        assert!(main.split(&mut [&mut a, &mut b]));
        assert_eq!(main.len() + a.len() + b.len(), 30);
        assert_eq!(a.len(), 10);
        assert_eq!(b.len(), 10);
    }

    #[test]
    fn test_stack_growth_failure_sets_oom() {
        let fx = Fixture::new(Some(0));
        let env = fx.env(false);
        let mut ctx = MarkContext::new(Arc::clone(&fx.pages));
        for _ in 0..=crate::mark::stack::MARK_STACK_RESERVED_ENTRIES {
            let obj = fx.heap.alloc(16, ObjectInfoBits::empty()).unwrap();
            ctx.mark(&env, obj);
        }
        assert!(ctx.need_oom_rescan());
        assert_eq!(ctx.process_mark(&env), MarkOutcome::OutOfMemory);
        ctx.clear_oom();
        assert!(!ctx.need_oom_rescan());
    }
}
