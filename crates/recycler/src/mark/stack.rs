//! Page-backed gray stack.
//!
//! A small reserved array sits at the bottom of every stack so marking can
//! always make progress. Beyond it the stack grows one page at a time from
//! the mark-stack page allocator; when that fails the push is refused and
//! the caller falls back to the low-memory rescan.

use std::sync::Arc;

use crate::page::{PageAllocator, PageRun, PAGE_SIZE};

/// Entries held by the reserved bottom of every stack.
pub const MARK_STACK_RESERVED_ENTRIES: usize = 256;

const CHUNK_ENTRIES: usize = PAGE_SIZE / std::mem::size_of::<MarkCandidate>();

/// A marked object waiting to be scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkCandidate {
    pub obj: usize,
    pub size: usize,
}

#[derive(Debug)]
struct Chunk {
    run: PageRun,
    len: usize,
}

impl Chunk {
    const fn new(run: PageRun) -> Self {
        Self { run, len: 0 }
    }

    const fn is_full(&self) -> bool {
        self.len == CHUNK_ENTRIES
    }

    fn push(&mut self, candidate: MarkCandidate) {
        debug_assert!(!self.is_full());
        // SAFETY: the run is a committed page owned by this chunk and `len`
        // stays within its capacity.
        unsafe {
            (self.run.addr() as *mut MarkCandidate)
                .add(self.len)
                .write(candidate);
        }
        self.len += 1;
    }

    fn pop(&mut self) -> Option<MarkCandidate> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        // SAFETY: entries below `len` were written by `push`.
        Some(unsafe { (self.run.addr() as *const MarkCandidate).add(self.len).read() })
    }
}

/// Growable LIFO stack of mark candidates.
#[derive(Debug)]
pub struct PageStack {
    reserved: Vec<MarkCandidate>,
    chunks: Vec<Chunk>,
    spare: Option<PageRun>,
    pages: Arc<PageAllocator>,
}

impl PageStack {
    #[must_use]
    pub fn new(pages: Arc<PageAllocator>) -> Self {
        Self {
            reserved: Vec::with_capacity(MARK_STACK_RESERVED_ENTRIES),
            chunks: Vec::new(),
            spare: None,
            pages,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.reserved.len() + self.chunks.iter().map(|c| c.len).sum::<usize>()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reserved.is_empty() && self.chunks.iter().all(|c| c.len == 0)
    }

    /// Pushes `candidate`. Returns `false` if no page could be obtained.
    pub fn push(&mut self, candidate: MarkCandidate) -> bool {
        if self.chunks.is_empty() && self.reserved.len() < MARK_STACK_RESERVED_ENTRIES {
            self.reserved.push(candidate);
            return true;
        }
        if let Some(top) = self.chunks.last_mut() {
            if !top.is_full() {
                top.push(candidate);
                return true;
            }
        }
        let run = match self.spare.take() {
            Some(run) => run,
            None => match self.pages.alloc(1) {
                Ok(run) => run,
                Err(_) => return false,
            },
        };
        let mut chunk = Chunk::new(run);
        chunk.push(candidate);
        self.chunks.push(chunk);
        true
    }

    pub fn pop(&mut self) -> Option<MarkCandidate> {
        while let Some(top) = self.chunks.last_mut() {
            if let Some(candidate) = top.pop() {
                if top.len == 0 {
                    self.retire_top();
                }
                return Some(candidate);
            }
            self.retire_top();
        }
        self.reserved.pop()
    }

    fn retire_top(&mut self) {
        if let Some(chunk) = self.chunks.pop() {
            match self.spare {
                None => self.spare = Some(chunk.run),
                Some(_) => self.pages.release(chunk.run),
            }
        }
    }

    /// Drops every entry and returns all pages.
    pub fn clear(&mut self) {
        self.reserved.clear();
        for chunk in self.chunks.drain(..) {
            self.pages.release(chunk.run);
        }
        if let Some(run) = self.spare.take() {
            self.pages.release(run);
        }
    }
}

impl Drop for PageStack {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(i: usize) -> MarkCandidate {
        MarkCandidate {
            obj: i * 16,
            size: 16,
        }
    }

    #[test]
    fn test_reserved_entries_need_no_pages() {
        let pages = Arc::new(PageAllocator::new("mark", Some(0)));
        let mut stack = PageStack::new(Arc::clone(&pages));
        for i in 0..MARK_STACK_RESERVED_ENTRIES {
            assert!(stack.push(candidate(i)));
        }
        assert!(!stack.push(candidate(0)));
        assert_eq!(stack.len(), MARK_STACK_RESERVED_ENTRIES);
        assert_eq!(pages.used_pages(), 0);
    }

    #[test]
    fn test_grows_into_pages_and_pops_lifo() {
        let pages = Arc::new(PageAllocator::new("mark", None));
        let mut stack = PageStack::new(Arc::clone(&pages));
        let total = MARK_STACK_RESERVED_ENTRIES + CHUNK_ENTRIES + 3;
        for i in 0..total {
            assert!(stack.push(candidate(i)));
        }
        assert_eq!(stack.len(), total);
        assert_eq!(pages.used_pages(), 2);

        for i in (0..total).rev() {
            assert_eq!(stack.pop(), Some(candidate(i)));
        }
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), None);
        // One page is kept as a spare.
        assert_eq!(pages.used_pages(), 1);

        drop(stack);
        assert_eq!(pages.used_pages(), 0);
    }

    #[test]
    fn test_clear_releases_pages() {
        let pages = Arc::new(PageAllocator::new("mark", None));
        let mut stack = PageStack::new(Arc::clone(&pages));
        for i in 0..MARK_STACK_RESERVED_ENTRIES + 1 {
            stack.push(candidate(i));
        }
        assert_eq!(pages.used_pages(), 1);
        stack.clear();
        assert!(stack.is_empty());
        assert_eq!(pages.used_pages(), 0);
    }
}
