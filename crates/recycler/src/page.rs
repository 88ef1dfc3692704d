//! Page allocators.
//!
//! Address space is reserved in segments through `sys_alloc` and handed out
//! as runs of [`PAGE_SIZE`] pages. Released pages stay committed in a free
//! cache until a decommit pass returns them to the OS.

use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sys_alloc::{Region, RegionOptions};

use crate::error::GcError;

/// Size of a heap page. Dirty tracking and the block map work at this granularity.
pub const PAGE_SIZE: usize = 4096;

/// Pages reserved per segment.
pub const SEGMENT_PAGES: usize = 256;

/// A run of consecutive pages owned by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRun {
    addr: usize,
    pages: usize,
}

impl PageRun {
    #[must_use]
    pub const fn addr(&self) -> usize {
        self.addr
    }

    #[must_use]
    pub const fn pages(&self) -> usize {
        self.pages
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.pages * PAGE_SIZE
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.pages == 0
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr < self.addr + self.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageState {
    Used,
    Free,
    Decommitted,
}

#[derive(Debug)]
struct Segment {
    region: Region,
    states: Vec<PageState>,
}

impl Segment {
    fn base(&self) -> usize {
        self.region.ptr() as usize
    }

    fn find_run(&self, pages: usize) -> Option<usize> {
        let mut start = 0;
        let mut len = 0;
        for (i, state) in self.states.iter().enumerate() {
            if *state == PageState::Used {
                len = 0;
                start = i + 1;
            } else {
                len += 1;
                if len == pages {
                    return Some(start);
                }
            }
        }
        None
    }

    fn is_unused(&self) -> bool {
        self.states.iter().all(|s| *s != PageState::Used)
    }

    /// Page offset and length of the OS pages covering `[start, start + pages)`.
    fn os_span(&self, start: usize, pages: usize) -> (usize, usize) {
        let os = os_page_size();
        let begin = start * PAGE_SIZE / os * os;
        let end = ((start + pages) * PAGE_SIZE).div_ceil(os) * os;
        (begin, end.min(self.region.len()) - begin)
    }

    /// Decommits every OS page whose logical pages are all free.
    ///
    /// Stops once `budget` pages were decommitted. Returns the decommitted page count.
    fn decommit_free(&mut self, budget: usize) -> usize {
        let per_os = (os_page_size() / PAGE_SIZE).max(1);
        let mut decommitted = 0;
        let mut group = 0;
        while group * per_os < self.states.len() && decommitted < budget {
            let first = group * per_os;
            let last = (first + per_os).min(self.states.len());
            let span = &self.states[first..last];
            let free = span.iter().filter(|s| **s == PageState::Free).count();
            if free > 0 && span.iter().all(|s| *s != PageState::Used) {
                let (offset, len) = self.os_span(first, last - first);
                // SAFETY: every page in the span is free, nothing references it.
                if unsafe { self.region.decommit(offset, len) }.is_ok() {
                    for state in &mut self.states[first..last] {
                        *state = PageState::Decommitted;
                    }
                    decommitted += free;
                }
            }
            group += 1;
        }
        decommitted
    }
}

fn os_page_size() -> usize {
    sys_alloc::page_size().max(PAGE_SIZE)
}

#[derive(Debug, Default)]
struct Inner {
    segments: Vec<Segment>,
    last_release: Option<Instant>,
}

/// Hands out page runs from reserved segments.
#[derive(Debug)]
pub struct PageAllocator {
    name: &'static str,
    inner: Mutex<Inner>,
    max_pages: Option<usize>,
    used_pages: AtomicUsize,
    free_pages: AtomicUsize,
}

impl PageAllocator {
    #[must_use]
    pub const fn new(name: &'static str, max_pages: Option<usize>) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                segments: Vec::new(),
                last_release: None,
            }),
            max_pages,
            used_pages: AtomicUsize::new(0),
            free_pages: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Pages currently handed out.
    #[must_use]
    pub fn used_pages(&self) -> usize {
        self.used_pages.load(Ordering::Relaxed)
    }

    /// Released pages that are still committed.
    #[must_use]
    pub fn free_page_count(&self) -> usize {
        self.free_pages.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.inner.lock().segments.len()
    }

    /// Allocates `pages` consecutive committed pages.
    ///
    /// Contents of recycled pages are unspecified.
    pub fn alloc(&self, pages: usize) -> Result<PageRun, GcError> {
        let pages = pages.max(1);
        if let Some(max) = self.max_pages {
            if self.used_pages() + pages > max {
                return Err(GcError::OutOfMemory {
                    requested: pages * PAGE_SIZE,
                });
            }
        }

        let mut inner = self.inner.lock();
        let found = inner
            .segments
            .iter()
            .enumerate()
            .find_map(|(i, seg)| seg.find_run(pages).map(|start| (i, start)));
        let (index, start) = match found {
            Some(found) => found,
            None => {
                let segment = Self::reserve_segment(pages.max(SEGMENT_PAGES))?;
                inner.segments.push(segment);
                (inner.segments.len() - 1, 0)
            }
        };

        let segment = &mut inner.segments[index];
        let range = start..start + pages;
        let reused = segment.states[range.clone()]
            .iter()
            .filter(|s| **s == PageState::Free)
            .count();
        if reused != pages {
            let (offset, len) = segment.os_span(start, pages);
            // SAFETY: the span lies inside the segment and is page aligned.
            unsafe { segment.region.commit(offset, len) }.map_err(GcError::PageAllocation)?;
        }
        for state in &mut segment.states[range] {
            *state = PageState::Used;
        }
        let addr = segment.base() + start * PAGE_SIZE;
        drop(inner);

        self.free_pages.fetch_sub(reused, Ordering::Relaxed);
        self.used_pages.fetch_add(pages, Ordering::Relaxed);
        Ok(PageRun { addr, pages })
    }

    fn reserve_segment(pages: usize) -> Result<Segment, GcError> {
        // SAFETY: the region is owned by the segment and outlives every run carved from it.
        let region = unsafe { RegionOptions::new().len(pages * PAGE_SIZE).reserve() }
            .map_err(GcError::PageAllocation)?;
        Ok(Segment {
            region,
            states: vec![PageState::Decommitted; pages],
        })
    }

    /// Returns a run to the free cache.
    pub fn release(&self, run: PageRun) {
        let mut inner = self.inner.lock();
        let Some(segment) = inner
            .segments
            .iter_mut()
            .find(|seg| seg.region.contains(run.addr))
        else {
            debug_assert!(false, "released run {run:?} not owned by {}", self.name);
            return;
        };
        let start = (run.addr - segment.base()) / PAGE_SIZE;
        for state in &mut segment.states[start..start + run.pages] {
            debug_assert_eq!(*state, PageState::Used);
            *state = PageState::Free;
        }
        inner.last_release = Some(Instant::now());
        drop(inner);

        self.used_pages.fetch_sub(run.pages, Ordering::Relaxed);
        self.free_pages.fetch_add(run.pages, Ordering::Relaxed);
    }

    /// Decommits free pages until at most `keep` remain committed.
    pub fn decommit_excess(&self, keep: usize) -> usize {
        let current = self.free_page_count();
        if current <= keep {
            return 0;
        }
        let mut budget = current - keep;
        let mut total = 0;
        let mut inner = self.inner.lock();
        for segment in &mut inner.segments {
            if budget == 0 {
                break;
            }
            let done = segment.decommit_free(budget);
            budget = budget.saturating_sub(done);
            total += done;
        }
        drop(inner);
        self.free_pages.fetch_sub(total, Ordering::Relaxed);
        total
    }

    /// Decommits every free page.
    pub fn decommit_now(&self) -> usize {
        self.decommit_excess(0)
    }

    /// Releases segments that have no pages in use.
    pub fn release_empty_segments(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.segments.len();
        let mut freed_pages = 0;
        inner.segments.retain(|segment| {
            if segment.is_unused() {
                freed_pages += segment
                    .states
                    .iter()
                    .filter(|s| **s == PageState::Free)
                    .count();
                false
            } else {
                true
            }
        });
        let released = before - inner.segments.len();
        drop(inner);
        self.free_pages.fetch_sub(freed_pages, Ordering::Relaxed);
        released
    }

    fn last_release(&self) -> Option<Instant> {
        self.inner.lock().last_release
    }
}

/// A page allocator whose free pages are decommitted after an idle period.
///
/// The background thread asks [`IdleDecommitPageAllocator::idle_decommit_wait`]
/// how long it may sleep and calls [`IdleDecommitPageAllocator::idle_decommit`]
/// when that wait elapses.
#[derive(Debug)]
pub struct IdleDecommitPageAllocator {
    pages: PageAllocator,
    idle_decommit_time: Duration,
    suspended: AtomicUsize,
}

impl IdleDecommitPageAllocator {
    #[must_use]
    pub const fn new(name: &'static str, idle_decommit_time: Duration) -> Self {
        Self {
            pages: PageAllocator::new(name, None),
            idle_decommit_time,
            suspended: AtomicUsize::new(0),
        }
    }

    /// Time until the next idle decommit is due, `None` when nothing is pending.
    #[must_use]
    pub fn idle_decommit_wait(&self) -> Option<Duration> {
        if self.suspended.load(Ordering::Acquire) > 0 || self.pages.free_page_count() == 0 {
            return None;
        }
        let released = self.pages.last_release()?;
        Some(
            self.idle_decommit_time
                .saturating_sub(released.elapsed()),
        )
    }

    /// Decommits the free cache if the idle period has passed.
    pub fn idle_decommit(&self) -> usize {
        match self.idle_decommit_wait() {
            Some(wait) if wait.is_zero() => self.pages.decommit_now(),
            _ => 0,
        }
    }

    pub fn suspend_idle_decommit(&self) {
        self.suspended.fetch_add(1, Ordering::AcqRel);
    }

    pub fn resume_idle_decommit(&self) {
        let prev = self.suspended.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced resume_idle_decommit");
    }
}

impl Deref for IdleDecommitPageAllocator {
    type Target = PageAllocator;

    fn deref(&self) -> &PageAllocator {
        &self.pages
    }
}
