//! Low-level virtual memory primitives.
//!
//! A [`Region`] is a range of reserved address space. Pages inside it are
//! committed and decommitted explicitly, which lets a page allocator hand
//! memory back to the OS without giving up the address range.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is the system page size.
/// Reservations placed at a requested address should be aligned to this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// Rounds `len` up to a multiple of the system page size.
#[must_use]
pub fn round_to_pages(len: usize) -> usize {
    let page = page_size();
    len.div_ceil(page) * page
}

/// A reserved range of virtual address space.
///
/// The whole range is released when the handle is dropped.
pub struct Region {
    inner: os::RegionInner,
}

impl Region {
    /// Returns a pointer to the start of the region.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the region in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Returns `true` if `addr` lies inside the region.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr < start + self.len()
    }

    /// Commits `len` bytes starting at `offset`, making them readable and writable.
    ///
    /// Freshly committed memory reads as zero. Committing pages that are
    /// already committed is allowed and leaves their contents intact.
    ///
    /// # Safety
    ///
    /// `offset` and `len` must be page aligned and describe a range inside the region.
    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above, alignment is the caller's contract.
        unsafe { self.inner.commit(offset, len) }
    }

    /// Decommits `len` bytes starting at `offset`.
    ///
    /// The physical memory is returned to the OS. The address range stays
    /// reserved and can be committed again later.
    ///
    /// # Safety
    ///
    /// `offset` and `len` must be page aligned and describe a range inside the
    /// region. No live references into the range may exist.
    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        self.check_range(offset, len)?;
        // SAFETY: range checked above, liveness is the caller's contract.
        unsafe { self.inner.decommit(offset, len) }
    }

    fn check_range(&self, offset: usize, len: usize) -> io::Result<()> {
        let page = page_size();
        if offset % page != 0 || len % page != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range must be page aligned",
            ));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.len() => Ok(()),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "range exceeds region",
            )),
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr())
            .field("len", &self.len())
            .finish()
    }
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

/// Configuration for reserving a region.
#[derive(Debug, Clone)]
pub struct RegionOptions {
    len: usize,
    hint_addr: usize,
    commit: bool,
    no_reserve: bool,
}

impl RegionOptions {
    /// Creates a new `RegionOptions` with default settings (length 0).
    /// You must set a length before reserving.
    pub fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            commit: false,
            no_reserve: true,
        }
    }

    /// Sets the length of the region in bytes. It is rounded up to whole pages.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Sets a hint address for the reservation.
    ///
    /// The OS is free to ignore the hint.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Commits the whole region up front instead of leaving it reserved only.
    pub fn commit(mut self, commit: bool) -> Self {
        self.commit = commit;
        self
    }

    /// Sets whether swap space is reserved for the mapping (on supported platforms).
    ///
    /// On Linux, this toggles `MAP_NORESERVE`.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Reserves the address range.
    ///
    /// # Safety
    ///
    /// The returned region owns raw memory. Pointers derived from it must not
    /// be used after the region is dropped or after the pages are decommitted.
    pub unsafe fn reserve(&self) -> io::Result<Region> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        let inner = unsafe {
            os::RegionInner::reserve(
                self.hint_addr,
                round_to_pages(self.len),
                self.commit,
                self.no_reserve,
            )?
        };

        Ok(Region { inner })
    }
}

impl Default for RegionOptions {
    fn default() -> Self {
        Self::new()
    }
}
