use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
))]
const MAP_NORESERVE: libc::c_int = libc::MAP_NORESERVE;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_vendor = "apple",
    target_os = "netbsd",
    target_os = "solaris",
    target_os = "illumos",
)))]
const MAP_NORESERVE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct RegionInner {
    ptr: *mut libc::c_void,
    len: usize,
    no_reserve: bool,
}

impl RegionInner {
    /// Reserves `len` bytes of address space, optionally committing them.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap`.
    pub unsafe fn reserve(
        hint_addr: usize,
        len: usize,
        commit: bool,
        no_reserve: bool,
    ) -> io::Result<RegionInner> {
        let addr = if hint_addr == 0 {
            ptr::null_mut()
        } else {
            hint_addr as *mut libc::c_void
        };

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | if no_reserve { MAP_NORESERVE } else { 0 };
        let prot = if commit {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_NONE
        };

        let ptr = unsafe { libc::mmap(addr, len, prot, flags, -1, 0) };

        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        Ok(RegionInner {
            ptr,
            len,
            no_reserve,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        let ret = unsafe { libc::mprotect(addr, len, libc::PROT_READ | libc::PROT_WRITE) };
        if ret != 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        let addr = unsafe { self.ptr.cast::<u8>().add(offset) }.cast::<libc::c_void>();
        // Remapping the range discards its physical pages.
        let flags = libc::MAP_PRIVATE
            | libc::MAP_ANON
            | libc::MAP_FIXED
            | if self.no_reserve { MAP_NORESERVE } else { 0 };
        let ptr = unsafe { libc::mmap(addr, len, libc::PROT_NONE, flags, -1, 0) };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}
