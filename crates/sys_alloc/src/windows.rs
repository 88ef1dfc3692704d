use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
    PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

pub struct RegionInner {
    ptr: *mut std::ffi::c_void,
    len: usize,
}

impl RegionInner {
    /// Reserves `len` bytes of address space, optionally committing them.
    pub unsafe fn reserve(
        hint_addr: usize,
        len: usize,
        commit: bool,
        _no_reserve: bool,
    ) -> io::Result<RegionInner> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            let _ = (hint_addr, commit);
            let align = allocation_granularity();
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(RegionInner {
                ptr: ptr.cast::<std::ffi::c_void>(),
                len,
            })
        }
        #[cfg(not(miri))]
        {
            let addr = if hint_addr == 0 {
                ptr::null()
            } else {
                hint_addr as *const std::ffi::c_void
            };

            let (kind, protect) = if commit {
                (MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE)
            } else {
                (MEM_RESERVE, PAGE_NOACCESS)
            };

            let mut ptr = VirtualAlloc(addr, len, kind, protect);

            if ptr.is_null() && !addr.is_null() {
                ptr = VirtualAlloc(ptr::null(), len, kind, protect);
            }

            if ptr.is_null() {
                return Err(Error::last_os_error());
            }

            Ok(RegionInner { ptr, len })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub unsafe fn commit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            let _ = (offset, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>();
            if VirtualAlloc(addr, len, MEM_COMMIT, PAGE_READWRITE).is_null() {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }

    pub unsafe fn decommit(&self, offset: usize, len: usize) -> io::Result<()> {
        #[cfg(miri)]
        {
            ptr::write_bytes(self.ptr.cast::<u8>().add(offset), 0, len);
            Ok(())
        }
        #[cfg(not(miri))]
        {
            let addr = self.ptr.cast::<u8>().add(offset).cast::<std::ffi::c_void>();
            if VirtualFree(addr, len, MEM_DECOMMIT) == 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }
    }
}

impl Drop for RegionInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let align = allocation_granularity();
                    if let Ok(layout) = Layout::from_size_align(self.len, align) {
                        dealloc(self.ptr.cast::<u8>(), layout);
                    }
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.ptr, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for RegionInner {}
unsafe impl Sync for RegionInner {}
