//! Conservative stack scanning.
//!
//! Callee-saved registers are spilled into a local array, then every word
//! between the current stack pointer and the stack base is handed to the
//! caller as a potential heap pointer.

const WORD: usize = std::mem::size_of::<usize>();

/// Bounds of a thread's stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Highest address; the stack grows down from here.
    pub base: usize,
    /// Lowest reserved address.
    pub limit: usize,
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(miri)]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(all(target_os = "linux", not(miri)))]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use libc::{
        pthread_attr_destroy, pthread_attr_getstack, pthread_attr_t, pthread_getattr_np,
        pthread_self,
    };

    // SAFETY: the attribute object is initialized by pthread_getattr_np and
    // destroyed on every path after it succeeded.
    unsafe {
        let mut attr: pthread_attr_t = std::mem::zeroed();
        if pthread_getattr_np(pthread_self(), &raw mut attr) != 0 {
            return None;
        }
        let mut stackaddr: *mut libc::c_void = std::ptr::null_mut();
        let mut stacksize: libc::size_t = 0;
        let ret = pthread_attr_getstack(&raw const attr, &raw mut stackaddr, &raw mut stacksize);
        pthread_attr_destroy(&raw mut attr);
        if ret != 0 {
            return None;
        }
        Some(StackBounds {
            base: stackaddr as usize + stacksize,
            limit: stackaddr as usize,
        })
    }
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(all(target_vendor = "apple", not(miri)))]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    // SAFETY: both calls only read the current thread's descriptor.
    unsafe {
        let thread = libc::pthread_self();
        let base = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(StackBounds {
            base,
            limit: base - size,
        })
    }
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(all(windows, not(miri)))]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    use windows_sys::Win32::System::Threading::GetCurrentThreadStackLimits;

    let mut low = 0usize;
    let mut high = 0usize;
    // SAFETY: both out pointers are valid locals.
    unsafe { GetCurrentThreadStackLimits(&raw mut low, &raw mut high) };
    Some(StackBounds {
        base: high,
        limit: low,
    })
}

/// Stack bounds of the current thread, if the platform reports them.
#[cfg(not(any(miri, target_os = "linux", target_vendor = "apple", windows)))]
#[must_use]
pub fn current_stack_bounds() -> Option<StackBounds> {
    None
}

/// Spills callee-saved registers and visits them, then every stack word
/// from the current frame to the stack base.
///
/// # Safety
///
/// Must be called on the thread whose stack is scanned. `visit` must not
/// retain references into the stack.
#[inline(never)]
pub unsafe fn spill_registers_and_scan<F>(mut visit: F)
where
    F: FnMut(usize),
{
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    let mut regs = [0usize; 6];
    #[cfg(all(target_arch = "x86_64", not(miri)))]
    // SAFETY: only moves register values into locals.
    unsafe {
        std::arch::asm!(
            "mov {0}, rbx",
            "mov {1}, rbp",
            "mov {2}, r12",
            "mov {3}, r13",
            "mov {4}, r14",
            "mov {5}, r15",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
        );
    }
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    let mut regs = [0usize; 10];
    #[cfg(all(target_arch = "aarch64", not(miri)))]
    // SAFETY: only moves register values into locals.
    unsafe {
        std::arch::asm!(
            "mov {0}, x19",
            "mov {1}, x20",
            "mov {2}, x21",
            "mov {3}, x22",
            "mov {4}, x23",
            "mov {5}, x24",
            "mov {6}, x25",
            "mov {7}, x26",
            "mov {8}, x27",
            "mov {9}, x28",
            out(reg) regs[0],
            out(reg) regs[1],
            out(reg) regs[2],
            out(reg) regs[3],
            out(reg) regs[4],
            out(reg) regs[5],
            out(reg) regs[6],
            out(reg) regs[7],
            out(reg) regs[8],
            out(reg) regs[9],
        );
    }
    #[cfg(any(not(any(target_arch = "x86_64", target_arch = "aarch64")), miri))]
    let regs = [0usize; 32];
    std::hint::black_box(&regs);

    for &reg in &regs {
        visit(reg);
    }

    let Some(bounds) = current_stack_bounds() else {
        return;
    };
    let sp = std::ptr::addr_of!(visit) as usize;
    let mut current = sp & !(WORD - 1);
    while current < bounds.base {
        // SAFETY: [sp, base) is the live part of this thread's stack.
        visit(unsafe { std::ptr::read_volatile(current as *const usize) });
        current += WORD;
    }
}

/// Copies the live part of the current thread's stack, registers included.
///
/// The background thread scans the copy while the mutator keeps running.
#[must_use]
pub fn capture_stack() -> Vec<usize> {
    let mut words = Vec::new();
    // SAFETY: scanning the current thread; the words are copied out.
    unsafe { spill_registers_and_scan(|word| words.push(word)) };
    words
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_bounds_contain_local() {
        let local = 0u64;
        let addr = std::ptr::addr_of!(local) as usize;
        if let Some(bounds) = current_stack_bounds() {
            assert!(bounds.limit < addr && addr < bounds.base);
        }
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn test_scan_finds_local_value() {
        let marker: usize = 0x5eed_cafe_f00d;
        let marker = std::hint::black_box(marker);
        let words = capture_stack();
        if current_stack_bounds().is_some() {
            assert!(words.contains(&marker));
        }
        std::hint::black_box(marker);
    }
}
