use crate::utils::sys::get_page_size;
use std::ptr::{self, NonNull};

/// An mmap'ed fiber stack with a `PROT_NONE` guard page at its low end, so
/// an overflow faults instead of silently corrupting a neighbour.
#[derive(Debug)]
pub(crate) struct Stack {
    base: NonNull<u8>,
    len: usize,
}

impl Stack {
    /// Maps `size` usable bytes, rounded up to whole pages, plus the guard.
    ///
    /// Running out of address space for a stack is not recoverable, the
    /// process is aborted.
    pub(crate) fn new(size: usize) -> Stack {
        let page = get_page_size();
        let len = size.div_ceil(page) * page + page;

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            Self::out_of_memory(len);
        }

        if unsafe { libc::mprotect(ptr, page, libc::PROT_NONE) } != 0 {
            unsafe { libc::munmap(ptr, len) };
            Self::out_of_memory(len);
        }

        Stack {
            // mmap never hands out the null page on success.
            base: unsafe { NonNull::new_unchecked(ptr as *mut u8) },
            len,
        }
    }

    #[cold]
    fn out_of_memory(len: usize) -> ! {
        let err = std::io::Error::last_os_error();
        tracing::error!(len, %err, "failed to map fiber stack");
        eprintln!("fibolo: failed to map a fiber stack of {len} bytes: {err}");
        std::process::abort()
    }

    /// Exclusive upper bound, stacks grow down from here.
    pub(crate) fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
    }
}
