use nix::sys::socket::{self, sockopt};
use std::os::fd::BorrowedFd;
use std::sync::OnceLock;

pub(crate) fn get_page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

#[inline]
pub(crate) fn errno() -> i32 {
    unsafe { *libc::__errno_location() }
}

#[inline]
pub(crate) fn set_errno(val: i32) {
    unsafe { *libc::__errno_location() = val }
}

/// Closes `fd` ignoring failures, `errno` is preserved.
pub(crate) fn silent_close(fd: libc::c_int) {
    let saved = errno();
    unsafe { libc::close(fd) };
    set_errno(saved);
}

/// Best effort, used for sockets where Nagle only adds latency. Fails
/// quietly on non-TCP sockets, `errno` is preserved.
pub(crate) fn set_tcp_nodelay(fd: libc::c_int) {
    let saved = errno();
    // Safety: callers own `fd` for the duration of the call.
    let sock = unsafe { BorrowedFd::borrow_raw(fd) };
    if let Err(e) = socket::setsockopt(&sock, sockopt::TcpNoDelay, &true) {
        tracing::trace!(fd, %e, "TCP_NODELAY not set");
    }
    set_errno(saved);
}
