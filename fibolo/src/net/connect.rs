use crate::error::{Error, ErrGuard, Result, fail, fail_with_os};
use crate::net::addr;
use crate::net::conn::{Conn, deadline, expired};
use crate::runtime::scheduler;
use crate::task::WaitingEvents;
use crate::utils::ScopeGuard;
use crate::utils::sys::{set_tcp_nodelay, silent_close};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrLike, sockopt};
use std::io;
use std::os::fd::{BorrowedFd, IntoRawFd};
use std::time::{Duration, Instant};

/// Connects to `ip:port` over TCP. `ip` must be a dotted IPv4 address.
///
/// The returned connection has `TCP_NODELAY` set.
pub fn connect_tcp(ip: &str, port: u16, timeout: Option<Duration>) -> Result<Conn> {
    let addr = addr::tcp(ip, port)?;
    connect_stream(AddressFamily::Inet, &addr, timeout)
}

/// Connects to the unix stream socket at `path`.
pub fn connect_unix(path: &str, timeout: Option<Duration>) -> Result<Conn> {
    let addr = addr::unix(path)?;
    connect_stream(AddressFamily::Unix, &addr, timeout)
}

/// Connects to the unix stream socket named `name` in the abstract
/// namespace.
pub fn connect_unix_abstract(name: &str, timeout: Option<Duration>) -> Result<Conn> {
    let addr = addr::unix_abstract(name)?;
    connect_stream(AddressFamily::Unix, &addr, timeout)
}

fn connect_stream(
    family: AddressFamily,
    addr: &dyn SockaddrLike,
    timeout: Option<Duration>,
) -> Result<Conn> {
    let deadline = deadline(timeout);

    let flags = SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK;
    let raw = match socket::socket(family, SockType::Stream, flags, None) {
        Ok(sock) => sock.into_raw_fd(),
        Err(e) => return fail_with_os(e.into(), "create connection socket"),
    };
    let mut close_on_err = ScopeGuard::new(move || silent_close(raw));

    let in_progress = match socket::connect(raw, addr) {
        Ok(()) => false,
        Err(nix::errno::Errno::EINPROGRESS) => true,
        Err(e) => return fail_with_os(e.into(), "connect"),
    };

    let conn = Conn::from_raw_fd(raw)?;
    close_on_err.disarm();

    if !in_progress {
        set_tcp_nodelay(raw);
        return Ok(conn);
    }

    scheduler::suspend(WaitingEvents::new().write(raw).deadline(deadline));

    let res = finish_connect(&conn, deadline);
    if res.is_err() {
        // Keep the connect failure visible to the caller, not the close's.
        let _guard = ErrGuard::new();
        if let Err(e) = conn.close() {
            tracing::debug!(%e, "close after failed connect");
        }
    }

    res.map(|_| conn)
}

fn finish_connect(conn: &Conn, deadline: Option<Instant>) -> Result<()> {
    if !conn.valid() {
        return fail(Error::Closed("conn"));
    }
    if expired(deadline) {
        return fail(Error::Timeout);
    }

    // Safety: the descriptor stays open as long as `conn` is valid.
    let sock = unsafe { BorrowedFd::borrow_raw(conn.raw_fd()) };
    match socket::getsockopt(&sock, sockopt::SocketError) {
        Ok(0) => {}
        Ok(err) => return fail_with_os(io::Error::from_raw_os_error(err), "connect"),
        Err(e) => return fail_with_os(e.into(), "getsockopt(SO_ERROR)"),
    }

    set_tcp_nodelay(conn.raw_fd());
    Ok(())
}
