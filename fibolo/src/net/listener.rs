use crate::error::{Error, Result, fail, fail_with_os};
use crate::fd::Fd;
use crate::net::addr;
use crate::net::conn::{Conn, deadline};
use crate::runtime::reactor::Interest;
use crate::utils::ScopeGuard;
use crate::utils::sys::{set_tcp_nodelay, silent_close};
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrIn, SockaddrLike,
    SockaddrStorage, sockopt,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::ops::Deref;
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::time::Duration;

const LISTEN_BACKLOG: i32 = 1024;

/// A listening stream socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Listener {
    fd: Fd,
}

impl Deref for Listener {
    type Target = Fd;

    fn deref(&self) -> &Self::Target {
        &self.fd
    }
}

impl Listener {
    /// Adopts an already listening socket.
    #[track_caller]
    pub fn from_raw_fd(raw: RawFd) -> Result<Listener> {
        Ok(Listener {
            fd: Fd::from_raw(raw)?,
        })
    }

    /// Waits for the next incoming connection. Accepted connections have
    /// `TCP_NODELAY` set when they are TCP.
    pub fn accept(&self, timeout: Option<Duration>) -> Result<Conn> {
        if !self.valid() {
            return fail(Error::invalid("invalid listener"));
        }

        let deadline = deadline(timeout);
        loop {
            match socket::accept4(self.raw_fd(), SockFlag::SOCK_CLOEXEC) {
                Ok(raw) => {
                    let mut close_on_err = ScopeGuard::new(move || silent_close(raw));
                    let conn = Conn::from_raw_fd(raw)?;
                    close_on_err.disarm();

                    set_tcp_nodelay(raw);
                    return Ok(conn);
                }
                Err(_) => self.wait_ready(Interest::READ, deadline)?,
            }
        }
    }

    /// Address the socket is bound to, e.g. to learn the port picked by the
    /// kernel for port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let storage: SockaddrStorage = match socket::getsockname(self.raw_fd()) {
            Ok(storage) => storage,
            Err(e) => return fail_with_os(e.into(), "getsockname"),
        };

        if let Some(sin) = storage.as_sockaddr_in() {
            return Ok(SocketAddr::V4(SocketAddrV4::from(*sin)));
        }
        if let Some(sin6) = storage.as_sockaddr_in6() {
            return Ok(SocketAddr::V6((*sin6).into()));
        }
        fail(Error::invalid("listener is not bound to an inet address"))
    }
}

/// Listens on `port` of every local IPv4 address, with `SO_REUSEADDR`.
/// Port 0 lets the kernel pick one, see [`Listener::local_addr`].
pub fn listen_tcp(port: u16) -> Result<Listener> {
    let sock = new_socket(AddressFamily::Inet)?;

    if let Err(e) = socket::setsockopt(&sock, sockopt::ReuseAddr, &true) {
        return fail_with_os(e.into(), "set listen socket reuse-addr");
    }

    let addr = SockaddrIn::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    listen_stream(sock, &addr)
}

/// Listens on a unix stream socket at `path`, which must not exist yet.
pub fn listen_unix(path: &str) -> Result<Listener> {
    let addr = addr::unix(path)?;
    listen_stream(new_socket(AddressFamily::Unix)?, &addr)
}

/// Listens on a unix stream socket in the abstract namespace.
pub fn listen_unix_abstract(name: &str) -> Result<Listener> {
    let addr = addr::unix_abstract(name)?;
    listen_stream(new_socket(AddressFamily::Unix)?, &addr)
}

fn new_socket(family: AddressFamily) -> Result<OwnedFd> {
    socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)
        .or_else(|e| fail_with_os(e.into(), "create listen socket"))
}

// `sock` is closed on every failure path, by drop.
fn listen_stream(sock: OwnedFd, addr: &dyn SockaddrLike) -> Result<Listener> {
    if let Err(e) = socket::bind(sock.as_raw_fd(), addr) {
        return fail_with_os(e.into(), "bind");
    }

    let backlog = Backlog::new(LISTEN_BACKLOG).unwrap_or(Backlog::MAXCONN);
    if let Err(e) = socket::listen(&sock, backlog) {
        return fail_with_os(e.into(), "listen");
    }

    let raw = sock.into_raw_fd();
    let mut close_on_err = ScopeGuard::new(move || silent_close(raw));
    let listener = Listener::from_raw_fd(raw)?;
    close_on_err.disarm();

    tracing::debug!(raw, "listening");
    Ok(listener)
}
