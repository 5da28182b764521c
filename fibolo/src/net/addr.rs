use crate::error::{Result, fail_with_os};
use nix::sys::socket::{SockaddrIn, UnixAddr};
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};

// Bytes available in `sockaddr_un::sun_path`, the terminating NUL included.
const SUN_PATH_LEN: usize = 108;

/// Address of a unix socket bound to `path` on the filesystem.
///
/// Empty or overlong paths fail like a syscall would, with `EINVAL`.
#[track_caller]
pub(crate) fn unix(path: &str) -> Result<UnixAddr> {
    if path.is_empty() || path.len() >= SUN_PATH_LEN {
        return fail_with_os(
            io::Error::from_raw_os_error(libc::EINVAL),
            &format!("unix socket path is empty or too long [{path}]"),
        );
    }

    UnixAddr::new(path).or_else(|e| fail_with_os(e.into(), "unix socket address"))
}

/// Address in the Linux abstract namespace: `name` prefixed by a NUL byte,
/// nothing on the filesystem.
#[track_caller]
pub(crate) fn unix_abstract(name: &str) -> Result<UnixAddr> {
    if name.len() >= SUN_PATH_LEN {
        return fail_with_os(
            io::Error::from_raw_os_error(libc::EINVAL),
            "unix socket abstract path too long",
        );
    }

    UnixAddr::new_abstract(name.as_bytes())
        .or_else(|e| fail_with_os(e.into(), "unix socket abstract address"))
}

#[track_caller]
pub(crate) fn tcp(ip: &str, port: u16) -> Result<SockaddrIn> {
    match ip.parse::<Ipv4Addr>() {
        Ok(ip) => Ok(SockaddrIn::from(SocketAddrV4::new(ip, port))),
        Err(_) => fail_with_os(
            io::Error::from_raw_os_error(libc::EINVAL),
            &format!("invalid ipv4 address [{ip}]"),
        ),
    }
}
