//! Error codes shared by every blocking operation of the runtime.
//!
//! Each failing operation returns an [`Error`] and also records a
//! human-readable trail for the current thread, see [`trail::err`].

use std::io;

pub mod trail;
pub use trail::{ErrGuard, err, push_err_bt, set_err};

/// A system call failed, `errno` is carried by the wrapped [`io::Error`].
pub const SYS_CALL_FAILED: i32 = -1;
pub const TIMEOUT: i32 = -2;
pub const CLOSED: i32 = -3;
pub const INTERRUPTED: i32 = -4;
pub const INVALID: i32 = -5;
pub const OVERFLOW: i32 = -6;
pub const CONN_RESET: i32 = -7;

/// Codes in `(STD_CODE_MIN, 0)` are reserved. Applications may use anything
/// strictly below it for their own failures, see [`Error::user`].
pub const STD_CODE_MIN: i32 = -10_000;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("syscall failed: {0}")]
    SysCall(#[from] io::Error),

    #[error("timeout")]
    Timeout,

    /// The resource was closed or destroyed while the fiber was waiting on it.
    #[error("{0} was closed")]
    Closed(&'static str),

    #[error("interrupted")]
    Interrupted,

    #[error("invalid: {0}")]
    Invalid(String),

    #[error("{0} overflow")]
    Overflow(&'static str),

    #[error("connection reset by peer")]
    ConnReset,

    #[error("user error code {0}")]
    User(i32),
}

impl Error {
    /// Builds an application defined error.
    ///
    /// # Panics
    ///
    /// Panics if `code` is not below [`STD_CODE_MIN`].
    #[track_caller]
    pub fn user(code: i32) -> Self {
        assert!(
            code < STD_CODE_MIN,
            "user error codes must be below {STD_CODE_MIN}, got {code}"
        );
        Error::User(code)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::Invalid(msg.into())
    }

    /// Numeric code of this error, negative for every variant.
    pub fn code(&self) -> i32 {
        match self {
            Error::SysCall(_) => SYS_CALL_FAILED,
            Error::Timeout => TIMEOUT,
            Error::Closed(_) => CLOSED,
            Error::Interrupted => INTERRUPTED,
            Error::Invalid(_) => INVALID,
            Error::Overflow(_) => OVERFLOW,
            Error::ConnReset => CONN_RESET,
            Error::User(code) => *code,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed(_))
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::SysCall(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::SysCall(a), Self::SysCall(b)) => match (a.raw_os_error(), b.raw_os_error()) {
                (Some(a), Some(b)) => a == b,
                _ => a.kind() == b.kind(),
            },
            (Self::Closed(a), Self::Closed(b)) => a == b,
            (Self::Invalid(a), Self::Invalid(b)) => a == b,
            (Self::Overflow(a), Self::Overflow(b)) => a == b,
            (Self::User(a), Self::User(b)) => a == b,
            (a, b) => std::mem::discriminant(a) == std::mem::discriminant(b),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::SysCall(e) => e,
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Closed(_) => io::Error::new(io::ErrorKind::NotConnected, err),
            Error::Interrupted => io::Error::new(io::ErrorKind::Interrupted, err),
            Error::Invalid(_) => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::ConnReset => io::Error::new(io::ErrorKind::ConnectionReset, err),
            Error::Overflow(_) | Error::User(_) => io::Error::other(err),
        }
    }
}

/// Records `err` in the thread's error trail and returns it.
#[track_caller]
pub(crate) fn fail<T>(err: Error) -> Result<T> {
    match err.raw_os_error() {
        Some(errno) => set_err(format!("{err} <errno={errno}>")),
        None => set_err(err.to_string()),
    }
    Err(err)
}

/// Captures `errno` of the failed system call described by `what`.
#[track_caller]
pub(crate) fn fail_sys<T>(what: &str) -> Result<T> {
    let e = io::Error::last_os_error();
    fail_with_os(e, what)
}

#[track_caller]
pub(crate) fn fail_with_os<T>(e: io::Error, what: &str) -> Result<T> {
    set_err(format!(
        "{what} failed: {e} <errno={}>",
        e.raw_os_error().unwrap_or(0)
    ));
    Err(Error::SysCall(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Error: Send, Sync, std::error::Error);

    #[rstest]
    #[case::syscall(Error::SysCall(io::Error::from_raw_os_error(libc::EBADF)), SYS_CALL_FAILED)]
    #[case::timeout(Error::Timeout, TIMEOUT)]
    #[case::closed(Error::Closed("conn"), CLOSED)]
    #[case::interrupted(Error::Interrupted, INTERRUPTED)]
    #[case::invalid(Error::invalid("bad"), INVALID)]
    #[case::overflow(Error::Overflow("sem"), OVERFLOW)]
    #[case::conn_reset(Error::ConnReset, CONN_RESET)]
    #[case::user(Error::user(-10_001), -10_001)]
    fn test_error_codes(#[case] err: Error, #[case] expected: i32) {
        assert_eq!(err.code(), expected);
        assert!(err.code() < 0);
    }

    #[test]
    #[should_panic(expected = "user error codes must be below")]
    fn test_user_code_in_reserved_range() {
        let _ = Error::user(-5);
    }

    #[test]
    fn test_fail_sys_records_errno() {
        unsafe { *libc::__errno_location() = libc::EAGAIN };
        let res: Result<()> = fail_sys("read");

        assert_eq!(res.unwrap_err().raw_os_error(), Some(libc::EAGAIN));
        assert!(err().starts_with("read failed"));
        assert!(err().contains(&format!("<errno={}>", libc::EAGAIN)));
    }

    #[test]
    fn test_into_io_error() {
        let e: io::Error = Error::Timeout.into();
        assert_eq!(e.kind(), io::ErrorKind::TimedOut);

        let e: io::Error = Error::SysCall(io::Error::from_raw_os_error(libc::EPIPE)).into();
        assert_eq!(e.raw_os_error(), Some(libc::EPIPE));
    }
}
