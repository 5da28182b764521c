use crate::error::{Error, Result, fail};
use crate::fd::Fd;
use crate::runtime::reactor::Interest;
use std::ops::Deref;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

/// A connected stream socket.
///
/// A thin copyable wrapper over [`Fd`]: closing any copy invalidates all of
/// them, and fibers parked on the connection wake up with [`Error::Closed`].
///
/// Timeouts are optional everywhere, `None` waits forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Conn {
    fd: Fd,
}

impl Deref for Conn {
    type Target = Fd;

    fn deref(&self) -> &Self::Target {
        &self.fd
    }
}

impl Conn {
    /// Adopts an already connected socket.
    #[track_caller]
    pub fn from_raw_fd(raw: RawFd) -> Result<Conn> {
        Ok(Conn {
            fd: Fd::from_raw(raw)?,
        })
    }

    /// Reads at most `buf.len()` bytes. `Ok(0)` means the peer closed its
    /// side.
    ///
    /// An empty `buf` is rejected as [`Error::Invalid`].
    pub fn read(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if buf.is_empty() {
            return fail(Error::invalid("read into an empty buffer"));
        }
        if !self.valid() {
            return fail(Error::invalid("invalid conn"));
        }

        let deadline = deadline(timeout);
        loop {
            let ret = unsafe { libc::read(self.raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
            if ret >= 0 {
                return Ok(ret as usize);
            }
            self.wait_ready(Interest::READ, deadline)?;
        }
    }

    /// Writes some prefix of `buf`, returning its length. An empty `buf` only
    /// checks that the connection is valid.
    pub fn write(&self, buf: &[u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.valid() {
            return fail(Error::invalid("invalid conn"));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let deadline = deadline(timeout);
        loop {
            match self.write_once(buf, deadline)? {
                0 => continue,
                n => return Ok(n),
            }
        }
    }

    /// Writes all of `buf`, parking as often as needed. `timeout` bounds the
    /// whole operation, not each write.
    pub fn write_all(&self, mut buf: &[u8], timeout: Option<Duration>) -> Result<()> {
        if !self.valid() {
            return fail(Error::invalid("invalid conn"));
        }

        let deadline = deadline(timeout);
        while !buf.is_empty() {
            let n = self.write_once(buf, deadline)?;
            buf = &buf[n..];
        }

        Ok(())
    }

    // One write(2) attempt: Ok(0) asks the caller to retry.
    fn write_once(&self, buf: &[u8], deadline: Option<Instant>) -> Result<usize> {
        let ret = unsafe { libc::write(self.raw_fd(), buf.as_ptr().cast(), buf.len()) };

        match ret {
            n if n > 0 => Ok(n as usize),
            0 if expired(deadline) => fail(Error::Timeout),
            0 => Ok(0),
            _ => self.wait_ready(Interest::WRITE, deadline).map(|_| 0),
        }
    }
}

pub(crate) fn deadline(timeout: Option<Duration>) -> Option<Instant> {
    timeout.map(|t| Instant::now() + t)
}

pub(crate) fn expired(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| d <= Instant::now())
}
