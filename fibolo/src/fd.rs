//! Generation-checked descriptor handles.
//!
//! An [`Fd`] is a copyable handle to a registered descriptor. Unregistering
//! bumps the generation of its raw number, which invalidates every copy at
//! once, even after the OS hands the same number out again.

use crate::context::{self, with_core_mut};
use crate::error::{Error, Result, fail, fail_sys};
use crate::runtime::reactor::Interest;
use crate::runtime::scheduler;
use crate::task::WaitingEvents;
use crate::utils::sys::errno;
use std::os::fd::RawFd;
use std::time::Instant;

/// A handle to a descriptor registered with the current thread's reactor.
///
/// Ordered by raw number, then generation. The default handle is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fd {
    raw: RawFd,
    generation: u32,
}

impl Default for Fd {
    fn default() -> Self {
        Fd {
            raw: -1,
            generation: 0,
        }
    }
}

impl Fd {
    pub fn raw_fd(&self) -> RawFd {
        self.raw
    }

    /// Binds this unused handle to `raw`: switches it to non-blocking mode and
    /// registers it for read and write readiness.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no runtime.
    #[track_caller]
    pub fn reg(&mut self, raw: RawFd) -> Result<()> {
        assert!(context::is_inited(), "Context not initialized");

        if self.raw != -1 {
            return fail(Error::invalid("Fd handle is already in use"));
        }
        if raw < 0 {
            return fail(Error::invalid(format!("negative raw fd {raw}")));
        }

        let on: libc::c_int = 1;
        if unsafe { libc::ioctl(raw, libc::FIONBIO, &on) } == -1 {
            return fail_sys("ioctl(FIONBIO)");
        }

        let generation = with_core_mut(|core| {
            core.reactor
                .register(raw)
                .map(|_| core.generations.get(raw))
        })?;

        self.raw = raw;
        self.generation = generation;

        tracing::trace!(raw, generation, "fd registered");
        Ok(())
    }

    /// Registers `raw` with a fresh handle.
    #[track_caller]
    pub fn from_raw(raw: RawFd) -> Result<Fd> {
        let mut fd = Fd::default();
        fd.reg(raw)?;
        Ok(fd)
    }

    /// False for the default handle, after [`unreg`](Fd::unreg) or
    /// [`close`](Fd::close) through any copy, and on other threads.
    pub fn valid(&self) -> bool {
        if self.raw < 0 {
            return false;
        }

        context::try_with_context(|ctx| {
            let core = ctx.core.borrow();
            core.reactor.is_registered(self.raw)
                && core.generations.get(self.raw) == self.generation
        })
        .unwrap_or(false)
    }

    /// Withdraws the descriptor from the reactor without closing it. Fibers
    /// parked on it are woken and will observe the handle as invalid.
    pub fn unreg(&self) -> Result<()> {
        if !self.valid() {
            return fail(Error::invalid("invalid fd"));
        }

        let res = with_core_mut(|core| {
            let (parked, res) = core.reactor.deregister(self.raw);
            core.wake_all(parked);
            core.generations.bump(self.raw);
            res
        });

        tracing::trace!(raw = self.raw, "fd unregistered");
        res
    }

    /// Unregisters and closes the descriptor.
    pub fn close(&self) -> Result<()> {
        if !self.valid() {
            return fail(Error::invalid("invalid fd"));
        }

        let res = self.unreg();
        if unsafe { libc::close(self.raw) } == -1 {
            return fail_sys("close");
        }
        res
    }

    /// Shared tail of every non-blocking syscall loop, called right after the
    /// syscall failed.
    ///
    /// `EAGAIN` parks the fiber until `interest` is signalled or `deadline`
    /// passes, `EINTR` retries immediately. Both return `Ok` so the caller
    /// retries; the caller must check the deadline itself afterwards.
    #[track_caller]
    pub(crate) fn wait_ready(&self, interest: Interest, deadline: Option<Instant>) -> Result<()> {
        let err = errno();

        match err {
            libc::ECONNRESET => return fail(Error::ConnReset),
            libc::EAGAIN | libc::EINTR => {}
            _ => return fail_sys("io syscall"),
        }

        if deadline.is_some_and(|d| d <= Instant::now()) {
            return fail(Error::Timeout);
        }

        if err == libc::EAGAIN {
            let events = if interest.contains(Interest::READ) {
                WaitingEvents::new().read(self.raw)
            } else {
                WaitingEvents::new().write(self.raw)
            };
            scheduler::suspend(events.deadline(deadline));

            if !self.valid() {
                return fail(Error::Closed("fd"));
            }
        }

        Ok(())
    }
}
