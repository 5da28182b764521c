use crate::error::{Error, Result, fail, fail_sys};
use crate::task::Id;
use anyhow::anyhow;
use bitflags::bitflags;
use std::collections::{BTreeSet, HashMap};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct Interest: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Default)]
struct Waiters {
    readers: BTreeSet<Id>,
    writers: BTreeSet<Id>,
}

impl Waiters {
    fn get_mut(&mut self, interest: Interest) -> &mut BTreeSet<Id> {
        if interest.contains(Interest::READ) {
            &mut self.readers
        } else {
            &mut self.writers
        }
    }
}

/// Edge-triggered epoll over every registered descriptor.
///
/// Descriptors are registered once for both directions; fibers then park on
/// one direction and are all woken together on the next edge.
#[derive(Debug)]
pub(crate) struct Reactor {
    epoll: OwnedFd,
    waiters: HashMap<RawFd, Waiters>,
    events: Vec<libc::epoll_event>,
}

impl Reactor {
    pub(crate) fn try_new(max_events: usize) -> anyhow::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(anyhow!(
                "epoll_create1 failed: {}",
                io::Error::last_os_error()
            ));
        }

        Ok(Reactor {
            epoll: unsafe { OwnedFd::from_raw_fd(fd) },
            waiters: HashMap::new(),
            events: vec![libc::epoll_event { events: 0, u64: 0 }; max_events],
        })
    }

    pub(crate) fn is_registered(&self, fd: RawFd) -> bool {
        self.waiters.contains_key(&fd)
    }

    pub(crate) fn register(&mut self, fd: RawFd) -> Result<()> {
        if self.is_registered(fd) {
            return fail(Error::invalid(format!("fd {fd} is already registered")));
        }

        let mut event = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLOUT | libc::EPOLLET) as u32,
            u64: fd as u64,
        };

        let ret = unsafe {
            libc::epoll_ctl(self.epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event)
        };
        if ret < 0 {
            return fail_sys("epoll_ctl(ADD)");
        }

        self.waiters.insert(fd, Waiters::default());
        Ok(())
    }

    /// Removes `fd` from epoll. Returns the fibers that were parked on it,
    /// which the caller must wake, along with the outcome of the removal.
    pub(crate) fn deregister(&mut self, fd: RawFd) -> (Vec<Id>, Result<()>) {
        let Some(waiters) = self.waiters.remove(&fd) else {
            return (Vec::new(), fail(Error::invalid(format!("fd {fd} is not registered"))));
        };

        let parked = waiters.readers.into_iter().chain(waiters.writers).collect();

        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        };
        if ret < 0 {
            return (parked, fail_sys("epoll_ctl(DEL)"));
        }

        (parked, Ok(()))
    }

    /// Returns false if `fd` isn't registered.
    pub(crate) fn add_waiter(&mut self, fd: RawFd, interest: Interest, id: Id) -> bool {
        match self.waiters.get_mut(&fd) {
            Some(waiters) => {
                waiters.get_mut(interest).insert(id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_waiter(&mut self, fd: RawFd, interest: Interest, id: Id) {
        if let Some(waiters) = self.waiters.get_mut(&fd) {
            waiters.get_mut(interest).remove(&id);
        }
    }

    /// Waits up to `timeout` and drains the fibers parked on each signalled
    /// direction. Interrupted waits report nothing.
    pub(crate) fn poll(&mut self, timeout: Duration) -> io::Result<Vec<Id>> {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let mut woken = Vec::new();
        for event in &self.events[..n as usize] {
            // Copies out of the (packed on x86_64) struct.
            let (bits, fd) = (event.events, event.u64 as RawFd);
            let Some(waiters) = self.waiters.get_mut(&fd) else {
                continue;
            };

            let readable = (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) as u32;
            let writable = (libc::EPOLLOUT | libc::EPOLLHUP | libc::EPOLLERR) as u32;

            if bits & readable != 0 {
                woken.extend(std::mem::take(&mut waiters.readers));
            }
            if bits & writable != 0 {
                woken.extend(std::mem::take(&mut waiters.writers));
            }
        }

        tracing::trace!(events = n, woken = woken.len(), "reactor poll");
        Ok(woken)
    }
}

// Rounded up, so a fiber due in half a millisecond doesn't spin the loop.
fn timeout_ms(timeout: Duration) -> libc::c_int {
    let ms = timeout.as_nanos().div_ceil(1_000_000);
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
