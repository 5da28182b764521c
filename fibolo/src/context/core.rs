use crate::context::Generations;
use crate::runtime::RuntimeConfig;
use crate::runtime::reactor::{Interest, Reactor};
use crate::runtime::timers::Timers;
use crate::sync::SemRegistry;
use crate::task::{Fiber, Id, WaitingEvents};
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

/// Scheduler state of one thread.
///
/// `fibers` owns every live fiber; all other structures refer to fibers by
/// [`Id`] only, so dropping a fiber never leaves a dangling reference behind.
#[derive(Debug)]
pub(crate) struct Core {
    pub(crate) fibers: BTreeMap<Id, Box<Fiber>>,

    /// Fibers to resume on the next pass, in creation order.
    pub(crate) ready: BTreeSet<Id>,

    pub(crate) timers: Timers,

    pub(crate) reactor: Reactor,

    pub(crate) sems: SemRegistry,

    pub(crate) generations: Generations,
}

impl Core {
    pub(crate) fn try_new(cfg: &RuntimeConfig) -> Result<Self> {
        Ok(Core {
            fibers: BTreeMap::new(),
            ready: BTreeSet::new(),
            timers: Timers::default(),
            reactor: Reactor::try_new(cfg.max_events)?,
            sems: SemRegistry::default(),
            generations: Generations::new(cfg.fast_fd_table_size),
        })
    }

    pub(crate) fn insert(&mut self, fiber: Box<Fiber>) {
        let id = fiber.id();
        self.fibers.insert(id, fiber);
        self.ready.insert(id);
    }

    /// Registers `id` on everything in `events`. A fiber with nothing to wait
    /// for goes straight back to the ready set.
    pub(crate) fn park(&mut self, id: Id, events: WaitingEvents) {
        let Some(fiber) = self.fibers.get(&id) else {
            return;
        };

        if events.is_empty() {
            self.ready.insert(id);
            return;
        }

        let mut registered = true;

        if let Some(deadline) = events.deadline {
            self.timers.insert(deadline, id);
        }
        for fd in &events.read_fds {
            registered &= self.reactor.add_waiter(*fd, Interest::READ, id);
        }
        for fd in &events.write_fds {
            registered &= self.reactor.add_waiter(*fd, Interest::WRITE, id);
        }
        for sem in &events.sems {
            registered &= self.sems.add_waiter(*sem, id);
        }

        *fiber.waiting.borrow_mut() = events;

        // Waiting on something this thread doesn't know would never end.
        if !registered {
            tracing::warn!(fiber = %id, "parked on an unregistered fd or destroyed sem");
            self.wake(id);
        }
    }

    /// Makes `id` ready and withdraws it from every wait set it was parked on.
    pub(crate) fn wake(&mut self, id: Id) {
        let Some(fiber) = self.fibers.get(&id) else {
            return;
        };

        self.ready.insert(id);

        let events = std::mem::take(&mut *fiber.waiting.borrow_mut());
        if let Some(deadline) = events.deadline {
            self.timers.remove(deadline, id);
        }
        for fd in events.read_fds {
            self.reactor.remove_waiter(fd, Interest::READ, id);
        }
        for fd in events.write_fds {
            self.reactor.remove_waiter(fd, Interest::WRITE, id);
        }
        for sem in events.sems {
            self.sems.remove_waiter(sem, id);
        }
    }

    pub(crate) fn wake_all(&mut self, ids: impl IntoIterator<Item = Id>) {
        for id in ids {
            self.wake(id);
        }
    }

    pub(crate) fn expire_timers(&mut self, now: Instant) {
        let expired = self.timers.pop_expired(now);
        self.wake_all(expired);
    }

    /// How long the reactor may block: not at all with ready fibers, never
    /// past the nearest deadline, never longer than `poll_interval`.
    pub(crate) fn poll_timeout(&self, poll_interval: Duration, now: Instant) -> Duration {
        if !self.ready.is_empty() {
            return Duration::ZERO;
        }

        match self.timers.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(poll_interval),
            None => poll_interval,
        }
    }

    /// Blocks in the reactor for at most `timeout`, then wakes whatever
    /// became readable or writable.
    pub(crate) fn poll(&mut self, timeout: Duration) -> std::io::Result<()> {
        let woken = self.reactor.poll(timeout)?;
        self.wake_all(woken);
        Ok(())
    }
}
