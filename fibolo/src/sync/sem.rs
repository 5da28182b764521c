use crate::context::{self, with_core, with_core_mut};
use crate::error::{Error, Result, fail};
use crate::runtime::scheduler;
use crate::sync::SemId;
use crate::task::WaitingEvents;
use std::time::{Duration, Instant};

/// A counting semaphore shared by the fibers of one thread.
///
/// `Sem` is a plain handle: copies refer to the same semaphore, and after
/// [`destroy`](Sem::destroy) every copy becomes invalid.
///
/// Large acquisitions are not starved by a stream of small ones: once a fiber
/// cannot be served in full it starts collecting the value piecemeal, and no
/// other fiber is served until it completes or gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sem {
    id: SemId,
}

impl Sem {
    /// Creates a semaphore holding `value` on the current thread's runtime.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no runtime.
    #[track_caller]
    pub fn new(value: u64) -> Sem {
        let id = with_core_mut(|core| core.sems.create(value));
        Sem { id }
    }

    /// Whether the semaphore still exists on this thread.
    pub fn valid(&self) -> bool {
        context::try_with_context(|ctx| ctx.core.borrow().sems.contains(self.id))
            .unwrap_or(false)
    }

    /// Destroys the semaphore, waking every waiter with [`Error::Closed`].
    pub fn destroy(&self) -> Result<()> {
        let waiters = with_core_mut(|core| core.sems.destroy(self.id))?;
        tracing::trace!(sem = self.id.0, waiters = waiters.len(), "sem destroyed");
        with_core_mut(|core| core.wake_all(waiters));
        Ok(())
    }

    /// Takes `amount` units, waiting up to `timeout` (forever when `None`).
    ///
    /// On timeout whatever was collected so far is handed back. Acquiring 0
    /// succeeds immediately.
    pub fn acquire(&self, amount: u64, timeout: Option<Duration>) -> Result<()> {
        if !self.valid() {
            return fail(Error::invalid("invalid sem"));
        }
        if amount == 0 {
            return Ok(());
        }

        let Some(fiber) = context::current_fiber_id() else {
            return fail(Error::invalid("sem can only be acquired from a fiber"));
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut done = 0;

        while done < amount {
            done += with_core_mut(|core| core.sems.try_acquire(self.id, fiber, amount - done));
            if done == amount {
                with_core_mut(|core| {
                    let unblocked = core.sems.take_unblocked(self.id);
                    core.wake_all(unblocked);
                });
                return Ok(());
            }

            if deadline.is_some_and(|d| d <= Instant::now()) {
                with_core_mut(|core| {
                    let waiters = core.sems.restore(self.id, fiber);
                    core.wake_all(waiters);
                });
                return fail(Error::Timeout);
            }

            scheduler::suspend(WaitingEvents::new().deadline(deadline).sem(self.id));

            if !self.valid() {
                return fail(Error::Closed("sem"));
            }
        }

        Ok(())
    }

    /// Adds `amount` units and wakes every waiter.
    pub fn release(&self, amount: u64) -> Result<()> {
        let waiters = with_core_mut(|core| core.sems.release(self.id, amount))?;
        with_core_mut(|core| core.wake_all(waiters));
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn value(&self) -> u64 {
        with_core(|core| core.sems.value(self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate as fibolo;
    use crate::test_utils::Tracker;
    use crate::time::sleep;
    use rstest::rstest;

    #[fibolo::test]
    fn test_acquire_zero_is_immediate() {
        let sem = Sem::new(0);
        assert!(sem.acquire(0, Some(Duration::ZERO)).is_ok());
    }

    #[fibolo::test]
    fn test_acquire_available() {
        let sem = Sem::new(5);
        assert!(sem.acquire(3, None).is_ok());
        assert_eq!(sem.value(), 2);
    }

    #[rstest]
    #[case::expired(Duration::ZERO)]
    #[case::short(Duration::from_millis(20))]
    #[fibolo::test]
    fn test_timeout_refunds_partial_grant(#[case] timeout: Duration) {
        let sem = Sem::new(2);
        let started = Instant::now();

        assert_eq!(sem.acquire(5, Some(timeout)), Err(Error::Timeout));
        assert!(started.elapsed() >= timeout);

        // The refund leaves the sem usable by anyone.
        assert_eq!(sem.value(), 2);
        assert!(sem.acquire(2, Some(Duration::ZERO)).is_ok());
    }

    #[fibolo::test]
    fn test_release_wakes_waiter() {
        let sem = Sem::new(0);
        let tracker = Tracker::new();

        let t = tracker.clone();
        fibolo::spawn(move || {
            t.record("waiting");
            assert!(sem.acquire(3, None).is_ok());
            t.record("acquired");
        });

        sleep(Duration::from_millis(5)).unwrap();
        tracker.record("release 1");
        sem.release(1).unwrap();
        sleep(Duration::from_millis(5)).unwrap();
        tracker.record("release 2");
        sem.release(2).unwrap();
        sleep(Duration::from_millis(5)).unwrap();

        assert_eq!(
            tracker.events(),
            vec!["waiting", "release 1", "release 2", "acquired"]
        );
        assert_eq!(sem.value(), 0);
    }

    #[fibolo::test]
    fn test_destroy_while_waiting_is_closed() {
        let sem = Sem::new(0);
        let tracker = Tracker::new();

        let t = tracker.clone();
        fibolo::spawn(move || {
            let res = sem.acquire(1, Some(Duration::from_secs(5)));
            assert_eq!(res, Err(Error::Closed("sem")));
            t.record("closed");
        });

        sleep(Duration::from_millis(5)).unwrap();
        sem.destroy().unwrap();
        assert!(!sem.valid());
        sleep(Duration::from_millis(5)).unwrap();

        assert_eq!(tracker.events(), vec!["closed"]);
        assert!(matches!(sem.acquire(1, None), Err(Error::Invalid(_))));
        assert!(matches!(sem.release(1), Err(Error::Invalid(_))));
    }

    #[fibolo::test]
    fn test_small_requests_wait_behind_partial_acquirer() {
        let sem = Sem::new(3);
        let tracker = Tracker::new();

        let t = tracker.clone();
        fibolo::spawn(move || {
            assert!(sem.acquire(5, None).is_ok());
            t.record("big");
        });
        let t = tracker.clone();
        fibolo::spawn(move || {
            assert!(sem.acquire(1, None).is_ok());
            t.record("small");
        });

        sleep(Duration::from_millis(5)).unwrap();
        sem.release(1).unwrap();
        sleep(Duration::from_millis(5)).unwrap();
        assert!(tracker.events().is_empty());

        sem.release(2).unwrap();
        sleep(Duration::from_millis(5)).unwrap();

        assert_eq!(tracker.events(), vec!["big", "small"]);
        assert_eq!(sem.value(), 0);
    }

    #[fibolo::test]
    fn test_waiter_refused_during_partial_grant_is_served_after() {
        let sem = Sem::new(0);
        let tracker = Tracker::new();

        // Created first, so it runs before the big acquirer in every pass.
        let t = tracker.clone();
        fibolo::spawn(move || {
            sleep(Duration::from_millis(2)).unwrap();
            assert!(sem.acquire(1, None).is_ok());
            t.record("small");
        });
        let t = tracker.clone();
        fibolo::spawn(move || {
            assert!(sem.acquire(5, None).is_ok());
            t.record("big");
        });

        sleep(Duration::from_millis(5)).unwrap();
        sem.release(6).unwrap();
        sleep(Duration::from_millis(20)).unwrap();

        assert_eq!(tracker.events(), vec!["big", "small"]);
        assert_eq!(sem.value(), 0);
    }

    #[fibolo::test]
    fn test_partial_grant_completes_before_timeout() {
        let sem = Sem::new(2);

        fibolo::spawn(move || {
            sleep(Duration::from_millis(10)).unwrap();
            sem.release(3).unwrap();
        });

        let started = Instant::now();
        assert!(sem.acquire(5, Some(Duration::from_millis(100))).is_ok());

        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(10), "woke early: {waited:?}");
        assert!(waited < Duration::from_millis(100), "timed out: {waited:?}");
        assert_eq!(sem.value(), 0);
    }
}
