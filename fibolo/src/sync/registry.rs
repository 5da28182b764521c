use crate::error::{Error, Result, fail};
use crate::task::Id;
use std::collections::{BTreeMap, BTreeSet};

/// Identity of a semaphore within its thread, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct SemId(pub(crate) u64);

#[derive(Debug, Default)]
struct SemInfo {
    value: u64,

    /// The one fiber allowed to accumulate a partial grant, and how much it
    /// holds so far. Everyone else is refused until it completes or refunds.
    acquiring: Option<(Id, u64)>,

    waiters: BTreeSet<Id>,
}

/// Counting semaphores of one thread.
///
/// Values are conserved: `value` plus the partial grant only changes through
/// releases and completed acquisitions.
#[derive(Debug, Default)]
pub(crate) struct SemRegistry {
    sems: BTreeMap<SemId, SemInfo>,
    last_id: u64,
}

impl SemRegistry {
    pub(crate) fn create(&mut self, value: u64) -> SemId {
        self.last_id += 1;
        let id = SemId(self.last_id);
        self.sems.insert(
            id,
            SemInfo {
                value,
                ..Default::default()
            },
        );
        id
    }

    /// Forgets `sem`, returning the fibers that were waiting on it.
    pub(crate) fn destroy(&mut self, sem: SemId) -> Result<BTreeSet<Id>> {
        match self.sems.remove(&sem) {
            Some(info) => Ok(info.waiters),
            None => fail(Error::invalid("sem is invalid")),
        }
    }

    pub(crate) fn contains(&self, sem: SemId) -> bool {
        self.sems.contains_key(&sem)
    }

    /// Grants as much of `amount` as possible to `fiber` and returns the
    /// granted part.
    ///
    /// - With no acquirer and enough value, all of `amount` is granted.
    /// - Otherwise `fiber` takes whatever is left and becomes the acquirer.
    /// - While another fiber is the acquirer nothing is granted.
    /// - The acquirer completing its request stops being the acquirer.
    pub(crate) fn try_acquire(&mut self, sem: SemId, fiber: Id, amount: u64) -> u64 {
        debug_assert!(amount > 0);
        let Some(info) = self.sems.get_mut(&sem) else {
            return 0;
        };

        match info.acquiring {
            Some((acquirer, _)) if acquirer != fiber => 0,
            acquiring => {
                if info.value >= amount {
                    info.value -= amount;
                    info.acquiring = None;
                    return amount;
                }

                let granted = std::mem::take(&mut info.value);
                let held = acquiring.map_or(0, |(_, held)| held);
                info.acquiring = Some((fiber, held + granted));
                granted
            }
        }
    }

    /// Waiters to wake once the value can serve someone: there is no acquirer
    /// left and the value is not zero.
    ///
    /// Fibers woken by a release may run before the acquirer that blocks them
    /// completes, and park again. They are woken here once it is done.
    pub(crate) fn take_unblocked(&mut self, sem: SemId) -> BTreeSet<Id> {
        match self.sems.get_mut(&sem) {
            Some(info) if info.acquiring.is_none() && info.value > 0 => {
                std::mem::take(&mut info.waiters)
            }
            _ => BTreeSet::new(),
        }
    }

    /// Hands the partial grant of `fiber` back and wakes the waiters. No-op
    /// unless `fiber` is the current acquirer.
    pub(crate) fn restore(&mut self, sem: SemId, fiber: Id) -> BTreeSet<Id> {
        let Some(info) = self.sems.get_mut(&sem) else {
            return BTreeSet::new();
        };

        match info.acquiring {
            Some((acquirer, held)) if acquirer == fiber => {
                info.value += held;
                info.acquiring = None;
                std::mem::take(&mut info.waiters)
            }
            _ => BTreeSet::new(),
        }
    }

    /// Adds `amount` to the value, returning the waiters to wake.
    ///
    /// Fails if the total, partial grant included, would overflow.
    pub(crate) fn release(&mut self, sem: SemId, amount: u64) -> Result<BTreeSet<Id>> {
        let Some(info) = self.sems.get_mut(&sem) else {
            return fail(Error::invalid("sem is invalid"));
        };

        let held = info.acquiring.map_or(0, |(_, held)| held);
        if u64::MAX - info.value - held < amount {
            return fail(Error::Overflow("sem value"));
        }

        info.value += amount;
        Ok(std::mem::take(&mut info.waiters))
    }

    /// Returns false if `sem` doesn't exist.
    pub(crate) fn add_waiter(&mut self, sem: SemId, fiber: Id) -> bool {
        match self.sems.get_mut(&sem) {
            Some(info) => {
                info.waiters.insert(fiber);
                true
            }
            None => false,
        }
    }

    pub(crate) fn remove_waiter(&mut self, sem: SemId, fiber: Id) {
        if let Some(info) = self.sems.get_mut(&sem) {
            info.waiters.remove(&fiber);
        }
    }

    #[cfg(test)]
    pub(crate) fn value(&self, sem: SemId) -> u64 {
        self.sems[&sem].value
    }

    #[cfg(test)]
    fn total(&self, sem: SemId) -> u64 {
        let info = &self.sems[&sem];
        info.value + info.acquiring.map_or(0, |(_, held)| held)
    }

    #[cfg(test)]
    fn acquirer(&self, sem: SemId) -> Option<Id> {
        self.sems[&sem].acquiring.map(|(id, _)| id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::enough(10, 4, 4, None)]
    #[case::exact(4, 4, 4, None)]
    #[case::partial(3, 5, 3, Some(()))]
    #[case::empty(0, 5, 0, Some(()))]
    fn test_first_acquire(
        #[case] value: u64,
        #[case] amount: u64,
        #[case] granted: u64,
        #[case] becomes_acquirer: Option<()>,
    ) {
        let mut sems = SemRegistry::default();
        let sem = sems.create(value);
        let fiber = Id::next();

        assert_eq!(sems.try_acquire(sem, fiber, amount), granted);
        assert_eq!(sems.acquirer(sem), becomes_acquirer.map(|_| fiber));
    }

    #[test]
    fn test_only_one_partial_acquirer() -> Result<()> {
        let mut sems = SemRegistry::default();
        let sem = sems.create(3);
        let (a, b) = (Id::next(), Id::next());

        assert_eq!(sems.try_acquire(sem, a, 5), 3);
        sems.release(sem, 4)?;

        // B is refused even though 4 units are available.
        assert_eq!(sems.try_acquire(sem, b, 1), 0);
        assert_eq!(sems.acquirer(sem), Some(a));

        // A completes with the remaining 2, B gets served afterwards.
        assert_eq!(sems.try_acquire(sem, a, 2), 2);
        assert_eq!(sems.acquirer(sem), None);
        assert_eq!(sems.try_acquire(sem, b, 1), 1);
        assert_eq!(sems.total(sem), 1);
        Ok(())
    }

    #[test]
    fn test_acquirer_accumulates_over_releases() -> Result<()> {
        let mut sems = SemRegistry::default();
        let sem = sems.create(1);
        let a = Id::next();

        assert_eq!(sems.try_acquire(sem, a, 10), 1);
        sems.release(sem, 2)?;
        assert_eq!(sems.try_acquire(sem, a, 9), 2);
        assert_eq!(sems.total(sem), 3);

        let waiter = Id::next();
        assert!(sems.add_waiter(sem, waiter));
        assert_eq!(sems.restore(sem, a), BTreeSet::from([waiter]));

        assert_eq!(sems.total(sem), 3);
        assert_eq!(sems.acquirer(sem), None);
        assert_eq!(sems.try_acquire(sem, Id::next(), 3), 3);
        Ok(())
    }

    #[test]
    fn test_completed_acquirer_unblocks_waiters() -> Result<()> {
        let mut sems = SemRegistry::default();
        let sem = sems.create(0);
        let (a, b) = (Id::next(), Id::next());

        assert_eq!(sems.try_acquire(sem, a, 5), 0);
        sems.release(sem, 6)?;

        // B ran first and was refused, it parks again.
        assert_eq!(sems.try_acquire(sem, b, 1), 0);
        assert!(sems.add_waiter(sem, b));
        assert!(sems.take_unblocked(sem).is_empty());

        assert_eq!(sems.try_acquire(sem, a, 5), 5);
        assert_eq!(sems.take_unblocked(sem), BTreeSet::from([b]));
        assert!(sems.take_unblocked(sem).is_empty());
        Ok(())
    }

    #[test]
    fn test_nothing_unblocked_when_empty() -> Result<()> {
        let mut sems = SemRegistry::default();
        let sem = sems.create(2);
        let waiter = Id::next();

        assert_eq!(sems.try_acquire(sem, Id::next(), 2), 2);
        assert!(sems.add_waiter(sem, waiter));
        assert!(sems.take_unblocked(sem).is_empty());
        Ok(())
    }

    #[test]
    fn test_restore_by_non_acquirer_is_noop() {
        let mut sems = SemRegistry::default();
        let sem = sems.create(0);
        let (a, b) = (Id::next(), Id::next());

        assert_eq!(sems.try_acquire(sem, a, 1), 0);
        assert!(sems.restore(sem, b).is_empty());
        assert_eq!(sems.acquirer(sem), Some(a));
    }

    #[test]
    fn test_release_overflow_counts_partial_grant() {
        let mut sems = SemRegistry::default();
        let sem = sems.create(u64::MAX - 10);
        let a = Id::next();

        assert_eq!(sems.try_acquire(sem, a, u64::MAX), u64::MAX - 10);
        assert!(sems.release(sem, 10).is_ok());
        assert!(matches!(sems.release(sem, 1), Err(Error::Overflow(_))));
        assert_eq!(sems.total(sem), u64::MAX);
    }

    #[test]
    fn test_destroy() -> Result<()> {
        let mut sems = SemRegistry::default();
        let sem = sems.create(0);
        let waiter = Id::next();

        sems.add_waiter(sem, waiter);
        assert_eq!(sems.destroy(sem)?, BTreeSet::from([waiter]));
        assert!(!sems.contains(sem));
        assert!(!sems.add_waiter(sem, waiter));
        assert!(matches!(sems.destroy(sem), Err(Error::Invalid(_))));
        assert!(matches!(sems.release(sem, 1), Err(Error::Invalid(_))));
        Ok(())
    }

    #[test]
    fn test_value_is_conserved() -> Result<()> {
        let mut sems = SemRegistry::default();
        let sem = sems.create(7);
        let fibers: Vec<_> = (0..4).map(|_| Id::next()).collect();

        let mut acquired = 0;
        let mut released = 0;
        for round in 0..50u64 {
            let fiber = fibers[(round % 4) as usize];
            acquired += sems.try_acquire(sem, fiber, round % 5 + 1);
            if round % 3 == 0 {
                sems.release(sem, 2)?;
                released += 2;
            }
            // Whatever sits in a partial grant still counts as inside the sem.
            let held = sems.sems[&sem].acquiring.map_or(0, |(_, held)| held);
            assert_eq!(sems.total(sem) + acquired - held, 7 + released);
        }
        Ok(())
    }
}
