use crate::task::Id;
use std::collections::BTreeSet;
use std::time::Instant;

/// Deadlines of parked fibers, ordered by expiry. Ties are broken by fiber
/// id, so simultaneous deadlines expire in creation order.
#[derive(Debug, Default)]
pub(crate) struct Timers {
    entries: BTreeSet<(Instant, Id)>,
}

impl Timers {
    pub(crate) fn insert(&mut self, deadline: Instant, id: Id) {
        self.entries.insert((deadline, id));
    }

    pub(crate) fn remove(&mut self, deadline: Instant, id: Id) {
        self.entries.remove(&(deadline, id));
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.entries.first().map(|(deadline, _)| *deadline)
    }

    /// Removes and returns every fiber whose deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<Id> {
        let mut expired = Vec::new();

        while let Some((deadline, id)) = self.entries.first().copied() {
            if deadline > now {
                break;
            }
            self.entries.pop_first();
            expired.push(id);
        }

        expired
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let mut timers = Timers::default();
        let now = Instant::now();
        let (a, b, c) = (Id::next(), Id::next(), Id::next());

        timers.insert(now + Duration::from_millis(20), a);
        timers.insert(now + Duration::from_millis(10), b);
        timers.insert(now + Duration::from_millis(30), c);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(timers.pop_expired(now).is_empty());
        assert_eq!(timers.pop_expired(now + Duration::from_millis(20)), vec![b, a]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_deadline_equal_to_now_expires() {
        let mut timers = Timers::default();
        let now = Instant::now();
        let (a, b) = (Id::next(), Id::next());

        timers.insert(now, b);
        timers.insert(now, a);

        assert_eq!(timers.pop_expired(now), vec![a, b]);
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn test_remove() {
        let mut timers = Timers::default();
        let now = Instant::now();
        let a = Id::next();

        timers.insert(now, a);
        timers.remove(now, a);
        timers.remove(now, a);

        assert!(timers.pop_expired(now).is_empty());
    }
}
