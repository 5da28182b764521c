use crate::context;
use std::sync::atomic::{AtomicU64, Ordering};
use std::{fmt, num::NonZeroU64};

/// An opaque ID that uniquely identifies a fiber.
///
/// IDs are handed out from a monotonically increasing counter, so comparing
/// two IDs tells which fiber was spawned first. The scheduler relies on this
/// to resume ready fibers in creation order.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, PartialOrd, Ord)]
pub struct Id(pub(crate) NonZeroU64);

/// Returns the [`Id`] of the currently running fiber.
///
/// # Panics
///
/// Panics if called from outside a fiber. See [`try_id`] for a version that
/// doesn't.
#[track_caller]
pub fn id() -> Id {
    context::current_fiber_id().expect("Can't get a fiber id when not inside a fiber")
}

/// Returns the [`Id`] of the currently running fiber, or `None` if called
/// outside of one.
pub fn try_id() -> Option<Id> {
    context::current_fiber_id()
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Id {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);

        let id = COUNTER.fetch_add(1, Ordering::Relaxed);

        // Would take centuries to wrap even at a billion spawns per second.
        let Some(id) = NonZeroU64::new(id) else {
            Self::exhausted();
        };

        Self(id)
    }

    #[cold]
    fn exhausted() -> ! {
        panic!("failed to generate unique fiber ID: bitspace exhausted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_increasing() {
        let ids: Vec<_> = (0..13).map(|_| Id::next()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
