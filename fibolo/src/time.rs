//! Suspension points based on time.

use crate::context;
use crate::error::{Error, Result, fail};
use crate::runtime::scheduler;
use crate::task::WaitingEvents;
use std::time::{Duration, Instant};

/// Parks the current fiber for at least `duration`.
///
/// Sleeping zero returns immediately without giving other fibers a chance to
/// run, use [`yield_now`] for that.
pub fn sleep(duration: Duration) -> Result<()> {
    if context::current_fiber().is_none() {
        return fail(Error::invalid("sleep can only be called from a fiber"));
    }
    if duration.is_zero() {
        return Ok(());
    }

    scheduler::suspend(WaitingEvents::new().deadline(Some(Instant::now() + duration)));
    Ok(())
}

/// Moves the current fiber to the next pass of the scheduler loop, after the
/// fibers still due in this one.
pub fn yield_now() -> Result<()> {
    if context::current_fiber().is_none() {
        return fail(Error::invalid("yield_now can only be called from a fiber"));
    }

    scheduler::suspend(WaitingEvents::new());
    Ok(())
}
