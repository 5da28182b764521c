//! The per-thread loop: resume ready fibers, expire deadlines, poll epoll.
//!
//! Fibers run on their own stacks and come back here whenever they park.
//! Nothing borrowed from the thread-local core may be held across a switch,
//! in either direction.

use crate::context::{self, with_context, with_core, with_core_mut};
use crate::error::{Error, Result};
use crate::task::{self, Fiber, Id, WaitingEvents, switch};
use std::panic;
use std::ptr::NonNull;
use std::time::Instant;

/// Creates a fiber running `f` and makes it ready. It first runs on the next
/// pass of the loop, the caller keeps running.
pub(crate) fn spawn_fiber(f: task::Entry, stack_size: usize) -> Id {
    let id = Id::next();
    let fiber = Fiber::new(id, f, task::clamp_stack_size(stack_size));

    with_core_mut(|core| core.insert(fiber));
    tracing::trace!(fiber = %id, stack_size, "spawned");
    id
}

/// Parks the running fiber on `events` and switches to the scheduler. With
/// empty `events` the fiber is simply moved to the back of the line.
///
/// # Panics
///
/// Panics outside a fiber, the scheduler loop itself can't park.
#[track_caller]
pub(crate) fn suspend(events: WaitingEvents) {
    let fiber = context::current_fiber().expect("only fibers can be suspended");

    // Safety: the running fiber outlives its own suspension.
    let fiber = unsafe { fiber.as_ref() };
    with_core_mut(|core| core.park(fiber.id(), events));
    switch_out(fiber);
}

/// Saves the fiber's context and resumes the scheduler loop. Returns once the
/// scheduler resumes the fiber again.
pub(crate) fn switch_out(fiber: &Fiber) {
    let sched_sp = context::scheduler_sp();
    unsafe { switch::switch(fiber.sp_slot(), sched_sp) };
}

fn resume(fiber: NonNull<Fiber>) {
    let prev = context::set_current_fiber(Some(fiber));
    debug_assert!(prev.is_none(), "nested fiber resume");

    let sched_sp = context::scheduler_sp_slot();
    // Safety: the fiber is owned by the core and only freed by this loop.
    unsafe { switch::switch(sched_sp, fiber.as_ref().saved_sp()) };

    context::set_current_fiber(None);
}

/// Resumes every fiber that was ready when the pass started, in creation
/// order. Fibers made ready meanwhile wait for the next pass.
///
/// A panic escaping a fiber is re-raised here, once the fiber is freed and
/// the rest of the snapshot has been put back in the ready set.
fn run_ready() {
    let ready = with_core_mut(|core| std::mem::take(&mut core.ready));
    let mut ready = ready.into_iter();

    while let Some(id) = ready.next() {
        let Some(fiber) = with_core(|core| core.fibers.get(&id).map(|f| NonNull::from(&**f))) else {
            continue;
        };

        resume(fiber);

        // Safety: still owned by the core, nothing frees fibers but us.
        if !unsafe { fiber.as_ref() }.is_finished() {
            continue;
        }

        let Some(fiber) = with_core_mut(|core| core.fibers.remove(&id)) else {
            continue;
        };
        tracing::trace!(fiber = %id, "finished");

        if let Some(payload) = fiber.take_panic() {
            drop(fiber);
            with_core_mut(|core| core.ready.extend(ready));
            panic::resume_unwind(payload);
        }
    }
}

/// One full pass of the loop.
fn turn() -> Result<()> {
    run_ready();
    poll()
}

fn poll() -> Result<()> {
    let poll_interval = with_context(|ctx| ctx.cfg.poll_interval);

    with_core_mut(|core| {
        core.expire_timers(Instant::now());

        let timeout = core.poll_timeout(poll_interval, Instant::now());
        core.poll(timeout).map_err(|e| {
            tracing::error!(%e, "epoll_wait failed");
            Error::SysCall(e)
        })
    })
}

/// Drives the loop until `done` holds, checked after the ready fibers of
/// each pass ran.
pub(crate) fn run_until(done: impl Fn() -> bool) -> Result<()> {
    assert!(
        context::current_fiber().is_none(),
        "the scheduler loop can't be driven from inside a fiber"
    );

    loop {
        run_ready();
        if done() {
            return Ok(());
        }
        poll()?;
    }
}

/// Drives the loop forever, only returns if the reactor fails.
pub(crate) fn run_forever() -> Result<std::convert::Infallible> {
    assert!(
        context::current_fiber().is_none(),
        "the scheduler loop can't be driven from inside a fiber"
    );

    loop {
        turn()?;
    }
}
