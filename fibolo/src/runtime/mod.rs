use crate::context;
use crate::task::Id;
use std::cell::Cell;
use std::rc::Rc;

// Public API
pub mod runtime;
pub use runtime::{Builder, Runtime};

pub(crate) use runtime::RuntimeConfig;

pub(crate) mod reactor;

pub(crate) mod scheduler;

pub(crate) mod timers;

#[cfg(test)]
mod tests;

/// Initializes the current thread's runtime with default settings. Does
/// nothing if the thread already has one.
pub fn init() -> anyhow::Result<()> {
    if is_inited() {
        return Ok(());
    }
    Builder::new_local().try_build().map(|_| ())
}

/// Whether the current thread has a runtime.
pub fn is_inited() -> bool {
    context::is_inited()
}

/// Like [`init`], but aborts the process on failure.
pub fn must_init() {
    if let Err(e) = init() {
        tracing::error!(%e, "failed to initialize runtime");
        eprintln!("fibolo: failed to initialize runtime: {e:?}");
        std::process::abort();
    }
}

/// Spawns a fiber running `f` on the current thread, with the runtime's
/// default stack size.
///
/// The fiber first runs on the next pass of the scheduler loop; the caller
/// keeps running until it parks.
///
/// # Panics
///
/// Panics if the thread has no runtime.
#[track_caller]
pub fn spawn<F>(f: F) -> Id
where
    F: FnOnce() + 'static,
{
    let stack_size = context::with_context(|ctx| ctx.cfg.stack_size);
    spawn_with_stack(f, stack_size)
}

/// Like [`spawn`] with an explicit stack size, clamped to
/// [`STACK_SIZE_MIN`](crate::task::STACK_SIZE_MIN)..=[`STACK_SIZE_MAX`](crate::task::STACK_SIZE_MAX).
#[track_caller]
pub fn spawn_with_stack<F>(f: F, stack_size: usize) -> Id
where
    F: FnOnce() + 'static,
{
    scheduler::spawn_fiber(Box::new(f), stack_size)
}

/// Runs `f` in a fiber on the current thread's runtime and drives the
/// scheduler until it returns.
///
/// # Panics
///
/// Panics if the thread has no runtime, if called from inside a fiber, if
/// `f` panics, or if epoll fails.
#[track_caller]
pub fn block_on<F, R>(f: F) -> R
where
    F: FnOnce() -> R + 'static,
    R: 'static,
{
    assert!(
        context::current_fiber().is_none(),
        "block_on can't be called from inside a fiber"
    );

    let slot = Rc::new(Cell::new(None));

    let output = slot.clone();
    let id = spawn(move || output.set(Some(f())));

    let done = || context::with_core(|core| !core.fibers.contains_key(&id));
    if let Err(e) = scheduler::run_until(done) {
        panic!("Failed to drive fiber to completion: {e:?}");
    }

    match slot.take() {
        Some(v) => v,
        None => unreachable!("root fiber finished without output"),
    }
}
