use crate::runtime::RuntimeConfig;
use crate::task::{Fiber, Id};
use anyhow::{Result, anyhow};
use std::cell::{Cell, OnceCell, RefCell};
use std::ptr::NonNull;
use std::thread_local;

mod core;
pub(crate) use core::Core;

mod generation;
pub(crate) use generation::Generations;

/// Per-thread runtime state. Lives until the thread exits.
pub(crate) struct Context {
    pub(crate) cfg: RuntimeConfig,

    pub(crate) core: RefCell<Core>,

    /// Stack pointer of the scheduler loop, saved while a fiber runs. Kept
    /// out of `core` since fibers switch back while no borrow may be held.
    sched_sp: Cell<usize>,

    /// Fiber currently running on this thread, if any.
    current: Cell<Option<NonNull<Fiber>>>,
}

thread_local! {
    static CONTEXT: OnceCell<Context> = const { OnceCell::new() };
}

pub(crate) fn init_context(cfg: RuntimeConfig) -> Result<()> {
    CONTEXT.with(|ctx| {
        if ctx.get().is_some() {
            return Err(anyhow!(
                "Cannot create a new Runtime: a runtime is already active on this thread."
            ));
        }

        let core = Core::try_new(&cfg)?;
        let context = Context {
            cfg,
            core: RefCell::new(core),
            sched_sp: Cell::new(0),
            current: Cell::new(None),
        };

        ctx.set(context)
            .map_err(|_| anyhow!("thread-local context initialized twice"))
    })
}

pub(crate) fn is_inited() -> bool {
    CONTEXT.with(|ctx| ctx.get().is_some())
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_context<F, R>(f: F) -> R
where
    F: FnOnce(&Context) -> R,
{
    CONTEXT.with(|ctx| f(ctx.get().expect("Context not initialized")))
}

#[inline(always)]
pub(crate) fn try_with_context<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&Context) -> R,
{
    CONTEXT.with(|ctx| ctx.get().map(f))
}

/// Borrowed for the duration of `f` only: `f` must never suspend the
/// current fiber.
#[track_caller]
#[inline(always)]
pub(crate) fn with_core<F, R>(f: F) -> R
where
    F: FnOnce(&Core) -> R,
{
    with_context(|ctx| f(&ctx.core.borrow()))
}

#[track_caller]
#[inline(always)]
pub(crate) fn with_core_mut<F, R>(f: F) -> R
where
    F: FnOnce(&mut Core) -> R,
{
    with_context(|ctx| f(&mut ctx.core.borrow_mut()))
}

pub(crate) fn current_fiber() -> Option<NonNull<Fiber>> {
    try_with_context(|ctx| ctx.current.get()).flatten()
}

pub(crate) fn current_fiber_id() -> Option<Id> {
    // Safety: the running fiber is alive, it is only freed once finished and
    // switched out, after `current` was cleared.
    current_fiber().map(|fiber| unsafe { fiber.as_ref() }.id())
}

pub(crate) fn set_current_fiber(fiber: Option<NonNull<Fiber>>) -> Option<NonNull<Fiber>> {
    with_context(|ctx| ctx.current.replace(fiber))
}

/// Slot the scheduler loop saves its stack pointer into when resuming a fiber.
pub(crate) fn scheduler_sp_slot() -> *mut usize {
    with_context(|ctx| ctx.sched_sp.as_ptr())
}

pub(crate) fn scheduler_sp() -> usize {
    with_context(|ctx| ctx.sched_sp.get())
}
