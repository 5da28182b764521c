//! Fibers: lightweight stackful tasks multiplexed on one OS thread.

mod fiber;
pub(crate) use fiber::{Entry, Fiber, WaitingEvents};

mod id;
pub use id::{Id, id, try_id};

mod stack;
pub(crate) use stack::Stack;

pub(crate) mod switch;

/// Smallest fiber stack handed out, requests below are rounded up.
pub const STACK_SIZE_MIN: usize = 128 * 1024;

/// Largest fiber stack handed out, requests above are clamped.
pub const STACK_SIZE_MAX: usize = 8 * 1024 * 1024;

pub(crate) fn clamp_stack_size(size: usize) -> usize {
    size.clamp(STACK_SIZE_MIN, STACK_SIZE_MAX)
}
