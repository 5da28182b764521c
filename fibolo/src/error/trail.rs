//! Per-thread error trail.
//!
//! The innermost failure sets the message with [`set_err`], each caller on
//! the way up may append its position with [`push_err_bt`], and [`err`]
//! renders the whole chain:
//!
//! ```text
//! connect failed: Connection refused (os error 111) <errno=111> at src/net/connect.rs:71
//!   from src/app.rs:12
//! ```

use crate::utils::sys::{errno, set_errno};
use std::cell::RefCell;
use std::panic::Location;

/// Entries beyond this are dropped, the message itself is always kept.
const MAX_TRAIL_LEN: usize = 64;

const SEPARATOR: &str = "\n  from ";

thread_local! {
    static TRAIL: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Replaces the current trail with `msg`, tagged with the caller position.
///
/// `errno` is left untouched.
#[track_caller]
pub fn set_err(msg: impl Into<String>) {
    let loc = Location::caller();
    let msg = format!("{} at {}:{}", msg.into(), loc.file(), loc.line());

    TRAIL.with_borrow_mut(|trail| {
        trail.clear();
        trail.push(msg);
    });
}

/// Appends the caller position to the current trail.
#[track_caller]
pub fn push_err_bt() {
    let loc = Location::caller();

    TRAIL.with_borrow_mut(|trail| {
        if trail.len() < MAX_TRAIL_LEN {
            trail.push(format!("{}:{}", loc.file(), loc.line()));
        }
    });
}

/// Renders the trail of the last failure on this thread.
pub fn err() -> String {
    TRAIL.with_borrow(|trail| trail.join(SEPARATOR))
}

/// Saves the error trail and `errno` on creation and restores both on drop.
///
/// Cleanup code that may itself fail (closing a half-connected socket for
/// instance) runs under a guard so the caller still observes the original
/// failure.
#[must_use = "the trail is restored when the guard is dropped"]
#[derive(Debug)]
pub struct ErrGuard {
    trail: Vec<String>,
    errno: i32,
}

impl ErrGuard {
    pub fn new() -> Self {
        let trail = TRAIL.with_borrow_mut(std::mem::take);
        let errno = errno();
        set_errno(0);

        Self { trail, errno }
    }
}

impl Default for ErrGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ErrGuard {
    fn drop(&mut self) {
        let trail = std::mem::take(&mut self.trail);
        TRAIL.with_borrow_mut(|t| *t = trail);
        set_errno(self.errno);
    }
}
