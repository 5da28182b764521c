//! A stackful fiber runtime: one cooperative scheduler per OS thread, an epoll
//! reactor for sockets, a timer set for sleeps and deadlines, counting
//! semaphores with partial acquisition, and stream networking built on top.
//!
//! ```no_run
//! use std::time::Duration;
//!
//! fibolo::runtime::Builder::new_local()
//!     .try_build()
//!     .unwrap()
//!     .block_on(|| {
//!         fibolo::spawn(|| println!("hello from a fiber"));
//!         fibolo::time::sleep(Duration::from_millis(10)).unwrap();
//!     });
//! ```

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("fibolo only supports Linux on x86_64 and aarch64 (epoll(7) + native context switch).");

#[doc(inline)]
pub use fibolo_macros::main;

#[doc(inline)]
pub use fibolo_macros::test;

mod context;

pub mod error;
pub use error::{Error, Result};

pub mod fd;
pub use fd::Fd;

pub mod net;

pub mod runtime;
pub use runtime::{block_on, init, is_inited, must_init, spawn, spawn_with_stack};

pub mod sync;

pub mod task;

pub mod time;

mod utils;

#[cfg(test)]
mod test_utils;
