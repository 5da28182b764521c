//! Fiber synchronization primitives.

mod registry;
pub(crate) use registry::{SemId, SemRegistry};

mod sem;
pub use sem::Sem;
