//! Bounded work-stealing execution for the host-side parallel phases.
//!
//! A [`WorkPool`] runs the `2N` compute/forward closures of a pipeline
//! push and the host-copy phase of the device pipeline. [`scope`] gives
//! borrowing parallel-for semantics on top of it.

pub mod job;
pub mod pool;
pub mod scope;

pub use job::Job;
pub use pool::WorkPool;
pub use scope::{scope, Scope};
