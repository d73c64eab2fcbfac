//! Shared concurrency helpers.

pub mod monitor;

pub use monitor::Monitor;
