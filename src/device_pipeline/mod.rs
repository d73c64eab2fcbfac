//! Single-device multi-queue pipelines.
//!
//! All stages run on one device; overlap comes from the cruncher's
//! asynchronous command queues plus double-buffered I/O, and adjacent
//! stages hand data over through transition arrays that never leave the
//! device.

pub mod pipeline;
pub mod stage;

pub use pipeline::DevicePipeline;
pub use stage::{BufferRole, DeviceStage};
