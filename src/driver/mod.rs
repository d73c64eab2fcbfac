//! The driver seam.
//!
//! A [`Driver`] enumerates devices and builds [`Cruncher`]s for them.
//! The real compiler, command queues, and device buffers live behind
//! this trait; the crate ships [`host::HostDriver`], a host-memory
//! reference implementation used by tests and benches.

pub mod host;

pub use host::{HostDriver, KernelIo};

use crate::cruncher::Cruncher;
use crate::device::{AcceleratorMask, DeviceDescriptor};
use crate::error::Result;
use std::sync::Arc;

/// Options passed to a driver when building a cruncher.
#[derive(Debug, Clone)]
pub struct CruncherOptions {
    /// Disable the driver's own read-compute-write pipelining
    pub no_pipelining: bool,
    /// Asynchronous command queues per device (1..=16)
    pub queue_concurrency: usize,
    /// Request a device-side default queue (source uses `enqueue_kernel`)
    pub device_side_queue: bool,
    /// Request streaming (host-visible) buffers
    pub stream: bool,
}

impl Default for CruncherOptions {
    fn default() -> Self {
        Self {
            no_pipelining: false,
            queue_concurrency: 16,
            device_side_queue: false,
            stream: true,
        }
    }
}

/// Enumerates devices and compiles kernel source into crunchers.
pub trait Driver: Send + Sync {
    /// Devices matching `mask`, in a stable order.
    fn enumerate(&self, mask: AcceleratorMask) -> Vec<DeviceDescriptor>;

    /// Compile `source` for `devices` and return the dispatch engine.
    fn build_cruncher(
        &self,
        devices: &[DeviceDescriptor],
        source: &str,
        opts: &CruncherOptions,
    ) -> Result<Arc<dyn Cruncher>>;
}
