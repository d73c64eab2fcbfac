//! The compute-dispatch contract and its facade.
//!
//! A [`Cruncher`] is the external compile-and-dispatch engine: it owns the
//! compiled kernels for one device set and executes `compute` calls
//! against argument groups. The core never inspects device internals
//! beyond this contract. [`CruncherFacade`] wraps a cruncher with kernel
//! name discovery, the compile-error gate, and mode pass-throughs.

pub mod facade;

pub use facade::CruncherFacade;

use crate::buffer::ArgGroup;
use crate::error::Result;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_COMPUTE_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate a process-unique compute id.
pub fn next_compute_id() -> u32 {
    NEXT_COMPUTE_ID.fetch_add(1, Ordering::Relaxed)
}

/// How the driver overlaps the read-compute-write triple internally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPipelineKind {
    /// Event-chained pipelining
    Event,
    /// Driver-managed queues
    DriverManaged,
}

/// Request for driver-side pipelining of a single compute call.
#[derive(Debug, Clone, Copy)]
pub struct DriverPipeline {
    /// Overlap strategy
    pub kind: DriverPipelineKind,
    /// Number of blobs the range is split into
    pub blobs: usize,
}

/// A fully-described compute dispatch.
#[derive(Debug, Clone)]
pub struct ComputeSpec {
    /// Identifies the load-balancing context of this dispatch
    pub compute_id: u32,
    /// Space-separated kernel names executed in order
    pub kernels: String,
    /// Total number of work items
    pub global: usize,
    /// Work items per work group
    pub local: usize,
    /// First work-item index
    pub offset: usize,
    /// Driver-side pipelining request, if any
    pub driver_pipeline: Option<DriverPipeline>,
}

impl ComputeSpec {
    /// Describe a dispatch with offset zero and no driver pipelining.
    pub fn new<S: Into<String>>(compute_id: u32, kernels: S, global: usize, local: usize) -> Self {
        Self {
            compute_id,
            kernels: kernels.into(),
            global,
            local,
            offset: 0,
            driver_pipeline: None,
        }
    }

    /// Set the first work-item index
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Request driver-side pipelining
    pub fn with_driver_pipeline(mut self, pipeline: DriverPipeline) -> Self {
        self.driver_pipeline = Some(pipeline);
        self
    }
}

/// Minimal contract required of an external compute engine.
///
/// Mode setters use interior mutability: a cruncher is shared behind an
/// `Arc` between the facade and the consumer thread that owns it.
pub trait Cruncher: Send + Sync {
    /// Execute `spec` against `args`, honouring the per-argument transfer
    /// flags and the current modes.
    fn compute(&self, args: &ArgGroup, spec: &ComputeSpec) -> Result<()>;

    /// Elide automatic per-kernel reads/writes; the caller fuses a kernel
    /// sequence under one enveloping transfer pair.
    fn set_enqueue_mode(&self, on: bool);

    /// Current enqueue-mode state
    fn enqueue_mode(&self) -> bool;

    /// Enqueue mode with asynchronous queue selection
    fn set_enqueue_mode_async(&self, on: bool);

    /// Skip kernel launches; honour transfer flags only
    fn set_no_compute_mode(&self, on: bool);

    /// Current no-compute state
    fn no_compute_mode(&self) -> bool;

    /// Pin dispatches to explicit command queues
    fn set_fine_grained_queue_control(&self, on: bool);

    /// Smooth the load balancer's range redistribution
    fn set_smooth_load_balancer(&self, on: bool);

    /// Feed performance measurements back to the balancer
    fn set_performance_feed(&self, on: bool);

    /// Flush queued commands toward the devices
    fn flush(&self);

    /// Number of markers retired across all queues
    fn count_markers(&self) -> u64;

    /// Number of marker callbacks fired
    fn count_marker_callbacks(&self) -> u64;

    /// Names of the devices this cruncher was built for
    fn device_names(&self) -> Vec<String>;

    /// Index of the command queue the first device used last
    fn last_used_queue_of_first_device(&self) -> usize;

    /// Relative throughput per device
    fn throughputs(&self) -> Vec<f64>;

    /// Relative share of the global range per device for `compute_id`
    fn relative_global_ranges(&self, compute_id: u32) -> Vec<f64>;

    /// Non-zero after a failed build
    fn error_code(&self) -> i32;

    /// Build log or failure message
    fn error_message(&self) -> String;

    /// Release device resources; further compute calls fail
    fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_ids_unique() {
        let a = next_compute_id();
        let b = next_compute_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_spec_builders() {
        let spec = ComputeSpec::new(7, "scale", 1024, 64)
            .with_offset(128)
            .with_driver_pipeline(DriverPipeline {
                kind: DriverPipelineKind::Event,
                blobs: 4,
            });
        assert_eq!(spec.offset, 128);
        assert_eq!(spec.driver_pipeline.unwrap().blobs, 4);
    }
}
