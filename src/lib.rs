//! STRATA - Staged Transfer and Adaptive Task Allocation
//!
//! A heterogeneous-compute orchestration layer: express a computation as
//! named kernels over typed arrays, then run it across a pool of devices
//! with double-buffered multi-stage pipelines and a choice of scheduling
//! disciplines. The driver (kernel compiler, command queues, device
//! buffers) stays behind the [`driver::Driver`] seam; a host-memory
//! reference driver ships in-tree.
//!
//! # Quick Start
//!
//! ```no_run
//! use strata::prelude::*;
//!
//! let driver = HostDriver::new();
//! driver.define_kernel("scale2", |gid, io| {
//!     let v = io.f32(0, gid);
//!     io.set_f32(1, gid, v * 2.0);
//! });
//!
//! let devices = DeviceSet::all(driver, AcceleratorMask::GPU).unwrap();
//! let stage = PipelineStage::new();
//! stage
//!     .add_devices(devices)
//!     .add_kernels("kernel void scale2() {}", &["scale2"], &[4], &[1])
//!     .add_input_buffers(&[ArrayHandle::zeroed(ElementKind::F32, 4)])
//!     .add_output_buffers(&[ArrayHandle::zeroed(ElementKind::F32, 4)]);
//!
//! let pipeline = stage.make_pipeline().unwrap();
//! let input = [1.0f32, 2.0, 3.0, 4.0];
//! let mut output = [0.0f32; 4];
//! loop {
//!     let ready = pipeline.push(
//!         Some(&[HostSlice::F32(&input)]),
//!         Some(&mut [HostSliceMut::F32(&mut output)]),
//!     );
//!     if ready {
//!         break;
//!     }
//! }
//! ```
//!
//! # Subsystems
//!
//! - **Pipeline engine** ([`pipeline`]): N stages, each owning its
//!   kernels, devices, and buffers; adjacent stages connected by
//!   double-buffered edges so one side computes while the other is
//!   shuttled.
//! - **Single-device pipeline** ([`device_pipeline`]): all stages on one
//!   device, overlapping read/compute/write through asynchronous command
//!   queues and on-device transition arrays.
//! - **Task pools** ([`pool`]): captured compute calls grouped under
//!   execution policies and scheduled across devices by a producer/
//!   consumer pool with round-robin, FCFS, shortest-job-first,
//!   quantised, priority, packet, and compute-at-will disciplines.

#![warn(missing_docs, missing_debug_implementations)]

pub mod buffer;
pub mod config;
pub mod cruncher;
pub mod device;
pub mod device_pipeline;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod pool;
pub mod prelude;
pub mod telemetry;
pub mod util;

pub use buffer::{ArrayHandle, ElementKind, HostSlice, HostSliceMut};
pub use config::FacadeConfig;
pub use cruncher::CruncherFacade;
pub use device::{AcceleratorMask, DeviceSet};
pub use error::{Error, Result};
pub use pipeline::{Pipeline, PipelineStage};
