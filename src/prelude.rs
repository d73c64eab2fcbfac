//! Convenience re-exports.

pub use crate::buffer::{
    ArgFlags, ArgGroup, ArrayData, ArrayHandle, ElementKind, HostSlice, HostSliceMut, StageBuffer,
};
pub use crate::config::FacadeConfig;
pub use crate::cruncher::{ComputeSpec, Cruncher, CruncherFacade};
pub use crate::device::{AcceleratorMask, DeviceDescriptor, DeviceSet};
pub use crate::device_pipeline::{BufferRole, DevicePipeline, DeviceStage};
pub use crate::driver::{Driver, HostDriver, KernelIo};
pub use crate::error::{Error, Result};
pub use crate::pipeline::{Pipeline, PipelineStage};
pub use crate::pool::{
    DevicePool, GroupKind, PoolDiscipline, PoolKind, Task, TaskGroup, TaskPool, WorkOrder,
    WorkerMode,
};
