//! Deferred compute tasks, their grouping, and device-pool scheduling.

pub mod device_pool;
pub mod group;
pub mod task;
pub mod task_pool;

pub use device_pool::{DevicePool, PoolDiscipline, WorkOrder, WorkerMode};
pub use group::{GroupKind, TaskGroup};
pub use task::{Task, TaskId};
pub use task_pool::{Dispatch, PoolKind, TaskPool};
