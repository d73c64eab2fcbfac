//! Captured compute calls.

use crate::buffer::ArgGroup;
use crate::cruncher::{next_compute_id, ComputeSpec, CruncherFacade, DriverPipeline};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// A deferred compute call with frozen argument state.
///
/// The argument group, ranges, and flags are captured at construction
/// and never change; only the completion latch is written afterwards.
pub struct Task {
    id: TaskId,
    spec: ComputeSpec,
    args: ArgGroup,
    elems_per_item: Vec<usize>,
    priority: i32,
    complete: AtomicBool,
}

impl Task {
    /// Capture a compute call.
    pub fn new(kernels: &str, args: ArgGroup, global: usize, local: usize) -> Self {
        let elems_per_item = args.elems_per_item();
        Self {
            id: TaskId::next(),
            spec: ComputeSpec::new(next_compute_id(), kernels, global, local),
            args,
            elems_per_item,
            priority: 0,
            complete: AtomicBool::new(false),
        }
    }

    /// Offset the global range
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.spec.offset = offset;
        self
    }

    /// Priority for priority-based work selection (higher wins)
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Request driver-side pipelining for this dispatch
    pub fn with_driver_pipeline(mut self, pipeline: DriverPipeline) -> Self {
        self.spec.driver_pipeline = Some(pipeline);
        self
    }

    /// Forward the frozen call to a cruncher.
    pub fn compute(&self, facade: &CruncherFacade) -> Result<()> {
        facade.compute(&self.args, &self.spec)
    }

    /// Task identifier
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The frozen dispatch description
    pub fn spec(&self) -> &ComputeSpec {
        &self.spec
    }

    /// The frozen argument group
    pub fn args(&self) -> &ArgGroup {
        &self.args
    }

    /// Scheduling priority
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Work items normalised by the first argument's per-item stride;
    /// the shortest-job-first metric.
    pub fn cost(&self) -> usize {
        let per_item = self.elems_per_item.first().copied().unwrap_or(1).max(1);
        self.spec.global / per_item
    }

    /// True once a consumer finished this task
    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub(crate) fn set_complete(&self, complete: bool) {
        self.complete.store(complete, Ordering::Release);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("kernels", &self.spec.kernels)
            .field("global", &self.spec.global)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ArgFlags, ArrayHandle, ElementKind};

    #[test]
    fn test_cost_normalises_by_stride() {
        let args = ArgGroup::single(
            ArrayHandle::zeroed_with_stride(ElementKind::F32, 64, 4),
            ArgFlags::input(),
        );
        let task = Task::new("k", args, 64, 1);
        assert_eq!(task.cost(), 16);
    }

    #[test]
    fn test_builders_freeze_state() {
        let task = Task::new("k", ArgGroup::new(), 128, 8)
            .with_offset(32)
            .with_priority(5);
        assert_eq!(task.spec().offset, 32);
        assert_eq!(task.priority(), 5);
        assert!(!task.is_complete());
    }
}
