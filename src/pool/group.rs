//! Task groups and their execution policies.

use super::task::Task;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Execution policy of a task group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    /// Drain this group before any other group of the same pool
    Complete,
    /// No ordering constraint between groups
    Async,
    /// Every task goes to the same consumer; which one is free
    SameDevice,
    /// Same device, and the mapping survives a pool reset
    RepeatSameDevice,
    /// One in-order command queue of one device
    InOrder,
    /// In-order, and the queue binding survives a pool reset
    RepeatInOrder,
}

/// An ordered list of tasks sharing one execution policy.
pub struct TaskGroup {
    kind: GroupKind,
    tasks: Vec<Arc<Task>>,
    cursor: AtomicUsize,
    bound_device: Mutex<Option<usize>>,
}

impl TaskGroup {
    /// Empty group with the given policy.
    pub fn new(kind: GroupKind) -> Self {
        Self {
            kind,
            tasks: Vec::new(),
            cursor: AtomicUsize::new(0),
            bound_device: Mutex::new(None),
        }
    }

    /// Append a task.
    pub fn add(mut self, task: Task) -> Self {
        self.tasks.push(Arc::new(task));
        self
    }

    /// The group's policy
    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// Number of tasks in the group
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True if the group holds no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Pop the next task of the group, advancing the cursor.
    pub fn next(&self) -> Option<Arc<Task>> {
        let index = self.cursor.fetch_add(1, Ordering::AcqRel);
        self.tasks.get(index).cloned()
    }

    /// The task the cursor points at, without advancing.
    pub fn peek(&self) -> Option<Arc<Task>> {
        self.tasks.get(self.cursor.load(Ordering::Acquire)).cloned()
    }

    /// Tasks not yet handed out
    pub fn remaining(&self) -> usize {
        self.tasks
            .len()
            .saturating_sub(self.cursor.load(Ordering::Acquire))
    }

    /// Rewind the cursor; non-repeat policies also forget their device.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
        if matches!(self.kind, GroupKind::SameDevice | GroupKind::InOrder) {
            *self.bound_device.lock() = None;
        }
    }

    /// True if every task must land on one consumer
    pub fn requires_same_device(&self) -> bool {
        matches!(
            self.kind,
            GroupKind::SameDevice
                | GroupKind::RepeatSameDevice
                | GroupKind::InOrder
                | GroupKind::RepeatInOrder
        )
    }

    /// True if tasks must flow through one in-order queue
    pub fn in_order(&self) -> bool {
        matches!(self.kind, GroupKind::InOrder | GroupKind::RepeatInOrder)
    }

    pub(crate) fn bound_device(&self) -> &Mutex<Option<usize>> {
        &self.bound_device
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("kind", &self.kind)
            .field("tasks", &self.tasks.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ArgGroup;

    fn dummy_task() -> Task {
        Task::new("k", ArgGroup::new(), 1, 1)
    }

    #[test]
    fn test_cursor_drains_in_order() {
        let group = TaskGroup::new(GroupKind::Async)
            .add(dummy_task())
            .add(dummy_task());
        assert_eq!(group.remaining(), 2);

        let first = group.next().unwrap();
        let second = group.next().unwrap();
        assert_ne!(first.id(), second.id());
        assert!(group.next().is_none());
        assert_eq!(group.remaining(), 0);
    }

    #[test]
    fn test_reset_policies() {
        let repeat = TaskGroup::new(GroupKind::RepeatSameDevice).add(dummy_task());
        *repeat.bound_device().lock() = Some(1);
        repeat.next();
        repeat.reset();
        assert_eq!(repeat.remaining(), 1);
        assert_eq!(*repeat.bound_device().lock(), Some(1));

        let once = TaskGroup::new(GroupKind::SameDevice).add(dummy_task());
        *once.bound_device().lock() = Some(1);
        once.reset();
        assert_eq!(*once.bound_device().lock(), None);
    }
}
