//! Reusable pools of tasks and groups.

use super::group::{GroupKind, TaskGroup};
use super::task::Task;
use crate::util::Monitor;
use std::sync::Arc;

/// Consumption policy of a task pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    /// Once selected, devices drain this pool before moving on
    Complete,
    /// Devices may rotate across pools at any time
    Async,
    /// Devices must rotate pools on every step
    Sync,
}

/// A task handed out by a pool, with the group it came from.
#[derive(Clone)]
pub struct Dispatch {
    /// The task to execute
    pub task: Arc<Task>,
    /// The group constraining its routing, if any
    pub group: Option<Arc<TaskGroup>>,
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("task", &self.task.id())
            .field("grouped", &self.group.is_some())
            .finish()
    }
}

enum Entry {
    Task { task: Arc<Task>, taken: bool },
    Group(Arc<TaskGroup>),
}

impl Entry {
    fn consumed(&self) -> bool {
        match self {
            Entry::Task { taken, .. } => *taken,
            Entry::Group(group) => group.remaining() == 0,
        }
    }
}

#[derive(Default)]
struct PoolState {
    entries: Vec<Entry>,
    counter: usize,
}

impl PoolState {
    // counter advances monotonically past the consumed prefix
    fn advance(&mut self) {
        while self.counter < self.entries.len() && self.entries[self.counter].consumed() {
            self.counter += 1;
        }
    }
}

/// Append-only, reusable list of tasks and groups.
///
/// `next_task` hands entries out in feed order and never blocks on an
/// empty pool; `reset` rewinds the counter without clearing the list.
pub struct TaskPool {
    kind: PoolKind,
    state: Monitor<PoolState>,
}

impl TaskPool {
    /// Empty pool with the given consumption policy.
    pub fn new(kind: PoolKind) -> Self {
        Self {
            kind,
            state: Monitor::new(PoolState::default()),
        }
    }

    /// The pool's consumption policy
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Append a task and pulse waiters.
    pub fn feed(&self, task: Task) {
        self.state.lock().entries.push(Entry::Task {
            task: Arc::new(task),
            taken: false,
        });
        self.state.pulse_all();
    }

    /// Append a group and pulse waiters.
    pub fn feed_group(&self, group: TaskGroup) {
        self.state
            .lock()
            .entries
            .push(Entry::Group(Arc::new(group)));
        self.state.pulse_all();
    }

    /// Number of fed entries
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if nothing was fed
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Entries not yet fully consumed
    pub fn remaining(&self) -> usize {
        let mut state = self.state.lock();
        state.advance();
        state.entries.len().saturating_sub(state.counter)
    }

    /// Rewind the counter without clearing the list.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.counter = 0;
        for entry in &mut state.entries {
            match entry {
                Entry::Task { taken, .. } => *taken = false,
                Entry::Group(group) => group.reset(),
            }
        }
        drop(state);
        self.state.pulse_all();
    }

    /// Hand out the next task in feed order, or `None` when drained.
    pub fn next_task(&self) -> Option<Dispatch> {
        let mut state = self.state.lock();
        loop {
            state.advance();
            let counter = state.counter;
            let entry = state.entries.get_mut(counter)?;
            match entry {
                Entry::Task { task, taken } => {
                    *taken = true;
                    let task = Arc::clone(task);
                    state.advance();
                    return Some(Dispatch { task, group: None });
                }
                Entry::Group(group) => {
                    let group = Arc::clone(group);
                    match group.next() {
                        Some(task) => {
                            state.advance();
                            return Some(Dispatch {
                                task,
                                group: Some(group),
                            });
                        }
                        None => {
                            state.counter += 1;
                            continue;
                        }
                    }
                }
            }
        }
    }

    /// Hand out the pending task minimising `selector`, respecting a
    /// draining `Complete` group at the head.
    fn take_by_key<F>(&self, selector: F, smallest: bool) -> Option<Dispatch>
    where
        F: Fn(&Task) -> i64,
    {
        let mut state = self.state.lock();
        state.advance();

        // A half-drained Complete group blocks out-of-order selection.
        if let Some(Entry::Group(group)) = state.entries.get(state.counter) {
            if group.kind() == GroupKind::Complete && group.remaining() > 0 {
                let group = Arc::clone(group);
                let task = group.next()?;
                state.advance();
                return Some(Dispatch {
                    task,
                    group: Some(group),
                });
            }
        }

        let mut best: Option<(i64, usize)> = None;
        for index in state.counter..state.entries.len() {
            let candidate = match &state.entries[index] {
                Entry::Task { task, taken } if !*taken => Some(selector(task)),
                Entry::Group(group) => group.peek().map(|t| selector(&t)),
                _ => None,
            };
            if let Some(key) = candidate {
                let better = match best {
                    None => true,
                    Some((best_key, _)) => {
                        if smallest {
                            key < best_key
                        } else {
                            key > best_key
                        }
                    }
                };
                if better {
                    best = Some((key, index));
                }
            }
        }

        let (_, index) = best?;
        let dispatch = match &mut state.entries[index] {
            Entry::Task { task, taken } => {
                *taken = true;
                Dispatch {
                    task: Arc::clone(task),
                    group: None,
                }
            }
            Entry::Group(group) => {
                let group = Arc::clone(group);
                let task = group.next()?;
                Dispatch {
                    task,
                    group: Some(group),
                }
            }
        };
        state.advance();
        Some(dispatch)
    }

    /// Shortest-job-first selection by `Task::cost`.
    pub fn take_shortest(&self) -> Option<Dispatch> {
        self.take_by_key(|t| t.cost() as i64, true)
    }

    /// Highest user-assigned priority first.
    pub fn take_highest_priority(&self) -> Option<Dispatch> {
        self.take_by_key(|t| t.priority() as i64, false)
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .field("remaining", &self.remaining())
            .finish()
    }
}
