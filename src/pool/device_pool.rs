//! Producer/consumer scheduling of task pools across a set of devices.

use super::task::Task;
use super::task_pool::{Dispatch, PoolKind, TaskPool};
use crate::cruncher::CruncherFacade;
use crate::device::DeviceSet;
use crate::error::{Error, Result};
use crate::telemetry::Metrics;
use crate::util::Monitor;
use log::{error, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How the producer picks the device for the next piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Devices take turns in index order
    RoundRobin,
    /// All devices form a barrier group per batch
    Packet,
    /// First device whose queue is below the watermark
    ComputeAtWill,
}

/// How the producer picks the next task from the selected pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOrder {
    /// Feed order
    FirstComeFirstServe,
    /// Smallest `global / elements-per-item` first
    ShortestJobFirst,
    /// One read/compute/write quantum per task, revisited circularly
    RoundRobin,
    /// Highest user-assigned priority first
    PriorityBased,
}

/// Combined scheduling discipline of a device pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolDiscipline {
    /// Device selection
    pub worker: WorkerMode,
    /// Task selection
    pub work: WorkOrder,
}

impl Default for PoolDiscipline {
    fn default() -> Self {
        Self {
            worker: WorkerMode::RoundRobin,
            work: WorkOrder::FirstComeFirstServe,
        }
    }
}

const COMPUTE_AT_WILL_WATERMARK: usize = 2;
const PRODUCER_IDLE_WAIT: Duration = Duration::from_millis(1);
const CONSUMER_IDLE_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QuantumPhase {
    Read,
    Compute,
    Write,
}

enum WorkItem {
    Whole { dispatch: Dispatch, in_order: bool },
    Quantum { task: Arc<Task>, phase: QuantumPhase },
}

struct ConsumerState {
    queue: VecDeque<WorkItem>,
    executing: bool,
    paused: bool,
    running: bool,
    failed: bool,
    executed: u64,
}

impl ConsumerState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            executing: false,
            paused: false,
            running: true,
            failed: false,
            executed: 0,
        }
    }

    fn pending(&self) -> usize {
        self.queue.len() + usize::from(self.executing)
    }
}

struct ConsumerHandle {
    state: Arc<Monitor<ConsumerState>>,
    device_name: String,
}

struct QuantumProgress {
    task: Arc<Task>,
    consumer: usize,
    phase: QuantumPhase,
}

struct PoolShared {
    pools: Monitor<Vec<Arc<TaskPool>>>,
    latch: Mutex<Option<Arc<TaskPool>>>,
    task_pool_counter: AtomicUsize,
    device_counter: AtomicUsize,
    running: AtomicBool,
    // tasks taken from a pool but not yet queued on a consumer
    dispatching: AtomicUsize,
    consumers: RwLock<Vec<ConsumerHandle>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    ring: Mutex<VecDeque<QuantumProgress>>,
    metrics: Arc<Metrics>,
    discipline: PoolDiscipline,
}

/// One producer thread assigning tasks from enqueued pools to one
/// consumer thread per device.
///
/// Each consumer builds its own cruncher once from the shared kernel
/// source. A consumer whose cruncher fails records the error, drops its
/// queued work, and receives no further assignments.
pub struct DevicePool {
    source: String,
    shared: Arc<PoolShared>,
    producer: Option<JoinHandle<()>>,
}

impl DevicePool {
    /// Start the producer for the given discipline and kernel source.
    pub fn new(discipline: PoolDiscipline, source: &str) -> Result<Self> {
        let shared = Arc::new(PoolShared {
            pools: Monitor::new(Vec::new()),
            latch: Mutex::new(None),
            task_pool_counter: AtomicUsize::new(0),
            device_counter: AtomicUsize::new(0),
            running: AtomicBool::new(true),
            dispatching: AtomicUsize::new(0),
            consumers: RwLock::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
            ring: Mutex::new(VecDeque::new()),
            metrics: Arc::new(Metrics::new()),
            discipline,
        });

        let producer_shared = Arc::clone(&shared);
        let producer = thread::Builder::new()
            .name("strata-pool-producer".to_string())
            .spawn(move || producer_loop(producer_shared))
            .map_err(|e| Error::executor(format!("spawn failed: {}", e)))?;

        Ok(Self {
            source: source.to_string(),
            shared,
            producer: Some(producer),
        })
    }

    /// Spawn one consumer per device in `devices`.
    pub fn add_devices(&self, devices: DeviceSet) -> Result<()> {
        for index in 0..devices.len() {
            let device = devices.single(index)?;
            let device_name = device
                .devices()
                .first()
                .map(|d| d.name.clone())
                .unwrap_or_default();
            let state = Arc::new(Monitor::new(ConsumerState::new()));
            let handle = ConsumerHandle {
                state: Arc::clone(&state),
                device_name: device_name.clone(),
            };

            let shared = Arc::clone(&self.shared);
            let source = self.source.clone();
            let thread = thread::Builder::new()
                .name(format!("strata-pool-consumer-{}", device_name))
                .spawn(move || consumer_loop(state, shared, device, source))
                .map_err(|e| Error::executor(format!("spawn failed: {}", e)))?;

            self.shared.consumers.write().push(handle);
            self.shared.threads.lock().push(thread);
        }
        self.shared.pools.pulse_all();
        Ok(())
    }

    /// Enqueue a task pool for consumption.
    pub fn enqueue_task_pool(&self, pool: &Arc<TaskPool>) {
        self.shared.pools.lock().push(Arc::clone(pool));
        self.shared.pools.pulse_all();
    }

    /// Block until every enqueued task has been executed, then dispose
    /// the consumers. The pool object cannot be reused afterwards.
    pub fn finish(&mut self) {
        loop {
            let pools_remaining: usize = self
                .shared
                .pools
                .lock()
                .iter()
                .map(|p| p.remaining())
                .sum();
            let ring_len = self.shared.ring.lock().len();
            let (device_remaining, any_alive) = {
                let consumers = self.shared.consumers.read();
                let mut pending = 0;
                let mut alive = false;
                for c in consumers.iter() {
                    let guard = c.state.lock();
                    if guard.running && !guard.failed {
                        alive = true;
                        pending += guard.pending();
                    }
                }
                (pending, alive)
            };

            let dispatching = self.shared.dispatching.load(Ordering::Acquire);
            if pools_remaining + ring_len + device_remaining + dispatching == 0 {
                break;
            }
            if !any_alive {
                warn!(
                    "device pool finishing with {} tasks stranded and no live consumer",
                    pools_remaining + ring_len + device_remaining
                );
                break;
            }

            let mut guard = self.shared.pools.lock();
            self.shared.pools.wait_for(&mut guard, PRODUCER_IDLE_WAIT);
        }

        self.dispose();
    }

    /// Pause every consumer.
    pub fn pause(&self) {
        for c in self.shared.consumers.read().iter() {
            c.state.lock().paused = true;
            c.state.pulse_all();
        }
    }

    /// Resume every consumer.
    pub fn resume(&self) {
        for c in self.shared.consumers.read().iter() {
            c.state.lock().paused = false;
            c.state.pulse_all();
        }
    }

    /// Undispatched plus in-flight work across pools and devices.
    pub fn remaining_tasks(&self) -> usize {
        let pools: usize = self
            .shared
            .pools
            .lock()
            .iter()
            .map(|p| p.remaining())
            .sum();
        let ring = self.shared.ring.lock().len();
        let devices: usize = self
            .shared
            .consumers
            .read()
            .iter()
            .map(|c| c.state.lock().pending())
            .sum();
        pools + ring + devices + self.shared.dispatching.load(Ordering::Acquire)
    }

    /// Tasks executed per consumer, in device order.
    pub fn device_task_counts(&self) -> Vec<u64> {
        self.shared
            .consumers
            .read()
            .iter()
            .map(|c| c.state.lock().executed)
            .collect()
    }

    /// Names of the devices backing the consumers.
    pub fn device_names(&self) -> Vec<String> {
        self.shared
            .consumers
            .read()
            .iter()
            .map(|c| c.device_name.clone())
            .collect()
    }

    /// Shared metrics collector
    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.shared.metrics
    }

    fn dispose(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.pools.pulse_all();
        for c in self.shared.consumers.read().iter() {
            c.state.lock().running = false;
            c.state.pulse_all();
        }
        if let Some(handle) = self.producer.take() {
            let _ = handle.join();
        }
        let threads: Vec<JoinHandle<()>> = self.shared.threads.lock().drain(..).collect();
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for DevicePool {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePool")
            .field("discipline", &self.shared.discipline)
            .field("devices", &self.shared.consumers.read().len())
            .field("remaining", &self.remaining_tasks())
            .finish()
    }
}

// ---- producer ------------------------------------------------------

fn producer_loop(shared: Arc<PoolShared>) {
    while shared.running.load(Ordering::Acquire) {
        let produced = produce_once(&shared);
        if !produced {
            let mut guard = shared.pools.lock();
            shared.pools.wait_for(&mut guard, PRODUCER_IDLE_WAIT);
        }
    }
}

fn produce_once(shared: &Arc<PoolShared>) -> bool {
    shared.dispatching.fetch_add(1, Ordering::AcqRel);
    let produced = produce_inner(shared);
    shared.dispatching.fetch_sub(1, Ordering::AcqRel);
    shared.pools.pulse_all();
    produced
}

fn produce_inner(shared: &Arc<PoolShared>) -> bool {
    if shared.discipline.work == WorkOrder::RoundRobin {
        return produce_quantum(shared);
    }

    let Some(pool) = select_pool(shared) else {
        return false;
    };

    if shared.discipline.worker == WorkerMode::Packet {
        return produce_packet(shared, &pool);
    }

    let Some(dispatch) = select_task(shared, &pool) else {
        return false;
    };

    let Some(consumer) = route(shared, &dispatch) else {
        error!("no live consumer for task {:?}, dropping", dispatch.task.id());
        return true;
    };

    let in_order = dispatch
        .group
        .as_ref()
        .map(|g| g.in_order())
        .unwrap_or(false);
    enqueue_item(shared, consumer, WorkItem::Whole { dispatch, in_order });
    true
}

fn select_pool(shared: &Arc<PoolShared>) -> Option<Arc<TaskPool>> {
    {
        let mut latch = shared.latch.lock();
        if let Some(pool) = latch.as_ref() {
            if pool.remaining() > 0 {
                return Some(Arc::clone(pool));
            }
            *latch = None;
        }
    }

    let pools: Vec<Arc<TaskPool>> = shared.pools.lock().clone();
    if pools.is_empty() {
        return None;
    }

    let n = pools.len();
    let start = shared.task_pool_counter.load(Ordering::Relaxed);
    for step in 0..n {
        let index = (start + step) % n;
        let pool = &pools[index];
        if pool.remaining() > 0 {
            shared
                .task_pool_counter
                .store(index + 1, Ordering::Relaxed);
            if pool.kind() == PoolKind::Complete {
                *shared.latch.lock() = Some(Arc::clone(pool));
            }
            return Some(Arc::clone(pool));
        }
    }
    None
}

fn select_task(shared: &Arc<PoolShared>, pool: &Arc<TaskPool>) -> Option<Dispatch> {
    match shared.discipline.work {
        WorkOrder::FirstComeFirstServe => pool.next_task(),
        WorkOrder::ShortestJobFirst => pool.take_shortest(),
        WorkOrder::PriorityBased => pool.take_highest_priority(),
        WorkOrder::RoundRobin => unreachable!("quantised mode handled separately"),
    }
}

fn live_consumers(shared: &Arc<PoolShared>) -> Vec<usize> {
    shared
        .consumers
        .read()
        .iter()
        .enumerate()
        .filter(|(_, c)| {
            let guard = c.state.lock();
            guard.running && !guard.failed
        })
        .map(|(i, _)| i)
        .collect()
}

fn route(shared: &Arc<PoolShared>, dispatch: &Dispatch) -> Option<usize> {
    let alive = live_consumers(shared);
    if alive.is_empty() {
        return None;
    }

    if let Some(group) = &dispatch.group {
        if group.requires_same_device() {
            let mut bound = group.bound_device().lock();
            if let Some(index) = *bound {
                if alive.contains(&index) {
                    return Some(index);
                }
            }
            let index = pick_device(shared, &alive);
            *bound = Some(index);
            return Some(index);
        }
    }

    Some(pick_device(shared, &alive))
}

fn pick_device(shared: &Arc<PoolShared>, alive: &[usize]) -> usize {
    match shared.discipline.worker {
        WorkerMode::RoundRobin | WorkerMode::Packet => {
            let turn = shared.device_counter.fetch_add(1, Ordering::Relaxed);
            alive[turn % alive.len()]
        }
        WorkerMode::ComputeAtWill => {
            let consumers = shared.consumers.read();
            alive
                .iter()
                .copied()
                .find(|&i| consumers[i].state.lock().queue.len() < COMPUTE_AT_WILL_WATERMARK)
                .unwrap_or_else(|| {
                    let turn = shared.device_counter.fetch_add(1, Ordering::Relaxed);
                    alive[turn % alive.len()]
                })
        }
    }
}

fn enqueue_item(shared: &Arc<PoolShared>, consumer: usize, item: WorkItem) {
    let consumers = shared.consumers.read();
    if let Some(handle) = consumers.get(consumer) {
        handle.state.lock().queue.push_back(item);
        handle.state.pulse_all();
    }
    shared.pools.pulse_all();
}

fn produce_packet(shared: &Arc<PoolShared>, pool: &Arc<TaskPool>) -> bool {
    let alive = live_consumers(shared);
    if alive.is_empty() {
        return false;
    }

    // One task per device, then a barrier until the batch retires.
    let mut assigned = Vec::new();
    for &index in &alive {
        let Some(dispatch) = select_task_for_packet(shared, pool) else {
            break;
        };
        let consumer = match &dispatch.group {
            Some(group) if group.requires_same_device() => {
                route(shared, &dispatch).unwrap_or(index)
            }
            _ => index,
        };
        let in_order = dispatch
            .group
            .as_ref()
            .map(|g| g.in_order())
            .unwrap_or(false);
        enqueue_item(shared, consumer, WorkItem::Whole { dispatch, in_order });
        assigned.push(consumer);
    }

    if assigned.is_empty() {
        return false;
    }

    // Snapshot the monitors so the consumer list is not locked across
    // the barrier wait.
    let states: Vec<Arc<Monitor<ConsumerState>>> = {
        let consumers = shared.consumers.read();
        assigned
            .iter()
            .filter_map(|&index| consumers.get(index).map(|c| Arc::clone(&c.state)))
            .collect()
    };
    for state in states {
        let mut guard = state.lock();
        while (!guard.queue.is_empty() || guard.executing)
            && guard.running
            && !guard.failed
            && shared.running.load(Ordering::Acquire)
        {
            state.wait_for(&mut guard, CONSUMER_IDLE_WAIT);
        }
    }
    true
}

fn select_task_for_packet(shared: &Arc<PoolShared>, pool: &Arc<TaskPool>) -> Option<Dispatch> {
    match shared.discipline.work {
        WorkOrder::ShortestJobFirst => pool.take_shortest(),
        WorkOrder::PriorityBased => pool.take_highest_priority(),
        _ => pool.next_task(),
    }
}

fn produce_quantum(shared: &Arc<PoolShared>) -> bool {
    // Refill the ring with every task currently available.
    loop {
        let Some(pool) = select_pool(shared) else {
            break;
        };
        let Some(dispatch) = pool.next_task() else {
            break;
        };
        let Some(consumer) = route(shared, &dispatch) else {
            error!("no live consumer for task {:?}, dropping", dispatch.task.id());
            continue;
        };
        shared.ring.lock().push_back(QuantumProgress {
            task: dispatch.task,
            consumer,
            phase: QuantumPhase::Read,
        });
    }

    // Issue one quantum of the task at the front, then rotate.
    let Some(mut progress) = shared.ring.lock().pop_front() else {
        return false;
    };

    let phase = progress.phase;
    enqueue_item(
        shared,
        progress.consumer,
        WorkItem::Quantum {
            task: Arc::clone(&progress.task),
            phase,
        },
    );

    match phase {
        QuantumPhase::Read => {
            progress.phase = QuantumPhase::Compute;
            shared.ring.lock().push_back(progress);
        }
        QuantumPhase::Compute => {
            progress.phase = QuantumPhase::Write;
            shared.ring.lock().push_back(progress);
        }
        QuantumPhase::Write => {}
    }
    true
}

// ---- consumer ------------------------------------------------------

fn consumer_loop(
    state: Arc<Monitor<ConsumerState>>,
    shared: Arc<PoolShared>,
    device: DeviceSet,
    source: String,
) {
    let facade = match CruncherFacade::from_devices(device, &source, false, 16) {
        Ok(facade) => facade,
        Err(e) => {
            error!("consumer cruncher build failed: {}", e);
            let mut guard = state.lock();
            guard.failed = true;
            drop(guard);
            state.pulse_all();
            shared.pools.pulse_all();
            return;
        }
    };

    loop {
        let item = {
            let mut guard = state.lock();
            loop {
                if !guard.running {
                    break None;
                }
                if guard.failed {
                    // Stop executing for this cruncher; drop queued work.
                    let dropped = guard.queue.len();
                    guard.queue.clear();
                    if dropped > 0 {
                        warn!("dropping {} queued items after cruncher failure", dropped);
                    }
                    state.wait_for(&mut guard, CONSUMER_IDLE_WAIT);
                    continue;
                }
                if guard.paused {
                    state.wait_for(&mut guard, CONSUMER_IDLE_WAIT);
                    continue;
                }
                if let Some(item) = guard.queue.pop_front() {
                    guard.executing = true;
                    break Some(item);
                }
                state.wait_for(&mut guard, CONSUMER_IDLE_WAIT);
            }
        };

        let Some(item) = item else {
            break;
        };

        let started = Instant::now();
        let result = execute_item(&facade, &item);

        {
            let mut guard = state.lock();
            guard.executing = false;
            guard.executed += 1;
            if result.is_err() {
                guard.failed = true;
            }
        }

        if let Err(e) = result {
            error!("consumer execution failed: {}", e);
        }
        shared.metrics.record_task(started.elapsed().as_nanos() as u64);
        state.pulse_all();
        shared.pools.pulse_all();
    }

    facade.dispose();
}

fn execute_item(facade: &CruncherFacade, item: &WorkItem) -> Result<()> {
    match item {
        WorkItem::Whole { dispatch, in_order } => {
            if *in_order {
                facade.set_fine_grained_queue_control(true);
            }
            dispatch.task.set_complete(false);
            let result = dispatch.task.compute(facade);
            if result.is_ok() {
                dispatch.task.set_complete(true);
            }
            if *in_order {
                facade.set_fine_grained_queue_control(false);
            }
            result
        }
        WorkItem::Quantum { task, phase } => match phase {
            QuantumPhase::Read => {
                task.set_complete(false);
                facade.set_no_compute_mode(true);
                let result = facade.compute(&task.args().reads_only(), task.spec());
                facade.set_no_compute_mode(false);
                result
            }
            QuantumPhase::Compute => facade.compute(&task.args().flags_cleared(), task.spec()),
            QuantumPhase::Write => {
                facade.set_no_compute_mode(true);
                let result = facade.compute(&task.args().writes_only(), task.spec());
                facade.set_no_compute_mode(false);
                if result.is_ok() {
                    task.set_complete(true);
                }
                result
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discipline_default() {
        let discipline = PoolDiscipline::default();
        assert_eq!(discipline.worker, WorkerMode::RoundRobin);
        assert_eq!(discipline.work, WorkOrder::FirstComeFirstServe);
    }
}
