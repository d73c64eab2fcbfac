//! The work-stealing pool.

use super::job::Job;
use crate::error::{Error, Result};
use crossbeam_deque::{Injector, Steal, Stealer, Worker as WorkerQueue};
use log::error;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// An idle worker yields this many rounds before parking.
const IDLE_YIELDS: u32 = 16;
// Parked workers are woken by `submit`; the timeout bounds how long a
// missed unpark can delay shutdown.
const PARK_INTERVAL: Duration = Duration::from_micros(100);

/// Fixed-size work-stealing thread pool.
///
/// Jobs land in a global injector; idle workers steal batches into their
/// local FIFO queues and from each other in shuffled order.
pub struct WorkPool {
    workers: Vec<WorkerHandle>,
    injector: Arc<Injector<Job>>,
    shutdown: Arc<AtomicBool>,
    next_wake: AtomicUsize,
    num_threads: usize,
}

struct WorkerHandle {
    thread: Option<JoinHandle<()>>,
    unparker: thread::Thread,
}

struct Worker {
    id: usize,
    local: WorkerQueue<Job>,
}

impl WorkPool {
    /// Spawn a pool with `num_threads` workers.
    pub fn new(num_threads: usize) -> Result<Self> {
        if num_threads == 0 {
            return Err(Error::executor("need at least 1 thread"));
        }

        let injector = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(num_threads);
        let mut stealers = Vec::with_capacity(num_threads);

        for id in 0..num_threads {
            let local = WorkerQueue::new_fifo();
            stealers.push(local.stealer());
            workers.push(Worker { id, local });
        }

        let mut handles = Vec::with_capacity(num_threads);

        for worker in workers {
            let id = worker.id;
            let stealers_clone = stealers.clone();
            let injector_clone = injector.clone();
            let shutdown_clone = shutdown.clone();

            let thread = thread::Builder::new()
                .name(format!("strata-worker-{}", id))
                .spawn(move || {
                    worker.run(stealers_clone, injector_clone, shutdown_clone);
                })
                .map_err(|e| Error::executor(format!("spawn failed: {}", e)))?;

            let unparker = thread.thread().clone();

            handles.push(WorkerHandle {
                thread: Some(thread),
                unparker,
            });
        }

        Ok(Self {
            workers: handles,
            injector,
            shutdown,
            next_wake: AtomicUsize::new(0),
            num_threads,
        })
    }

    /// Pool sized for a pipeline's parallel phases: `min(items, cores)`.
    pub fn for_items(items: usize) -> Result<Self> {
        Self::new(items.max(1).min(num_cpus::get().max(1)))
    }

    /// Submit a job.
    pub fn submit(&self, job: Job) {
        self.injector.push(job);

        let next = self.next_wake.fetch_add(1, Ordering::Relaxed) % self.num_threads;
        if let Some(worker) = self.workers.get(next) {
            worker.unparker.unpark();
        }
    }

    /// Submit a closure.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Job::new(f));
    }

    /// Number of worker threads
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Stop the workers and join them.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Release);

        for worker in &self.workers {
            worker.unparker.unpark();
        }

        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkPool")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl Worker {
    fn run(
        &self,
        stealers: Vec<Stealer<Job>>,
        injector: Arc<Injector<Job>>,
        shutdown: Arc<AtomicBool>,
    ) {
        let mut idle_rounds = 0u32;

        loop {
            if shutdown.load(Ordering::Acquire) {
                break;
            }

            if let Some(job) = self.find_job(&stealers, &injector) {
                idle_rounds = 0;
                self.execute_job(job);
            } else if idle_rounds < IDLE_YIELDS {
                idle_rounds += 1;
                thread::yield_now();
            } else {
                thread::park_timeout(PARK_INTERVAL);
            }
        }
    }

    // local queue, then injector batches, then other workers
    fn find_job(&self, stealers: &[Stealer<Job>], injector: &Injector<Job>) -> Option<Job> {
        if let Some(job) = self.local.pop() {
            return Some(job);
        }

        loop {
            match injector.steal_batch_and_pop(&self.local) {
                Steal::Success(job) => return Some(job),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        self.steal_from_peers(stealers)
    }

    fn steal_from_peers(&self, stealers: &[Stealer<Job>]) -> Option<Job> {
        use rand::seq::SliceRandom;
        use rand::thread_rng;

        if stealers.len() <= 1 {
            return None;
        }

        let mut indices: Vec<usize> = (0..stealers.len()).collect();
        indices.shuffle(&mut thread_rng());

        for &idx in &indices {
            if idx == self.id {
                continue;
            }
            loop {
                match stealers[idx].steal_batch_and_pop(&self.local) {
                    Steal::Success(job) => return Some(job),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn execute_job(&self, job: Job) {
        let id = job.id;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            job.execute();
        }));
        if result.is_err() {
            error!("job {:?} panicked", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_executes_submitted_jobs() {
        let pool = WorkPool::new(4).unwrap();
        let counter = Arc::new(AtomicU64::new(0));

        for _ in 0..100 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        while counter.load(Ordering::Relaxed) < 100 {
            thread::yield_now();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(WorkPool::new(0).is_err());
    }

    #[test]
    fn test_for_items_bounds() {
        let pool = WorkPool::for_items(2).unwrap();
        assert!(pool.num_threads() <= 2);
        assert!(pool.num_threads() >= 1);
    }
}
