//! Scoped parallel-for on top of the work pool.

use super::job::Job;
use super::pool::WorkPool;
use crate::util::Monitor;
use std::marker::PhantomData;
use std::sync::Arc;

/// Joins every closure spawned through it before the scope ends.
///
/// Outstanding work is counted on a shared [`Monitor`] latch. Each job
/// carries a completion guard that decrements the latch when it retires,
/// unwinding included, so a panicking job cannot strand the join.
/// Dropping the scope blocks until the latch reaches zero.
pub struct Scope<'pool, 'scope> {
    pool: &'pool WorkPool,
    latch: Arc<Monitor<usize>>,
    // invariant over 'scope: spawned borrows must not be shortened
    _scope: PhantomData<&'scope mut &'scope ()>,
}

struct CompletionGuard(Arc<Monitor<usize>>);

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        let mut outstanding = self.0.lock();
        *outstanding -= 1;
        if *outstanding == 0 {
            drop(outstanding);
            self.0.pulse_all();
        }
    }
}

impl<'pool, 'scope> Scope<'pool, 'scope> {
    fn new(pool: &'pool WorkPool) -> Self {
        Self {
            pool,
            latch: Arc::new(Monitor::new(0)),
            _scope: PhantomData,
        }
    }

    /// Spawn a closure that may borrow from the enclosing scope.
    pub fn spawn<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'scope,
    {
        *self.latch.lock() += 1;
        let guard = CompletionGuard(Arc::clone(&self.latch));

        let wrapped: Box<dyn FnOnce() + Send + 'scope> = Box::new(move || {
            let _done = guard;
            f();
        });
        // SAFETY: the pool queues only 'static jobs, so the 'scope bound
        // is erased here. Scope::drop blocks until the latch returns to
        // zero, and the completion guard runs even when `f` unwinds, so
        // the job cannot touch its captured borrows after they expire.
        let erased: Box<dyn FnOnce() + Send + 'static> = unsafe {
            std::mem::transmute::<
                Box<dyn FnOnce() + Send + 'scope>,
                Box<dyn FnOnce() + Send + 'static>,
            >(wrapped)
        };

        self.pool.submit(Job::new(erased));
    }
}

impl std::fmt::Debug for Scope<'_, '_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scope")
            .field("outstanding", &*self.latch.lock())
            .finish()
    }
}

impl Drop for Scope<'_, '_> {
    fn drop(&mut self) {
        let mut outstanding = self.latch.lock();
        while *outstanding > 0 {
            self.latch.wait(&mut outstanding);
        }
    }
}

/// Run `f` with a scope; returns after every spawned closure finished.
pub fn scope<'pool, 'scope, F, R>(pool: &'pool WorkPool, f: F) -> R
where
    F: FnOnce(&mut Scope<'pool, 'scope>) -> R,
{
    let mut scope = Scope::new(pool);
    let result = f(&mut scope);
    drop(scope);
    result
}
