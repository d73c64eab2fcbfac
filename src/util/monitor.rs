//! Monitor: a mutex/condvar pair guarding shared state.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Guarded state with pulse/wait signalling.
#[derive(Debug, Default)]
pub struct Monitor<T> {
    state: Mutex<T>,
    cond: Condvar,
}

impl<T> Monitor<T> {
    /// Wrap `state`
    pub fn new(state: T) -> Self {
        Self {
            state: Mutex::new(state),
            cond: Condvar::new(),
        }
    }

    /// Lock the state
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.state.lock()
    }

    /// Wait on the condition; the guard is re-acquired before returning
    pub fn wait(&self, guard: &mut MutexGuard<'_, T>) {
        self.cond.wait(guard);
    }

    /// Wait with a timeout; true if the wait timed out
    pub fn wait_for(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> bool {
        self.cond.wait_for(guard, timeout).timed_out()
    }

    /// Wake every waiter
    pub fn pulse_all(&self) {
        self.cond.notify_all();
    }

    /// Wake one waiter
    pub fn pulse_one(&self) {
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_pulse_wakes_waiter() {
        let monitor = Arc::new(Monitor::new(false));
        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                let mut guard = monitor.lock();
                while !*guard {
                    monitor.wait(&mut guard);
                }
            })
        };

        thread::sleep(Duration::from_millis(10));
        *monitor.lock() = true;
        monitor.pulse_all();
        waiter.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let monitor = Monitor::new(());
        let mut guard = monitor.lock();
        assert!(monitor.wait_for(&mut guard, Duration::from_millis(5)));
    }
}
