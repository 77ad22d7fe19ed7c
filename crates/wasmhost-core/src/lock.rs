//! The per-processor instance lock.
//!
//! Guest bytecode of one loaded contract runs under this lock. Dispatch
//! functions that re-enter the chain (`call`, `deploy_contract`, `post`)
//! release it for the duration of the nested operation so the nested call
//! may run the same contract, and take it back when their guard drops.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub struct InstanceLock {
    held: Mutex<bool>,
    available: Condvar,
}

impl InstanceLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is free, then hold it until the guard drops.
    pub fn lock(&self) -> InstanceGuard<'_> {
        self.acquire();
        InstanceGuard { lock: self }
    }

    pub fn is_locked(&self) -> bool {
        *self.held.lock()
    }

    /// Release the lock until the returned guard drops. When the lock is not
    /// held this is a no-op and the guard does nothing.
    pub fn release_scoped(&self) -> ReleasedGuard<'_> {
        let mut held = self.held.lock();
        let was_held = *held;
        if was_held {
            *held = false;
            self.available.notify_one();
        }
        ReleasedGuard {
            lock: self,
            reacquire: was_held,
        }
    }

    fn acquire(&self) {
        let mut held = self.held.lock();
        while *held {
            self.available.wait(&mut held);
        }
        *held = true;
    }

    fn release(&self) {
        let mut held = self.held.lock();
        *held = false;
        self.available.notify_one();
    }
}

#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct InstanceGuard<'a> {
    lock: &'a InstanceLock,
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[must_use = "the lock is re-acquired as soon as the guard is dropped"]
pub struct ReleasedGuard<'a> {
    lock: &'a InstanceLock,
    reacquire: bool,
}

impl Drop for ReleasedGuard<'_> {
    fn drop(&mut self) {
        if self.reacquire {
            self.lock.acquire();
        }
    }
}
