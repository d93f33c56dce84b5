//! Counting semaphore bounding the frames in flight.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub struct FrameSemaphore {
    count: Mutex<usize>,
    cond: Condvar,
    capacity: usize,
}

impl FrameSemaphore {
    /// Semaphore with all `capacity` permits available.
    pub fn new(capacity: usize) -> Self {
        Self {
            count: Mutex::new(capacity),
            cond: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *self.count.lock()
    }

    /// Block until a permit is available and take it.
    pub fn acquire(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take a permit, waiting at most `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count == 0 {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// Return a permit.
    pub fn signal(&self) {
        let mut count = self.count.lock();
        if *count >= self.capacity {
            tracing::error!(capacity = self.capacity, "frame semaphore signalled past capacity");
            return;
        }
        *count += 1;
        self.cond.notify_all();
    }

    /// Wait at most `timeout` for every permit to be returned.
    pub fn wait_all_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count < self.capacity {
            if self.cond.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        *count == self.capacity
    }

    /// [`try_acquire_for`](Self::try_acquire_for) returning a guard.
    pub fn permit_for(self: &Arc<Self>, timeout: Duration) -> Option<FramePermit> {
        self.try_acquire_for(timeout).then(|| FramePermit {
            semaphore: Arc::clone(self),
        })
    }
}

/// An acquired permit; signals the semaphore when dropped.
#[derive(Debug)]
pub struct FramePermit {
    semaphore: Arc<FrameSemaphore>,
}

impl Drop for FramePermit {
    fn drop(&mut self) {
        self.semaphore.signal();
    }
}
