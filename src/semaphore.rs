//! A minimal OS counting semaphore, used only for the worker startup
//! barrier (§6 "Interfaces the core consumes").

use std::sync::{Condvar, Mutex};

pub(crate) struct Semaphore {
    count: Mutex<u32>,
    condvar: Condvar,
}

impl Semaphore {
    pub(crate) fn new(initial: u32) -> Self {
        Self { count: Mutex::new(initial), condvar: Condvar::new() }
    }

    /// Blocks the calling OS thread until a permit is available.
    pub(crate) fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.condvar.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Releases `n` permits, waking up to `n` waiters.
    pub(crate) fn release(&self, n: u32) {
        if n == 0 {
            return;
        }
        *self.count.lock().unwrap() += n;
        self.condvar.notify_all();
    }
}
