//! Wait group (C3): the sole synchronisation primitive jobs use to wait for
//! completion of other jobs or externally-signalled events (§4.3).

use crate::queue::FiberWaitEntry;
use crate::scheduler::Shared;
use cordyceps::list;
use spin::Mutex;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

struct Inner {
    /// The scheduler this group's waiters belong to. A wait group is always
    /// scoped to one scheduler: the fiber handles inside its waiter list are
    /// only meaningful against that scheduler's fiber pool (§9 Open
    /// Question: no process-wide scheduler singleton, so this handle is
    /// carried explicitly rather than looked up from thread-local state,
    /// which also keeps `signal` callable from threads the scheduler
    /// doesn't own).
    scheduler: Arc<Shared>,
    counter: AtomicU32,
    /// Guards the handoff between a `signal` that drains the waiter list and
    /// `wait`s that are racing to link themselves into it (§4.3 "Race
    /// between signal and wait").
    waiters: Mutex<list::List<FiberWaitEntry>>,
}

/// A reference-counted counting latch. Jobs park their fiber in
/// [`WaitGroup::wait`] while the counter is non-zero; external producers
/// (asset I/O, pipeline compilation, frame-graph passes) call
/// [`WaitGroup::signal`] from whatever thread finishes the work, including
/// threads the scheduler does not own, since `signal` never suspends.
#[derive(Clone)]
pub struct WaitGroup(Arc<Inner>);

impl WaitGroup {
    /// Creates a wait group bound to `scheduler`, with the given initial
    /// count. Reference count starts at 1 (this handle).
    pub fn new(scheduler: &crate::scheduler::Scheduler, initial_count: u32) -> Self {
        WaitGroup(Arc::new(Inner {
            scheduler: scheduler.shared_handle(),
            counter: AtomicU32::new(initial_count),
            waiters: Mutex::new(list::List::new()),
        }))
    }

    /// Current value of the counter. Mainly useful for assertions and tests;
    /// racy with concurrent `add`/`signal` by construction.
    pub fn count(&self) -> u32 {
        self.0.counter.load(Ordering::Acquire)
    }

    /// Atomically increments the counter. Must not be called once the
    /// counter has reached zero and drained its waiters (§4.3) - doing so is
    /// a programmer error, since there would be nobody left to observe the
    /// new work completing.
    pub fn add(&self, n: u32) {
        let prev = self.0.counter.fetch_add(n, Ordering::AcqRel);
        assert!(
            prev > 0 || n == 0 || self.0.waiters.lock().is_empty(),
            "WaitGroup::add called on a group that already reached zero and woke its waiters"
        );
    }

    /// Atomically decrements the counter by `n`. When the counter transitions
    /// to exactly zero, every parked waiter is moved onto the ready-fibers
    /// queue; workers pick them up from there. Overshoot (`n` larger than
    /// the current counter) is a logic error and panics (§4.3, §7).
    pub fn signal(&self, n: u32) {
        // The lock is held only across "decrement to zero" + "swap the
        // waiter list to empty" (§5 Locking discipline): late arrivals in
        // `wait` take the same lock to re-check the counter before
        // committing to parking.
        let mut waiters = self.0.waiters.lock();
        let prev = self.0.counter.fetch_sub(n, Ordering::AcqRel);
        assert!(prev >= n, "WaitGroup::signal({n}) overshot a counter of {prev}");

        if prev == n {
            let drained = std::mem::take(&mut *waiters);
            drop(waiters);
            for entry in drained {
                self.0.scheduler.queues.push_ready_fiber(entry);
            }
        }
    }

    /// Returns immediately if the counter is already zero (§8 property 6: no
    /// context switch in that case). Otherwise links the calling fiber into
    /// the waiter list and asks the scheduler to switch to the next ready
    /// piece of work on the current worker; returns once this group has
    /// been signalled to zero and this fiber's turn to resume has come up.
    ///
    /// # Panics
    /// If called from outside a job's `execute()` (i.e. not on a worker
    /// fiber) - `wait` is the only suspension point and it requires a fiber
    /// to suspend.
    pub fn wait(&self) {
        if self.0.counter.load(Ordering::Acquire) == 0 {
            return;
        }

        let worker = crate::worker::current();
        let entry = FiberWaitEntry::new(worker.current_fiber());
        // Leak a raw pointer to the entry *before* handing ownership to the
        // waiter list: the next fiber that lands on this CPU needs it to
        // mark the switch complete (§4.2), even though by then the entry
        // may have already been moved onto the ready-fibers queue by a
        // racing `signal`.
        let entry_ptr = NonNull::from(&*entry);

        let mut waiters = self.0.waiters.lock();
        if self.0.counter.load(Ordering::Acquire) == 0 {
            // Signalled to zero in the window between our fast-path check
            // and taking the lock; nothing to park for.
            return;
        }
        waiters.push_back(entry);
        drop(waiters);

        // Switches away; resumes here once some future `signal` drains us
        // off the waiter list and a worker dispatches us again.
        worker.park_current_fiber(entry_ptr);
    }
}

impl fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitGroup").field("count", &self.count()).finish()
    }
}
