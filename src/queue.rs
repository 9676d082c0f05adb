//! Job queues (C4): three priority FIFOs plus the ready-fibers queue, and
//! the dequeue policy described in §4.4.

use crate::fiber_pool::FiberHandle;
use crate::job::{JobNode, Priority};
use cordyceps::Linked;
use cordyceps::list;
use crossbeam_utils::Backoff;
use spin::Mutex;
use std::mem::offset_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

/// A node linked into a wait group's waiter list, and later (once signalled)
/// into the ready-fibers queue. At most one of those two lists owns it at a
/// time (§3 invariants).
pub(crate) struct FiberWaitEntry {
    links: list::Links<FiberWaitEntry>,
    pub(crate) fiber: FiberHandle,
    /// Set by the *new* side of the switch that parked this fiber, once that
    /// switch has fully completed (§4.2). Dequeue must not hand out an entry
    /// whose switch has not yet completed, or another worker could begin
    /// resuming a fiber while the parking worker is still on its stack.
    switch_completed: AtomicBool,
}

impl FiberWaitEntry {
    pub(crate) fn new(fiber: FiberHandle) -> Box<Self> {
        Box::new(Self { links: list::Links::new(), fiber, switch_completed: AtomicBool::new(false) })
    }

    pub(crate) fn mark_switch_completed(&self) {
        self.switch_completed.store(true, Ordering::Release);
    }
}

// Safety: moved between threads only while linked in a list protected by a
// lock (a wait group's waiter list or the ready-fibers queue).
unsafe impl Send for FiberWaitEntry {}

// Safety: `links` is private and only touched while the node is exclusively
// owned by whichever lock-protected list currently holds it.
unsafe impl Linked<list::Links<FiberWaitEntry>> for FiberWaitEntry {
    type Handle = Box<FiberWaitEntry>;

    fn into_ptr(r: Self::Handle) -> NonNull<Self> {
        NonNull::from(Box::leak(r))
    }

    unsafe fn from_ptr(ptr: NonNull<Self>) -> Self::Handle {
        // Safety: caller guarantees `ptr` came from a prior `into_ptr` call.
        unsafe { Box::from_raw(ptr.as_ptr()) }
    }

    unsafe fn links(ptr: NonNull<Self>) -> NonNull<list::Links<Self>> {
        ptr.map_addr(|addr| {
            let offset = offset_of!(Self, links);
            addr.checked_add(offset).unwrap()
        })
        .cast()
    }
}

/// A spin-locked FIFO of ready jobs at a single priority level.
pub(crate) struct JobQueue {
    list: Mutex<list::List<JobNode>>,
}

impl JobQueue {
    fn new() -> Self {
        Self { list: Mutex::new(list::List::new()) }
    }

    fn push(&self, job: Box<JobNode>) {
        self.list.lock().push_back(job);
    }

    fn is_empty(&self) -> bool {
        self.list.lock().is_empty()
    }

    /// Pop the first job whose affinity allows `worker_index`, skipping
    /// (but preserving the relative order of) any incompatible jobs at the
    /// head (§4.4 "Main-thread affinity").
    fn pop_for_worker(&self, worker_index: u32) -> Option<Box<JobNode>> {
        let mut list = self.list.lock();
        if list.is_empty() {
            return None;
        }

        let mut skipped = Vec::new();
        let mut found = None;
        while let Some(job) = list.pop_front() {
            if job.affinity.allows(worker_index) {
                found = Some(job);
                break;
            }
            skipped.push(job);
        }
        // Restore skipped jobs to the front, in their original order.
        for job in skipped.into_iter().rev() {
            list.push_front(job);
        }
        found
    }
}

/// What a successful dequeue yields to the worker's dispatch loop.
pub(crate) enum Dequeued {
    ResumeFiber(Box<FiberWaitEntry>),
    NewJob(Box<JobNode>),
}

/// Owns the three priority job queues and the ready-fibers queue, and
/// implements the bounded-attempt dequeue policy of §4.4.
pub(crate) struct Queues {
    by_priority: [JobQueue; Priority::COUNT],
    ready_fibers: Mutex<list::List<FiberWaitEntry>>,
}

const DEQUEUE_ATTEMPT_BUDGET: u32 = 8;

impl Queues {
    pub(crate) fn new() -> Self {
        Self {
            by_priority: [JobQueue::new(), JobQueue::new(), JobQueue::new()],
            ready_fibers: Mutex::new(list::List::new()),
        }
    }

    pub(crate) fn push_job(&self, job: Box<JobNode>) {
        self.by_priority[job.priority.index()].push(job);
    }

    pub(crate) fn push_ready_fiber(&self, entry: Box<FiberWaitEntry>) {
        self.ready_fibers.lock().push_back(entry);
    }

    fn try_pop_ready_fiber(&self) -> Option<Box<FiberWaitEntry>> {
        let mut ready = self.ready_fibers.lock();
        let head_is_complete =
            ready.front().is_some_and(|e| e.switch_completed.load(Ordering::Acquire));
        if head_is_complete { ready.pop_front() } else { None }
    }

    /// Attempt to dequeue work for `worker_index`, spin-waiting through up
    /// to [`DEQUEUE_ATTEMPT_BUDGET`] rounds before giving up and letting the
    /// caller yield the OS thread (§4.4 step 5).
    pub(crate) fn dequeue(&self, worker_index: u32) -> Option<Dequeued> {
        let backoff = Backoff::new();

        for _round in 0..DEQUEUE_ATTEMPT_BUDGET {
            for priority in [Priority::High, Priority::Normal, Priority::Low] {
                if let Some(entry) = self.try_pop_ready_fiber() {
                    return Some(Dequeued::ResumeFiber(entry));
                }
                if let Some(job) = self.by_priority[priority.index()].pop_for_worker(worker_index)
                {
                    return Some(Dequeued::NewJob(job));
                }
            }
            backoff.snooze();
        }

        None
    }

    #[cfg(test)]
    pub(crate) fn is_fully_empty(&self) -> bool {
        self.by_priority.iter().all(JobQueue::is_empty) && self.ready_fibers.lock().is_empty()
    }
}
