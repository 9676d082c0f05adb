//! Worker thread (C5): the dispatch loop every fiber runs, and the OS
//! thread bookkeeping (startup barrier, native-stack handoff, shutdown)
//! around it (§4.2, §4.5).

use crate::fiber_pool::{FiberHandle, FiberPool};
use crate::job::JobNode;
use crate::queue::{Dequeued, FiberWaitEntry};
use crate::scheduler::Shared;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

/// Per-OS-thread worker state. One of these lives on each worker's native
/// stack for the thread's entire lifetime; fibers access it through the
/// thread-local below rather than having it threaded through every call.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    index: u32,
    /// The fiber presently running on this OS thread.
    current_fiber: Cell<FiberHandle>,
    /// Saved stack pointer of this thread's *native* stack (the one the OS
    /// gave it, as opposed to any pool fiber), set by the one
    /// `switch_from_native` call made in [`run_worker`] and read back when
    /// shutting down.
    native_sp: Cell<usize>,
    /// A job handed to the next fiber `run_dispatch_loop` starts on, set by
    /// [`park_current_fiber`] when it must rent a fresh fiber to carry on a
    /// new job while the parking fiber stays suspended (§4.3).
    pending_job: Cell<Option<Box<JobNode>>>,
}

thread_local! {
    static CURRENT: Cell<Option<NonNull<Worker>>> = const { Cell::new(None) };
}

/// # Panics
/// If called from a thread that is not presently running as a scheduler
/// worker.
pub(crate) fn current() -> &'static Worker {
    CURRENT.with(|cell| {
        let ptr = cell
            .get()
            .expect("fiberjobs: this operation requires running on a scheduler worker fiber");
        // Safety: set by `run_worker` for the remaining lifetime of this OS
        // thread, and `Worker` is never moved or dropped before the thread
        // exits.
        unsafe { &*ptr.as_ptr() }
    })
}

/// The calling job's fiber-scoped bump allocator (§4.8).
///
/// # Panics
/// If called from a thread that is not presently running as a scheduler
/// worker.
pub fn current_scratch() -> crate::scratch::Scratch<'static> {
    let worker = current();
    crate::scratch::Scratch::new(worker.shared.fiber_pool.scratch(worker.current_fiber.get()))
}

impl Worker {
    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn current_fiber(&self) -> FiberHandle {
        self.current_fiber.get()
    }

    /// Links the calling fiber's wait entry into the ready path and switches
    /// to the next piece of available work, returning once this fiber is
    /// itself resumed again (§4.3 `WaitGroup::wait`).
    pub(crate) fn park_current_fiber(&self, entry: NonNull<FiberWaitEntry>) {
        switch_to_next_work(self, SwitchReason::ParkSelf(entry));
    }
}

/// What the previous occupant of a fiber slot, or the native OS thread
/// stack, needs done with it once the switch that vacated it has landed
/// (§4.2). Packed into the `data` word every `swap_context` call carries.
#[derive(Clone, Copy)]
enum SwitchReason {
    /// Nothing to do: the very first switch into a worker's initial fiber,
    /// or the cleanup-free half of a park/resume pair's `None` case.
    None,
    /// The fiber we switched away from linked itself into a wait group's
    /// waiter list (or has already been moved to the ready-fibers queue by
    /// a racing `signal`); mark its switch complete.
    ParkSelf(NonNull<FiberWaitEntry>),
    /// The fiber we switched away from is done being useful as a standalone
    /// call stack and should be returned to the free list.
    ReturnSelf(FiberHandle, bool),
}

const TAG_MASK: u64 = 0b11;
const TAG_NONE: u64 = 0;
const TAG_PARK: u64 = 1;
const TAG_RETURN: u64 = 2;

impl SwitchReason {
    fn encode(self) -> u64 {
        match self {
            SwitchReason::None => TAG_NONE,
            SwitchReason::ParkSelf(ptr) => {
                let addr = ptr.as_ptr() as u64;
                debug_assert_eq!(addr & TAG_MASK, 0, "FiberWaitEntry is under-aligned for tagging");
                addr | TAG_PARK
            }
            SwitchReason::ReturnSelf(handle, large) => {
                ((handle.0 as u64) << 8) | ((large as u64) << 2) | TAG_RETURN
            }
        }
    }

    /// # Safety
    /// `data` must have been produced by [`Self::encode`]; if the decoded
    /// variant is `ParkSelf`, the pointee must still be live (true so long
    /// as nothing frees a linked `FiberWaitEntry`, which nothing in this
    /// crate does before it is unlinked).
    unsafe fn decode(data: u64) -> Self {
        match data & TAG_MASK {
            TAG_NONE => SwitchReason::None,
            TAG_PARK => {
                let addr = (data & !TAG_MASK) as *mut FiberWaitEntry;
                // Safety: caller's contract.
                SwitchReason::ParkSelf(unsafe { NonNull::new_unchecked(addr) })
            }
            TAG_RETURN => {
                let large = (data >> 2) & 1 != 0;
                let handle = FiberHandle((data >> 8) as u32);
                SwitchReason::ReturnSelf(handle, large)
            }
            _ => unreachable!("only 2 tag bits are ever written"),
        }
    }

    /// The cleanup step run immediately after every switch lands, acting on
    /// whatever the fiber we just switched away from needed done (§4.2).
    fn cleanup(self, pool: &FiberPool) {
        match self {
            SwitchReason::None => {}
            SwitchReason::ParkSelf(ptr) => {
                // Safety: the entry is live, either still linked in a wait
                // group's waiter list or already moved to the ready-fibers
                // queue by a racing `signal`; either way this is the only
                // touch we make, and it's just an atomic store.
                unsafe { ptr.as_ref() }.mark_switch_completed();
            }
            SwitchReason::ReturnSelf(handle, large) => pool.recycle(handle, large),
        }
    }
}

/// Switches from `worker`'s current fiber to `target`, updating
/// `current_fiber` and running the cleanup step for whatever switch brings
/// control back. Every fiber-to-fiber switch in this module goes through
/// here so cleanup is never skipped (§4.2).
fn switch_and_land(worker: &Worker, target: FiberHandle, reason: SwitchReason) {
    let current = worker.current_fiber.get();
    worker.current_fiber.set(target);
    // Safety: `current` is the fiber this OS thread is presently executing,
    // and `target` was just dequeued or rented, so it is checked out to
    // nobody else.
    let ret = unsafe { worker.shared.fiber_pool.switch(current, target, reason.encode()) };
    // Safety: `ret` was produced by `SwitchReason::encode` on whichever
    // switch resumed us.
    unsafe { SwitchReason::decode(ret) }.cleanup(&worker.shared.fiber_pool);
}

/// Finds the next piece of work for this worker and hands control to it,
/// tagging the fiber we're leaving with `reason`. Used both by the
/// dispatch loop's "resume a ready fiber" step and by `wait`'s parking path;
/// the two differ only in what should happen to the fiber being left behind.
fn switch_to_next_work(worker: &Worker, reason: SwitchReason) {
    loop {
        match worker.shared.queues.dequeue(worker.index) {
            Some(Dequeued::ResumeFiber(entry)) => {
                let target = entry.fiber;
                drop(entry);
                switch_and_land(worker, target, reason);
                return;
            }
            Some(Dequeued::NewJob(job)) => {
                let large_stack = job.wants_large_stack;
                worker.pending_job.set(Some(job));
                let target = worker.shared.fiber_pool.rent(large_stack);
                switch_and_land(worker, target, reason);
                return;
            }
            None => thread::yield_now(),
        }
    }
}

/// Releases the non-main workers exactly once, the first time any fiber
/// reaches the top of the dispatch loop - in practice always worker 0's
/// initial fiber, since every other worker blocks on `startup_gate` until
/// this fires (§4.5 startup barrier).
fn release_startup_gate_once(worker: &Worker) {
    if worker.shared.startup_gate_released.swap(true, Ordering::AcqRel) {
        return;
    }
    if worker.shared.worker_count > 1 {
        worker.shared.startup_gate.release(worker.shared.worker_count - 1);
    }
}

fn run_job(worker: &Worker, job: &mut JobNode) {
    // Jobs have no cancellation or preemption (§1 Non-goals); a panicking
    // job must not unwind across the hand-rolled switch in `swap_context`,
    // so it is caught here instead.
    let result = panic::catch_unwind(AssertUnwindSafe(|| job.execute()));
    if let Err(payload) = result {
        tracing::error!(worker = worker.index, "job panicked; continuing dispatch loop");
        drop(payload);
    }
    if let Some(completion) = job.completion.take() {
        completion.signal(1);
    }
}

/// Entry point every pool fiber starts at, reached through
/// `fiber_pool::fiber_entry` (§4.2 "the common entry point"). Runs the
/// cleanup step for the switch that created this fiber, then loops:
/// checking for shutdown, dequeuing, and either running a new job inline or
/// switching to resume a ready fiber.
pub(crate) fn run_dispatch_loop(incoming: u64) -> ! {
    let worker = current();

    // Safety: `incoming` was encoded by whatever switch brought us here -
    // either `switch_and_land` (a job-handoff fiber) or the native startup
    // handoff in `run_worker` (always `SwitchReason::None`).
    unsafe { SwitchReason::decode(incoming) }.cleanup(&worker.shared.fiber_pool);

    if let Some(mut job) = worker.pending_job.take() {
        run_job(worker, &mut job);
    }

    release_startup_gate_once(worker);

    loop {
        if worker.shared.should_exit.load(Ordering::Acquire) {
            exit_current_fiber(worker);
        }

        match worker.shared.queues.dequeue(worker.index) {
            Some(Dequeued::ResumeFiber(entry)) => {
                let current = worker.current_fiber.get();
                let large = worker.shared.fiber_pool.is_large(current);
                let target = entry.fiber;
                drop(entry);
                switch_and_land(worker, target, SwitchReason::ReturnSelf(current, large));
                // Not reached: `current` was just retired to the free
                // list, and the pool never resumes a retired fiber's old
                // call stack, only reinitializes it for a new tenant.
            }
            Some(Dequeued::NewJob(mut job)) => {
                run_job(worker, &mut job);
            }
            None => thread::yield_now(),
        }
    }
}

/// Switches from the current fiber back to this OS thread's native stack,
/// retiring the fiber to the free list. Called once should_exit is observed
/// (§4.5); never returns.
fn exit_current_fiber(worker: &Worker) -> ! {
    let handle = worker.current_fiber.get();
    let large = worker.shared.fiber_pool.is_large(handle);
    // Safety: `native_sp` was saved by the one `switch_from_native` call in
    // `run_worker` before this thread ever switched into a fiber.
    unsafe {
        worker.shared.fiber_pool.switch_to_native(
            handle,
            worker.native_sp.get(),
            SwitchReason::ReturnSelf(handle, large).encode(),
        );
    }
    unreachable!("native exit context never resumes a retired worker fiber");
}

/// Runs one worker: blocks on the startup barrier (all but worker 0),
/// rents an initial fiber, and switches into the dispatch loop. Does not
/// return until that worker observes shutdown.
pub(crate) fn run_worker(shared: Arc<Shared>, index: u32) {
    if index != 0 {
        shared.startup_gate.acquire();
    }

    let worker = Worker {
        shared: Arc::clone(&shared),
        index,
        current_fiber: Cell::new(FiberHandle(0)),
        native_sp: Cell::new(0),
        pending_job: Cell::new(None),
    };

    CURRENT.with(|cell| cell.set(Some(NonNull::from(&worker))));

    let handle = shared.fiber_pool.rent(false);
    worker.current_fiber.set(handle);

    // Safety: `worker.native_sp` is a local on this function's stack frame,
    // which does not return until this switch comes back; `handle` was just
    // rented and is checked out to nobody else.
    let ret = unsafe {
        shared.fiber_pool.switch_from_native(&worker.native_sp, handle, SwitchReason::None.encode())
    };
    // Safety: `ret` was encoded by `exit_current_fiber`, the only place that
    // ever switches back to a native context.
    unsafe { SwitchReason::decode(ret) }.cleanup(&shared.fiber_pool);

    CURRENT.with(|cell| cell.set(None));
}
