//! Job scheduler façade (C6): the public entry point that owns the fiber
//! pool and job queues and drives the worker threads (§4.6).

use crate::fiber_pool::FiberPool;
use crate::job::{Affinity, Job, JobNode, Priority};
use crate::queue::Queues;
use crate::semaphore::Semaphore;
use crate::worker;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

/// Default number of normal-stack fibers kept in the pool (§9 Design
/// Notes: "128 fibers of 64 KiB each").
const DEFAULT_NORMAL_FIBERS: usize = 128;
/// Default number of large-stack fibers (§9: "8 large-stack fibers of
/// 512 KiB each").
const DEFAULT_LARGE_FIBERS: usize = 8;

/// State shared between the [`Scheduler`] handle, every worker OS thread,
/// and every [`WaitGroup`](crate::wait_group::WaitGroup) created against
/// this scheduler. Kept behind an `Arc` rather than a process-wide static so
/// that tests may construct and tear down multiple independent schedulers
/// in the same process (§9 Open Questions).
pub(crate) struct Shared {
    pub(crate) queues: Queues,
    pub(crate) fiber_pool: FiberPool,
    pub(crate) worker_count: u32,
    pub(crate) should_exit: AtomicBool,
    pub(crate) startup_gate: Semaphore,
    /// One-shot latch: the first worker to reach its dispatch loop (always
    /// worker 0, since every other worker blocks on `startup_gate` until
    /// released) releases the rest (§4.5 "the first job picked up on any
    /// worker releases the remaining workers").
    pub(crate) startup_gate_released: AtomicBool,
}

/// Owns the fiber pool and job queues and coordinates the worker thread
/// pool. Construct one per application; [`Scheduler::start`] blocks the
/// calling (host application main) thread until [`Scheduler::stop`] is
/// called from a job or another thread.
pub struct Scheduler(Arc<Shared>);

impl Scheduler {
    /// Creates a scheduler with `worker_count` total workers (including the
    /// main thread, worker 0) and the default fiber pool sizing.
    pub fn new(worker_count: NonZeroU32) -> Scheduler {
        Self::with_fiber_pool(worker_count, DEFAULT_NORMAL_FIBERS, DEFAULT_LARGE_FIBERS)
    }

    /// Creates a scheduler with an explicit fiber pool size. Exposed for
    /// tests and engines whose job graph is known to need more concurrently
    /// in-flight fibers than the default.
    pub fn with_fiber_pool(
        worker_count: NonZeroU32,
        normal_fibers: usize,
        large_fibers: usize,
    ) -> Scheduler {
        let worker_count = worker_count.get();
        Scheduler(Arc::new(Shared {
            queues: Queues::new(),
            fiber_pool: FiberPool::new(normal_fibers, large_fibers),
            worker_count,
            should_exit: AtomicBool::new(false),
            startup_gate: Semaphore::new(0),
            startup_gate_released: AtomicBool::new(false),
        }))
    }

    /// Convenience constructor matching the common "one worker per hardware
    /// thread, minus the caller's own" sizing; falls back to a single
    /// worker if the platform cannot report core count.
    pub fn with_default_workers() -> Scheduler {
        let available = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
        let worker_count = available.saturating_sub(1).max(1) as u32;
        Scheduler::new(NonZeroU32::new(worker_count).unwrap())
    }

    /// Enqueues `job` with the given priority and no affinity restriction
    /// and no completion tracking - the simplest form of dispatch (§4.6).
    /// Use [`JobExt::schedule`](crate::job::JobExt::schedule) for affinity
    /// or a completion [`WaitGroup`](crate::wait_group::WaitGroup).
    pub fn add_job(&self, job: impl Job + 'static, priority: Priority) {
        let node = JobNode::new(Box::new(job), priority, Affinity::ANY, None);
        self.enqueue(node);
    }

    pub(crate) fn enqueue(&self, node: Box<JobNode>) {
        self.0.queues.push_job(node);
    }

    pub(crate) fn shared_handle(&self) -> Arc<Shared> {
        Arc::clone(&self.0)
    }

    /// Total number of workers, including the main thread.
    pub fn worker_count(&self) -> u32 {
        self.0.worker_count
    }

    /// Index of the worker the calling job is presently executing on.
    ///
    /// # Panics
    /// If called from a thread that is not one of this scheduler's workers.
    pub fn current_worker_index() -> u32 {
        worker::current().index()
    }

    /// Spawns the remaining worker threads, rents the main thread's own
    /// initial fiber, and enters its dispatch loop. Must be called on the
    /// thread the host application treats as "main" (the only thread
    /// permitted to run jobs with [`Affinity::MAIN_THREAD`]); does not
    /// return until a job (or another thread) calls [`Scheduler::stop`]
    /// (§4.5, §4.6).
    pub fn start(&self) {
        let mut handles = Vec::with_capacity(self.0.worker_count as usize - 1);
        for index in 1..self.0.worker_count {
            let shared = Arc::clone(&self.0);
            handles.push(
                thread::Builder::new()
                    .name(format!("fiberjobs-worker-{index}"))
                    .spawn(move || worker::run_worker(shared, index))
                    .expect("failed to spawn worker thread"),
            );
        }

        worker::run_worker(Arc::clone(&self.0), 0);

        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Requests shutdown. Each worker observes this the next time its
    /// dispatch loop reaches the top (§4.5 step 1): in-flight jobs run to
    /// completion, but no further job or parked fiber is dispatched once
    /// seen. Callers are responsible for ensuring no `add_job`/`schedule`
    /// races with `stop` (§7).
    pub fn stop(&self) {
        self.0.should_exit.store(true, Ordering::Release);
    }
}
