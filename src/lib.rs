//! A fiber-based, work-stealing-flavored job system: a small pool of OS
//! worker threads each hosting one of a fixed pool of stackful fibers,
//! dispatching priority-ordered jobs and cooperatively parking on
//! [`WaitGroup`] rather than blocking an OS thread.
//!
//! # Overview
//!
//! [`Scheduler`] owns the fiber pool and job queues and drives the worker
//! threads. Application code implements [`Job`] and dispatches it with
//! [`Scheduler::add_job`] or [`JobExt::schedule`]; a job runs to completion
//! or to a call to [`WaitGroup::wait`], which suspends the calling fiber
//! without blocking the OS thread underneath it, freeing that thread to run
//! other jobs in the meantime.
//!
//! There is no preemption, cancellation, or job-level unwinding: a job
//! either runs to completion, or panics, which is caught at the dispatch
//! boundary and logged rather than propagated.

mod arch;
mod fiber_pool;
mod job;
mod queue;
mod scheduler;
mod scratch;
mod semaphore;
mod stack;
mod wait_group;
mod worker;

pub use job::{Affinity, Job, JobExt, Priority};
pub use scheduler::Scheduler;
pub use scratch::Scratch;
pub use wait_group::WaitGroup;
pub use worker::current_scratch;
