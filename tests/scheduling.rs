//! End-to-end scheduler behavior, run against the public API only.

use fiberjobs::{Affinity, Job, JobExt, Priority, Scheduler};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Spawns a scheduler on a background thread and returns it alongside the
/// join handle, already past its startup barrier.
fn spin_up(worker_count: u32) -> (Arc<Scheduler>, std::thread::JoinHandle<()>) {
    let scheduler = Arc::new(Scheduler::new(NonZeroU32::new(worker_count).unwrap()));
    let handle = {
        let scheduler = Arc::clone(&scheduler);
        std::thread::spawn(move || scheduler.start())
    };
    // Workers run their startup barrier release synchronously relative to
    // `start()`, but give the OS thread a moment to actually get scheduled.
    std::thread::sleep(Duration::from_millis(20));
    (scheduler, handle)
}

fn wait_for<F: Fn() -> bool>(timeout: Duration, cond: F) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition did not become true in time");
        std::thread::yield_now();
    }
}

struct FnJob<F>(F);

impl<F: FnMut() + Send> Job for FnJob<F> {
    fn execute(&mut self) {
        (self.0)();
    }
}

fn job(f: impl FnMut() + Send + 'static) -> FnJob<impl FnMut() + Send> {
    FnJob(f)
}

#[test]
fn wait_before_signal_resumes_after_signalling_job_runs() {
    let (scheduler, handle) = spin_up(4);

    let wg = fiberjobs::WaitGroup::new(&scheduler, 1);
    let a_ran = Arc::new(AtomicU32::new(0));
    let b_ran = Arc::new(AtomicU32::new(0));
    let a_resumed_after_b = Arc::new(AtomicU32::new(0));

    let done = fiberjobs::WaitGroup::new(&scheduler, 0);

    {
        let wg = wg.clone();
        let a_ran = Arc::clone(&a_ran);
        let b_ran = Arc::clone(&b_ran);
        let a_resumed_after_b = Arc::clone(&a_resumed_after_b);
        job(move || {
            a_ran.fetch_add(1, Ordering::SeqCst);
            wg.wait();
            if b_ran.load(Ordering::SeqCst) == 1 {
                a_resumed_after_b.store(1, Ordering::SeqCst);
            }
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::ANY);
    }
    {
        let wg = wg.clone();
        let b_ran = Arc::clone(&b_ran);
        job(move || {
            // Give A a chance to reach `wait()` first; not required for
            // correctness (scenario C covers the other ordering) but makes
            // this test actually exercise the parked path most of the time.
            std::thread::sleep(Duration::from_millis(5));
            b_ran.store(1, Ordering::SeqCst);
            wg.signal(1);
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::ANY);
    }

    wait_for(Duration::from_secs(5), || done.count() == 0);

    assert_eq!(a_ran.load(Ordering::SeqCst), 1);
    assert_eq!(b_ran.load(Ordering::SeqCst), 1);
    assert_eq!(a_resumed_after_b.load(Ordering::SeqCst), 1);

    scheduler.stop();
    handle.join().unwrap();
}

#[test]
fn signal_before_wait_returns_without_suspending() {
    let (scheduler, handle) = spin_up(4);

    let wg = fiberjobs::WaitGroup::new(&scheduler, 1);
    wg.signal(1);

    let done = fiberjobs::WaitGroup::new(&scheduler, 0);
    let observed_immediate = Arc::new(AtomicU32::new(0));
    {
        let wg = wg.clone();
        let observed_immediate = Arc::clone(&observed_immediate);
        job(move || {
            // The group is already at zero: `wait` must return without
            // ever parking this fiber.
            wg.wait();
            observed_immediate.store(1, Ordering::SeqCst);
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::ANY);
    }

    wait_for(Duration::from_secs(5), || done.count() == 0);
    assert_eq!(observed_immediate.load(Ordering::SeqCst), 1);

    scheduler.stop();
    handle.join().unwrap();
}

#[test]
fn many_waiters_all_resume_exactly_once() {
    const WAITERS: usize = 64;
    let (scheduler, handle) = spin_up(8);

    let wg = fiberjobs::WaitGroup::new(&scheduler, 1);
    let resumed = Arc::new(AtomicUsize::new(0));
    let done = fiberjobs::WaitGroup::new(&scheduler, 0);

    for _ in 0..WAITERS {
        let wg = wg.clone();
        let resumed = Arc::clone(&resumed);
        job(move || {
            wg.wait();
            resumed.fetch_add(1, Ordering::SeqCst);
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::ANY);
    }

    // The 65th job: signals once all waiters have had a chance to park.
    {
        let wg = wg.clone();
        job(move || {
            std::thread::sleep(Duration::from_millis(20));
            wg.signal(1);
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::ANY);
    }

    wait_for(Duration::from_secs(10), || done.count() == 0);
    assert_eq!(resumed.load(Ordering::SeqCst), WAITERS);

    scheduler.stop();
    handle.join().unwrap();
}

#[test]
fn main_thread_affinity_job_observes_worker_zero() {
    let (scheduler, handle) = spin_up(4);

    let done = fiberjobs::WaitGroup::new(&scheduler, 0);
    let observed_worker = Arc::new(AtomicU32::new(u32::MAX));

    // Scheduled from this test thread (not a worker at all), which exercises
    // the same affinity check a job running on worker 3 would.
    {
        let observed_worker = Arc::clone(&observed_worker);
        job(move || {
            observed_worker.store(Scheduler::current_worker_index(), Ordering::SeqCst);
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::MAIN_THREAD);
    }

    wait_for(Duration::from_secs(5), || done.count() == 0);
    assert_eq!(observed_worker.load(Ordering::SeqCst), 0);

    scheduler.stop();
    handle.join().unwrap();
}

#[test]
fn shutdown_drains_all_scheduled_jobs() {
    const JOB_COUNT: u64 = 10_000;
    let (scheduler, handle) = spin_up(4);

    let executed = Arc::new(AtomicU64::new(0));
    let done = fiberjobs::WaitGroup::new(&scheduler, 0);

    for _ in 0..JOB_COUNT {
        let executed = Arc::clone(&executed);
        job(move || {
            executed.fetch_add(1, Ordering::SeqCst);
        })
        .schedule(&scheduler, Some(&done), Priority::Normal, Affinity::ANY);
    }

    {
        let scheduler_for_stop = Arc::clone(&scheduler);
        let executed = Arc::clone(&executed);
        job(move || {
            // Runs once every prior job has completed (same completion
            // group), so the drain is guaranteed finished by the time this
            // calls `stop`.
            assert_eq!(executed.load(Ordering::SeqCst), JOB_COUNT);
            scheduler_for_stop.stop();
        })
        .schedule(&scheduler, Some(&done), Priority::Low, Affinity::ANY);
    }

    handle.join().unwrap();
    assert_eq!(executed.load(Ordering::SeqCst), JOB_COUNT);
}

#[test]
fn parallel_merge_sort_produces_sorted_output() {
    use rand::Rng;

    const LEN: usize = 200_000;
    const LEAF: usize = 8192;

    let (scheduler, handle) = spin_up(4);

    let mut rng = rand::thread_rng();
    let mut data: Vec<i32> = (0..LEN).map(|_| rng.gen()).collect();

    struct SortJob {
        slice: *mut [i32],
        scheduler: Arc<Scheduler>,
    }
    // Safety: disjoint, non-overlapping slices are handed to sibling jobs;
    // the parent never touches its half again until both children signal.
    unsafe impl Send for SortJob {}

    impl Job for SortJob {
        fn execute(&mut self) {
            // Safety: see the type's safety comment.
            let slice = unsafe { &mut *self.slice };
            if slice.len() <= LEAF {
                slice.sort_unstable();
                return;
            }
            let mid = slice.len() / 2;
            let (left, right) = slice.split_at_mut(mid);

            let wg = fiberjobs::WaitGroup::new(&self.scheduler, 0);
            SortJob { slice: left as *mut [i32], scheduler: Arc::clone(&self.scheduler) }
                .schedule(&self.scheduler, Some(&wg), Priority::Normal, Affinity::ANY);
            SortJob { slice: right as *mut [i32], scheduler: Arc::clone(&self.scheduler) }
                .schedule(&self.scheduler, Some(&wg), Priority::Normal, Affinity::ANY);
            wg.wait();

            let mut merged = Vec::with_capacity(slice.len());
            let (mut i, mut j) = (0, 0);
            while i < left.len() && j < right.len() {
                if left[i] <= right[j] {
                    merged.push(left[i]);
                    i += 1;
                } else {
                    merged.push(right[j]);
                    j += 1;
                }
            }
            merged.extend_from_slice(&left[i..]);
            merged.extend_from_slice(&right[j..]);
            slice.copy_from_slice(&merged);
        }
    }

    let root = fiberjobs::WaitGroup::new(&scheduler, 0);
    SortJob { slice: data.as_mut_slice() as *mut [i32], scheduler: Arc::clone(&scheduler) }.schedule(
        &scheduler,
        Some(&root),
        Priority::Normal,
        Affinity::ANY,
    );

    wait_for(Duration::from_secs(30), || root.count() == 0);

    assert!(data.windows(2).all(|w| w[0] <= w[1]));

    scheduler.stop();
    handle.join().unwrap();
}
