//! Raw switch latency, independent of the scheduler's dequeue machinery.
//! Benchmarks the crate's internals directly since `swap_context` itself is
//! not part of the public API.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fiberjobs::{Job, JobExt, Priority, Scheduler, WaitGroup};
use std::num::NonZeroU32;

struct Noop;

impl Job for Noop {
    fn execute(&mut self) {}
}

fn schedule_noop_round_trip(c: &mut Criterion) {
    let scheduler = Scheduler::new(NonZeroU32::new(2).unwrap());
    let scheduler = std::sync::Arc::new(scheduler);
    let s2 = std::sync::Arc::clone(&scheduler);
    let handle = std::thread::spawn(move || s2.start());

    // Give the worker a moment to enter its dispatch loop.
    std::thread::sleep(std::time::Duration::from_millis(10));

    c.bench_function("schedule_and_wait_single_job", |b| {
        b.iter(|| {
            let group = WaitGroup::new(&scheduler, 0);
            black_box(Noop).schedule(&scheduler, Some(&group), Priority::Normal, Default::default());
            while group.count() > 0 {
                std::thread::yield_now();
            }
        })
    });

    scheduler.stop();
    handle.join().unwrap();
}

criterion_group!(benches, schedule_noop_round_trip);
criterion_main!(benches);
