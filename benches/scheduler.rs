//! Throughput of fanning a batch of independent jobs out across workers and
//! waiting for them all to finish.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use fiberjobs::{Job, JobExt, Priority, Scheduler, WaitGroup};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

struct Increment(Arc<AtomicU64>);

impl Job for Increment {
    fn execute(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn fan_out(c: &mut Criterion) {
    let worker_count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4) as u32;
    let scheduler = Arc::new(Scheduler::new(NonZeroU32::new(worker_count.max(2)).unwrap()));
    let s2 = Arc::clone(&scheduler);
    let join = std::thread::spawn(move || s2.start());
    std::thread::sleep(std::time::Duration::from_millis(10));

    let mut group = c.benchmark_group("fan_out_fan_in");
    for job_count in [64usize, 1024, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(job_count), &job_count, |b, &job_count| {
            b.iter(|| {
                let counter = Arc::new(AtomicU64::new(0));
                let wg = WaitGroup::new(&scheduler, 0);
                for _ in 0..job_count {
                    Increment(Arc::clone(&counter)).schedule(
                        &scheduler,
                        Some(&wg),
                        Priority::Normal,
                        Default::default(),
                    );
                }
                while wg.count() > 0 {
                    std::thread::yield_now();
                }
                assert_eq!(counter.load(Ordering::Relaxed), job_count as u64);
            })
        });
    }
    group.finish();

    scheduler.stop();
    join.join().unwrap();
}

criterion_group!(benches, fan_out);
criterion_main!(benches);
