//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Benchmarks for priority queue set operations
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::thread;

use idle_pulse::{Priority, PriorityQueueSet, WorkUnit};

fn unit(priority: Priority) -> WorkUnit {
    WorkUnit::new(priority, || Ok(()))
}

fn bench_enqueue_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_set/enqueue_pop");

    for priority in [Priority::Critical, Priority::Background] {
        group.bench_with_input(
            BenchmarkId::from_parameter(priority),
            &priority,
            |b, &priority| {
                let queue = PriorityQueueSet::new();
                b.iter(|| {
                    queue.enqueue(unit(black_box(priority)));
                    black_box(queue.pop_next());
                });
            },
        );
    }

    group.finish();
}

fn bench_pop_mixed_backlog(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_set/drain_mixed");

    for size in [16usize, 256, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || {
                    let queue = PriorityQueueSet::new();
                    for i in 0..size {
                        queue.enqueue(unit(Priority::ALL[i % Priority::COUNT]));
                    }
                    queue
                },
                |queue| {
                    while let Some(u) = queue.pop_next() {
                        black_box(u);
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_size_by_level(c: &mut Criterion) {
    let queue = PriorityQueueSet::new();
    for i in 0..1000 {
        queue.enqueue(unit(Priority::ALL[i % Priority::COUNT]));
    }

    c.bench_function("queue_set/size_by_level", |b| {
        b.iter(|| black_box(queue.size_by_level()));
    });
}

fn bench_concurrent_enqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_set/concurrent_enqueue");

    for num_threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let queue = Arc::new(PriorityQueueSet::new());
                    let handles: Vec<_> = (0..num_threads)
                        .map(|t| {
                            let queue = Arc::clone(&queue);
                            thread::spawn(move || {
                                for i in 0..100 {
                                    queue.enqueue(unit(Priority::ALL[(t + i) % Priority::COUNT]));
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().unwrap();
                    }
                    black_box(queue.len());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_pop,
    bench_pop_mixed_backlog,
    bench_size_by_level,
    bench_concurrent_enqueue
);

criterion_main!(benches);
