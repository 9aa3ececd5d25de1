//! Basic benchmarks for the `fixed_pool` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::iter;
use std::time::Instant;

use criterion::{Criterion, criterion_group, criterion_main};
use fixed_pool::{Pool, Tracking};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

type TestItem = usize;
const TEST_VALUE: TestItem = 1024;

const TRACKINGS: [(Tracking, &str); 2] = [
    (Tracking::Ordered, "ordered"),
    (Tracking::Unordered, "unordered"),
];

fn entrypoint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fixed_basic");

    group.bench_function("build_empty", |b| {
        b.iter_custom(|iters| {
            let start = Instant::now();

            for _ in 0..iters {
                drop(black_box(Pool::<TestItem>::builder().build()));
            }

            start.elapsed()
        });
    });

    for (tracking, name) in TRACKINGS {
        group.bench_function(format!("create_destroy_warm_{name}"), |b| {
            b.iter_custom(|iters| {
                let pool = Pool::<TestItem>::builder().tracking(tracking).build();

                // Warm up so that the measured loop never grows the pool.
                drop(pool.create(TEST_VALUE).unwrap());

                let start = Instant::now();

                for _ in 0..iters {
                    drop(black_box(pool.create(black_box(TEST_VALUE)).unwrap()));
                }

                start.elapsed()
            });
        });

        group.bench_function(format!("create_destroy_half_full_{name}"), |b| {
            b.iter_custom(|iters| {
                let pool = Pool::<TestItem>::builder().tracking(tracking).build();

                // Every other slot of the first block is occupied, so the ordered tracker
                // has chains to walk on every operation.
                let mut all = iter::repeat_with(|| pool.create(TEST_VALUE).unwrap())
                    .take(pool.pool_size())
                    .collect::<Vec<_>>();

                let _held = all
                    .iter_mut()
                    .enumerate()
                    .filter(|(index, _)| index % 2 == 0)
                    .map(|(_, handle)| handle.take())
                    .collect::<Vec<_>>();

                drop(all);

                let start = Instant::now();

                for _ in 0..iters {
                    drop(black_box(pool.create(black_box(TEST_VALUE)).unwrap()));
                }

                start.elapsed()
            });
        });
    }

    group.bench_function("iterate_full_block", |b| {
        b.iter_custom(|iters| {
            let pool = Pool::<TestItem>::builder().build();

            let _items = iter::repeat_with(|| pool.create(TEST_VALUE).unwrap())
                .take(pool.pool_size())
                .collect::<Vec<_>>();

            let start = Instant::now();

            for _ in 0..iters {
                for ptr in pool.iter().unwrap() {
                    _ = black_box(ptr);
                }
            }

            start.elapsed()
        });
    });

    group.finish();
}
