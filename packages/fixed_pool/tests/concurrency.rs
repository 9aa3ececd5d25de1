//! Multithreaded tests that share one pool between threads.
//!
//! These are ignored under Miri, which makes them far too slow to be useful.

#![allow(clippy::arithmetic_side_effects, reason = "panic is fine in tests")]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use fixed_pool::{Pool, Tracking};
use new_zealand::nz;
use testing::{run_concurrently, with_watchdog};

const ROUNDS: usize = 5;

struct Counted(Arc<AtomicUsize>);

impl Drop for Counted {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

fn create_destroy_rounds(tracking: Tracking) {
    with_watchdog(move || {
        let pool = Pool::<(usize, usize)>::builder().tracking(tracking).build();
        let per_thread = pool.pool_size() / 2;

        run_concurrently(2, |thread_index| {
            for round in 0..ROUNDS {
                let items = (0..per_thread)
                    .map(|n| pool.create((thread_index, round * per_thread + n)).unwrap())
                    .collect::<Vec<_>>();

                for (n, item) in items.iter().enumerate() {
                    assert_eq!(**item, (thread_index, round * per_thread + n));
                }
            }
        });

        assert_eq!(pool.allocated_count(), 0);
        assert!(pool.is_empty());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn two_threads_create_and_destroy_ordered() {
    create_destroy_rounds(Tracking::Ordered);
}

#[cfg_attr(miri, ignore)]
#[test]
fn two_threads_create_and_destroy_unordered() {
    create_destroy_rounds(Tracking::Unordered);
}

#[cfg_attr(miri, ignore)]
#[test]
fn many_threads_grow_the_pool_together() {
    for tracking in [Tracking::Ordered, Tracking::Unordered] {
        with_watchdog(move || {
            const THREADS: usize = 8;
            const PER_THREAD: usize = 100;

            let pool = Pool::<usize>::builder()
                .block_capacity(nz!(32))
                .tracking(tracking)
                .build();

            let handles = run_concurrently(THREADS, |thread_index| {
                (0..PER_THREAD)
                    .map(|n| pool.create(thread_index * PER_THREAD + n).unwrap())
                    .collect::<Vec<_>>()
            });

            let total = handles.iter().map(Vec::len).sum::<usize>();
            assert_eq!(total, THREADS * PER_THREAD);
            assert_eq!(pool.allocated_count(), THREADS * PER_THREAD);

            // 800 objects fit in 25 blocks; racing growers must not append extra blocks.
            assert_eq!(pool.block_count(), 25);

            let mut values = handles.iter().flatten().map(|item| **item).collect::<Vec<_>>();
            values.sort_unstable();
            assert_eq!(values, (0..THREADS * PER_THREAD).collect::<Vec<_>>());

            drop(handles);
            assert!(pool.is_empty());
        });
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn handles_can_be_dropped_on_other_threads() {
    with_watchdog(|| {
        let drops = Arc::new(AtomicUsize::new(0));

        let pool = Pool::<Counted>::builder()
            .tracking(Tracking::Unordered)
            .build();

        let mut handles = (0..64)
            .map(|_| pool.create(Counted(Arc::clone(&drops))).unwrap())
            .collect::<Vec<_>>();

        let chunk_size = handles.len() / 4;
        let chunks = (0..4)
            .map(|_| handles.split_off(handles.len() - chunk_size))
            .collect::<Vec<_>>();

        thread::scope(|s| {
            for chunk in chunks {
                s.spawn(move || drop(chunk));
            }
        });

        assert_eq!(drops.load(Ordering::Relaxed), 64);
        assert!(pool.is_empty());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn iteration_blocks_concurrent_changes() {
    with_watchdog(|| {
        let pool = Pool::<u32>::builder().block_capacity(nz!(16)).build();

        let _items = (0..10).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

        thread::scope(|s| {
            let iter = pool.iter().unwrap();

            let creator = s.spawn(|| {
                // Blocks until the iterator below is dropped.
                drop(pool.create(99).unwrap());
            });

            // While we hold the iterator, the pool cannot change under us.
            assert_eq!(iter.count(), 10);

            creator.join().unwrap();
        });

        assert_eq!(pool.allocated_count(), 10);
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn counts_are_readable_during_iteration() {
    with_watchdog(|| {
        let pool = Pool::<u32>::builder().block_capacity(nz!(8)).build();

        let _items = (0..5).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

        let mut iter = pool.iter().unwrap();
        assert!(iter.next().is_some());

        // Same thread, lock still held by the iterator.
        assert_eq!(pool.allocated_count(), 5);
        assert!(!pool.is_empty());
        assert_eq!(pool.max_allocated_count(), 8);

        assert_eq!(iter.count(), 4);
    });
}
