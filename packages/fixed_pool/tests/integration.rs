//! Integration tests for `fixed_pool` through its public API.
#![allow(
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing,
    clippy::integer_division,
    clippy::modulo_arithmetic,
    reason = "panic is fine in tests"
)]

use std::collections::HashSet;
use std::ptr::NonNull;
use std::slice;

use fixed_pool::{Error, Pool, Pooled, RawPool, Tracking};
use new_zealand::nz;

const TRACKINGS: [Tracking; 2] = [Tracking::Ordered, Tracking::Unordered];

#[derive(Debug, Eq, PartialEq)]
struct Pair(i32, i32);

fn live_values<T: Copy>(pool: &Pool<T>) -> Vec<T> {
    pool.iter()
        .unwrap()
        // SAFETY: No handle is used to access its object while we read.
        .map(|ptr| unsafe { ptr.read() })
        .collect()
}

#[test]
fn fixed_capacity_pool_reports_exhaustion() {
    for tracking in TRACKINGS {
        let pool = Pool::<Pair>::builder()
            .block_capacity(nz!(4))
            .max_blocks(nz!(1))
            .tracking(tracking)
            .build();

        let items = (0..4)
            .map(|n| pool.create(Pair(n, n)).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(pool.allocated_count(), 4);
        assert_eq!(pool.max_allocated_count(), 4);

        for (n, item) in (0..4).zip(&items) {
            assert_eq!(**item, Pair(n, n));
        }

        let error = pool.create(Pair(4, 4)).unwrap_err();
        assert!(matches!(
            error,
            Error::Exhausted {
                block_count: 1,
                block_capacity: 4
            }
        ));

        // The failed create left the pool untouched.
        assert_eq!(pool.allocated_count(), 4);

        drop(items);
        assert!(pool.is_empty());
    }
}

#[test]
fn growable_pool_appends_a_block() {
    for tracking in TRACKINGS {
        let pool = Pool::<Pair>::builder()
            .block_capacity(nz!(4))
            .tracking(tracking)
            .build();

        let items = (0..5)
            .map(|n| pool.create(Pair(n, n)).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(pool.allocated_count(), 5);
        assert_eq!(pool.max_allocated_count(), 8);
        assert_eq!(pool.block_count(), 2);

        // Growth did not move the objects created before it.
        for (n, item) in (0..5).zip(&items) {
            assert_eq!(**item, Pair(n, n));
        }
    }
}

#[test]
fn released_slots_are_reused_before_growing() {
    for tracking in TRACKINGS {
        let pool = Pool::<u32>::builder()
            .block_capacity(nz!(8))
            .tracking(tracking)
            .build();

        let mut items = (0..8).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

        let released = [0, 2, 4, 6]
            .into_iter()
            .map(|index: usize| {
                let ptr = items.get(index).unwrap().as_ptr().unwrap();
                items.get_mut(index).unwrap().reset();
                ptr
            })
            .collect::<HashSet<_>>();

        assert_eq!(pool.allocated_count(), 4);

        let refilled = (100..104)
            .map(|n| pool.create(n).unwrap())
            .collect::<Vec<_>>();

        let reused = refilled
            .iter()
            .map(|item| item.as_ptr().unwrap())
            .collect::<HashSet<_>>();

        assert_eq!(reused, released);
        assert_eq!(pool.block_count(), 1);
        assert_eq!(pool.allocated_count(), 8);
    }
}

#[test]
fn ordered_pool_reuses_lowest_address_first() {
    let pool = Pool::<u32>::builder().block_capacity(nz!(8)).build();

    let mut items = (0..8).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

    let addresses = items
        .iter()
        .map(|item| pool.locate(item.as_ptr().unwrap()).unwrap())
        .collect::<Vec<_>>();

    for index in [6, 0, 4, 2] {
        items.get_mut(index).unwrap().reset();
    }

    for expected in [0, 2, 4, 6] {
        let item = pool.create(1000).unwrap();
        let address = pool.locate(item.as_ptr().unwrap()).unwrap();

        assert_eq!(address, *addresses.get(expected).unwrap());

        // Keep the slot occupied so the next create moves on.
        items.push(item);
    }
}

#[test]
fn iteration_is_in_ascending_address_order() {
    let pool = Pool::<u64>::builder().block_capacity(nz!(16)).build();

    let mut items = (0..40).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

    for item in items.iter_mut().step_by(2) {
        item.reset();
    }

    items.extend((1000..1010).map(|n| pool.create(n).unwrap()));

    let pointers = pool.iter().unwrap().collect::<Vec<NonNull<u64>>>();
    assert_eq!(pointers.len(), 30);

    let addresses = pointers
        .iter()
        .map(|ptr| pool.locate(*ptr).unwrap())
        .collect::<Vec<_>>();

    assert!(
        addresses.windows(2).all(|pair| pair[0] < pair[1]),
        "iteration order is not ascending: {addresses:?}"
    );

    // The new values took the lowest ten free slots, interleaved with the survivors.
    let expected = (0..40)
        .filter_map(|slot| match (slot % 2, slot < 20) {
            (0, true) => Some(1000 + slot / 2),
            (0, false) => None,
            _ => Some(slot),
        })
        .collect::<Vec<u64>>();

    assert_eq!(live_values(&pool), expected);
}

#[test]
fn live_objects_never_alias() {
    for tracking in TRACKINGS {
        let pool = Pool::<[u8; 24]>::builder()
            .block_capacity(nz!(8))
            .tracking(tracking)
            .build();

        let mut items = Vec::new();

        for round in 0_u8..6 {
            items.extend((0..10).map(|_| pool.create([round; 24]).unwrap()));

            // Release the objects from two rounds ago to mix reuse with growth.
            items.retain(|item| item[0] % 3 != (round + 1) % 3);
        }

        let starts = items
            .iter()
            .map(|item| item.as_ptr().unwrap().as_ptr().addr())
            .collect::<HashSet<_>>();

        assert_eq!(starts.len(), items.len());
        assert_eq!(pool.allocated_count(), items.len());
        assert!(pool.allocated_count() <= pool.max_allocated_count());

        for item in &items {
            assert!(item.iter().all(|byte| *byte == item[0]));
        }
    }
}

#[test]
fn max_allocated_count_never_shrinks() {
    let pool = Pool::<u16>::builder().block_capacity(nz!(4)).build();

    let mut previous = pool.max_allocated_count();

    for round in 0..5 {
        let items = (0..round * 3).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

        assert!(pool.max_allocated_count() >= previous);
        previous = pool.max_allocated_count();

        drop(items);

        assert_eq!(pool.max_allocated_count(), previous);
    }
}

#[test]
fn emptied_handle_releases_once() {
    let pool = Pool::<String>::builder().build();

    let mut item = pool.create("once".to_string()).unwrap();
    let other = pool.create("other".to_string()).unwrap();

    item.reset();
    item.reset();

    assert_eq!(pool.allocated_count(), 1);
    assert_eq!(*other, "other");

    let mut moved_from = pool.create("moved".to_string()).unwrap();
    let moved_to: Pooled<'_, String> = moved_from.take();
    drop(moved_from);

    assert_eq!(pool.allocated_count(), 2);
    assert_eq!(*moved_to, "moved");
}

#[test]
fn raw_pool_round_trip() {
    let pool = RawPool::builder()
        .object_size(32)
        .block_capacity(nz!(4))
        .build();

    let pointers = (0..9).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();

    for (index, ptr) in pointers.iter().enumerate() {
        let fill = u8::try_from(index).unwrap();

        // SAFETY: Each slot is 32 bytes of memory that only we use.
        unsafe { ptr.as_ptr().write_bytes(fill, 32) };
    }

    for (index, ptr) in pointers.iter().enumerate() {
        let fill = u8::try_from(index).unwrap();

        // SAFETY: We initialized every byte above.
        let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), 32) };
        assert!(bytes.iter().all(|byte| *byte == fill));
    }

    for ptr in pointers {
        // SAFETY: The pointer came from this pool and is not used after this.
        unsafe { pool.deallocate(ptr) };
    }

    assert!(pool.is_empty());
    assert_eq!(pool.max_allocated_count(), 12);
}
