//! Demonstrates the C-compatible pool interface as a foreign caller would use it.
//!
//! Raw slots of a fixed size are obtained and returned through `extern "C"` functions,
//! with the pool itself held behind an opaque pointer.

use std::ptr;

use fixed_pool::ffi::{
    fixed_pool_allocate, fixed_pool_allocated_count, fixed_pool_create, fixed_pool_deallocate,
    fixed_pool_destroy, fixed_pool_size,
};

#[repr(C)]
struct Point {
    x: f64,
    y: f64,
}

fn main() {
    let pool = fixed_pool_create(size_of::<Point>(), 8);
    assert!(!pool.is_null(), "valid arguments always produce a pool");

    // SAFETY: The pool pointer is live until fixed_pool_destroy() below.
    let capacity = unsafe { fixed_pool_size(pool) };
    println!("Pool created with room for {capacity} points");

    let mut points = Vec::new();

    for index in 0..5_u32 {
        // SAFETY: The pool pointer is live.
        let slot = unsafe { fixed_pool_allocate(pool) }.cast::<Point>();
        assert!(!slot.is_null(), "the pool has free slots");

        let point = Point {
            x: f64::from(index),
            y: f64::from(index) * 2.0,
        };

        // SAFETY: Slots are at least as large and as aligned as a Point.
        unsafe { ptr::write(slot, point) };

        points.push(slot);
    }

    // SAFETY: The pool pointer is live.
    let allocated = unsafe { fixed_pool_allocated_count(pool) };
    println!("Allocated {allocated} points");

    for slot in &points {
        // SAFETY: We initialized each slot above and nothing else accesses it.
        let point = unsafe { &**slot };
        println!("  ({}, {})", point.x, point.y);
    }

    for slot in points {
        // SAFETY: Each slot came from this pool and is released exactly once.
        unsafe { fixed_pool_deallocate(pool, slot.cast()) };
    }

    // SAFETY: The pool pointer is live.
    let allocated = unsafe { fixed_pool_allocated_count(pool) };
    println!("After releasing: {allocated} points");

    // SAFETY: The pool is not used after this.
    unsafe { fixed_pool_destroy(pool) };
}
