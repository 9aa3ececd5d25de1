//! Demonstrates basic usage of `Pool` with both tracking strategies.
//!
//! Objects are created into pooled slots, some are released and the freed slots are
//! reused. With ordered tracking, iteration visits the survivors in address order.

use fixed_pool::{Pool, Tracking};
use new_zealand::nz;

fn main() {
    println!("=== Ordered tracking ===");

    let pool = Pool::<String>::builder()
        .block_capacity(nz!(4))
        .max_blocks(nz!(2))
        .build();

    let mut names = ["alpha", "beta", "gamma", "delta", "epsilon"]
        .into_iter()
        .map(|name| pool.create(name.to_string()))
        .collect::<Result<Vec<_>, _>>()
        .expect("five objects fit in two blocks of four");

    println!(
        "Created {} objects in {} blocks, capacity {}",
        pool.allocated_count(),
        pool.block_count(),
        pool.max_allocated_count()
    );

    // Release "beta" and "delta". The next creations reuse their slots.
    for handle in names.iter_mut().skip(1).step_by(2) {
        handle.reset();
    }

    names.push(pool.create("zeta".to_string()).expect("a freed slot is available"));

    println!("Live objects in address order:");
    for ptr in pool.iter().expect("ordered pools support iteration") {
        let address = pool.locate(ptr).expect("iterated pointers belong to the pool");

        // SAFETY: No handle accesses its object while we read through the iterator.
        let name = unsafe { ptr.as_ref() };

        println!("  {address}: {name}");
    }

    // Four more fit before the second block is full.
    for name in ["eta", "theta", "iota", "kappa"] {
        names.push(pool.create(name.to_string()).expect("capacity remains"));
    }

    match pool.create("lambda".to_string()) {
        Ok(_) => println!("Unexpectedly found room for another object"),
        Err(error) => println!("Pool is full: {error}"),
    }

    println!();
    println!("=== Unordered tracking ===");

    let counters = Pool::<u64>::builder()
        .tracking(Tracking::Unordered)
        .build();

    let handles = (0..1000_u64)
        .map(|value| counters.create(value))
        .collect::<Result<Vec<_>, _>>()
        .expect("the default limits allow a thousand objects");

    let sum = handles.iter().map(|handle| **handle).sum::<u64>();

    println!(
        "Created {} objects across {} blocks, sum of values is {sum}",
        counters.allocated_count(),
        counters.block_count()
    );

    if let Err(error) = counters.iter() {
        println!("Iteration is not available: {error}");
    }

    drop(handles);
    println!("After dropping handles: {} live objects", counters.allocated_count());
}
