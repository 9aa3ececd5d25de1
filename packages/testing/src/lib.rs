#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for testing the pool packages.

use std::sync::{Barrier, mpsc};
use std::time::Duration;
use std::{env, panic, thread};

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Pool tests take locks and spin up threads, so a broken invariant tends to show up as a
/// deadlock rather than a failed assertion. If the test takes longer than the timeout, this
/// panics instead of letting the test binary hang.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly. This allows mutation testing to properly detect
/// hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode). Panics from the
/// test itself are propagated.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        // If this fails, the receiver has already timed out.
        drop(tx.send(test_fn()));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("test thread sent its result, so it cannot panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test exceeded the {timeout:?} watchdog timeout, probably a deadlock");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("test thread disconnected without a result"),
            Err(payload) => panic::resume_unwind(payload),
        },
    }
}

/// Runs `worker` on `threads` threads at once and returns what each of them returned, in
/// thread index order.
///
/// All threads wait on a barrier before calling `worker`, so they start as close to
/// simultaneously as the platform allows, which maximizes contention on whatever they share.
///
/// # Panics
///
/// Propagates any panic from a worker.
///
/// # Example
///
/// ```rust
/// use testing::run_concurrently;
///
/// let squares = run_concurrently(4, |index| index * index);
/// assert_eq!(squares, vec![0, 1, 4, 9]);
/// ```
pub fn run_concurrently<F, R>(threads: usize, worker: F) -> Vec<R>
where
    F: Fn(usize) -> R + Sync,
    R: Send,
{
    let barrier = Barrier::new(threads);

    thread::scope(|s| {
        let handles = (0..threads)
            .map(|index| {
                let barrier = &barrier;
                let worker = &worker;

                s.spawn(move || {
                    barrier.wait();
                    worker(index)
                })
            })
            .collect::<Vec<_>>();

        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
            .collect()
    })
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    #[should_panic]
    fn watchdog_propagates_panics() {
        with_watchdog::<_, ()>(|| panic!("inner failure"));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri is too slow for real threads here.
    fn concurrent_workers_all_run() {
        let counter = AtomicUsize::new(0);

        let indexes = run_concurrently(8, |index| {
            counter.fetch_add(1, Ordering::Relaxed);
            index
        });

        assert_eq!(indexes, (0..8).collect::<Vec<_>>());
        assert_eq!(counter.load(Ordering::Relaxed), 8);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri is too slow for real threads here.
    #[should_panic(expected = "worker 1 failed")]
    fn concurrent_worker_panic_is_propagated() {
        run_concurrently(2, |index| {
            assert_ne!(index, 1, "worker 1 failed");
            index
        });
    }
}
