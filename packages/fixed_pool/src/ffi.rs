//! C-compatible functions for using a pool from foreign code.
//!
//! A pool is represented on the boundary by an opaque [`FixedPool`] pointer. Objects are
//! identified by the pointers returned from [`fixed_pool_allocate()`] and are aligned to
//! [`DEFAULT_OBJECT_ALIGN`][crate::DEFAULT_OBJECT_ALIGN] bytes.
//!
//! Null pool handles are tolerated everywhere: queries return zero, allocation returns null and
//! releasing is a no-op. Foreign code cannot observe panics, so pools created here always
//! use [`DropPolicy::MayDropItems`].

use std::ffi::c_void;
use std::num::NonZero;
use std::ptr::{self, NonNull};

use tracing::warn;

use crate::{AllocateFn, DeallocateFn, DropPolicy, FnProvider, RawPool};

const SLOT_OVERHEAD_BOUND: usize = 64;

/// Opaque handle to a pool created via [`fixed_pool_create()`].
#[derive(Debug)]
pub struct FixedPool {
    raw: RawPool,
}

fn build(object_size: usize, pool_size: usize, provider: Option<FnProvider>) -> *mut FixedPool {
    if object_size == 0 {
        warn!("refusing to create a pool with zero object size");
        return ptr::null_mut();
    }

    let Some(block_capacity) = u32::try_from(pool_size)
        .ok()
        .filter(|capacity| *capacity < u32::MAX)
        .and_then(NonZero::new)
    else {
        warn!(pool_size, "refusing to create a pool with invalid pool size");
        return ptr::null_mut();
    };

    // Generous upper bound for a slot: the object plus header and alignment padding.
    let fits_in_memory = object_size
        .checked_add(SLOT_OVERHEAD_BOUND)
        .and_then(|slot| slot.checked_mul(pool_size))
        .is_some_and(|block| block <= isize::MAX.unsigned_abs());

    if !fits_in_memory {
        warn!(
            object_size,
            pool_size, "refusing to create a pool with oversized blocks"
        );
        return ptr::null_mut();
    }

    let mut builder = RawPool::builder()
        .object_size(object_size)
        .block_capacity(block_capacity)
        .drop_policy(DropPolicy::MayDropItems);

    if let Some(provider) = provider {
        builder = builder.provider(provider);
    }

    Box::into_raw(Box::new(FixedPool {
        raw: builder.build(),
    }))
}

/// Creates a pool for objects of `object_size` bytes that grows `pool_size` objects at a time,
/// using the global allocator for its memory.
///
/// Returns null if either argument is zero or out of range. The pool must be released via
/// [`fixed_pool_destroy()`].
#[unsafe(no_mangle)]
pub extern "C" fn fixed_pool_create(object_size: usize, pool_size: usize) -> *mut FixedPool {
    build(object_size, pool_size, None)
}

/// Creates a pool like [`fixed_pool_create()`] but obtains its memory blocks from the given
/// `malloc`/`free`-shaped functions.
///
/// Blocks that are not aligned to the object alignment are returned via `deallocate_fn` and
/// treated as allocation failure.
///
/// # Safety
///
/// The functions must satisfy the contract of [`FnProvider::new()`]: `allocate_fn` returns null
/// or at least `size` writable bytes, `deallocate_fn` accepts every pointer `allocate_fn`
/// returned and both may be called from any thread.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fixed_pool_create_with_provider(
    object_size: usize,
    pool_size: usize,
    allocate_fn: AllocateFn,
    deallocate_fn: DeallocateFn,
) -> *mut FixedPool {
    // SAFETY: Forwarding guarantees from the caller.
    let provider = unsafe { FnProvider::new(allocate_fn, deallocate_fn) };

    build(object_size, pool_size, Some(provider))
}

/// Destroys a pool and releases all its memory, including that of objects never deallocated.
///
/// Does nothing if `pool` is null.
///
/// # Safety
///
/// `pool` must be null or a pointer returned by one of the creation functions that has not been
/// destroyed yet. Neither the pool nor any object pointer obtained from it may be used after
/// this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fixed_pool_destroy(pool: *mut FixedPool) {
    if pool.is_null() {
        return;
    }

    // SAFETY: The caller guarantees the pointer came from Box::into_raw() in build() and is not
    // used again.
    drop(unsafe { Box::from_raw(pool) });
}

/// Allocates memory for one object from the pool.
///
/// Returns null if `pool` is null or if the pool is exhausted.
///
/// # Safety
///
/// `pool` must be null or a live pool returned by one of the creation functions.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fixed_pool_allocate(pool: *const FixedPool) -> *mut c_void {
    // SAFETY: The caller guarantees the pointer is null or refers to a live pool.
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        return ptr::null_mut();
    };

    pool.raw
        .allocate()
        .map_or(ptr::null_mut(), |object| object.as_ptr().cast::<c_void>())
}

/// Returns memory for one object to the pool.
///
/// Does nothing if `pool` or `object` is null.
///
/// # Safety
///
/// `pool` must be null or a live pool returned by one of the creation functions. `object` must
/// be null or a pointer returned by [`fixed_pool_allocate()`] on the same pool that has not been
/// deallocated yet, and it must not be used after this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fixed_pool_deallocate(pool: *const FixedPool, object: *mut c_void) {
    // SAFETY: The caller guarantees the pointer is null or refers to a live pool.
    let Some(pool) = (unsafe { pool.as_ref() }) else {
        return;
    };

    let Some(object) = NonNull::new(object.cast::<u8>()) else {
        return;
    };

    // SAFETY: Forwarding guarantees from the caller.
    unsafe {
        pool.raw.deallocate(object);
    }
}

/// Number of objects the pool grows by at a time, as given at creation. Zero if `pool` is null.
///
/// # Safety
///
/// `pool` must be null or a live pool returned by one of the creation functions.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fixed_pool_size(pool: *const FixedPool) -> usize {
    // SAFETY: The caller guarantees the pointer is null or refers to a live pool.
    unsafe { pool.as_ref() }.map_or(0, |pool| pool.raw.pool_size())
}

/// Number of objects currently allocated from the pool. Zero if `pool` is null.
///
/// # Safety
///
/// `pool` must be null or a live pool returned by one of the creation functions.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn fixed_pool_allocated_count(pool: *const FixedPool) -> usize {
    // SAFETY: The caller guarantees the pointer is null or refers to a live pool.
    unsafe { pool.as_ref() }.map_or(0, |pool| pool.raw.allocated_count())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn create_allocate_deallocate_destroy() {
        let pool = fixed_pool_create(48, 4);
        assert!(!pool.is_null());

        unsafe {
            assert_eq!(fixed_pool_size(pool), 4);
            assert_eq!(fixed_pool_allocated_count(pool), 0);

            let objects = (0..6)
                .map(|_| fixed_pool_allocate(pool))
                .collect::<Vec<_>>();

            for object in &objects {
                assert!(!object.is_null());
                assert_eq!(object.addr() % crate::DEFAULT_OBJECT_ALIGN, 0);
                object.cast::<u8>().write_bytes(0x5A, 48);
            }

            assert_eq!(fixed_pool_allocated_count(pool), 6);

            for object in objects {
                fixed_pool_deallocate(pool, object);
            }

            assert_eq!(fixed_pool_allocated_count(pool), 0);

            fixed_pool_destroy(pool);
        }
    }

    #[test]
    fn invalid_arguments_yield_null() {
        assert!(fixed_pool_create(0, 4).is_null());
        assert!(fixed_pool_create(8, 0).is_null());
        assert!(fixed_pool_create(usize::MAX, 4).is_null());

        #[cfg(target_pointer_width = "64")]
        assert!(fixed_pool_create(8, usize::MAX).is_null());
    }

    #[test]
    fn null_pool_is_tolerated() {
        unsafe {
            assert!(fixed_pool_allocate(ptr::null()).is_null());
            fixed_pool_deallocate(ptr::null(), ptr::null_mut());
            assert_eq!(fixed_pool_size(ptr::null()), 0);
            assert_eq!(fixed_pool_allocated_count(ptr::null()), 0);
            fixed_pool_destroy(ptr::null_mut());
        }
    }

    #[test]
    fn null_object_is_ignored() {
        let pool = fixed_pool_create(8, 2);

        unsafe {
            fixed_pool_deallocate(pool, ptr::null_mut());
            assert_eq!(fixed_pool_allocated_count(pool), 0);
            fixed_pool_destroy(pool);
        }
    }

    #[test]
    fn destroy_with_live_objects_releases_memory() {
        let pool = fixed_pool_create(16, 2);

        unsafe {
            assert!(!fixed_pool_allocate(pool).is_null());
            assert!(!fixed_pool_allocate(pool).is_null());
            assert!(!fixed_pool_allocate(pool).is_null());

            fixed_pool_destroy(pool);
        }
    }

    static CUSTOM_ALLOCATIONS: AtomicUsize = AtomicUsize::new(0);
    static CUSTOM_RELEASES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn counting_malloc(size: usize) -> *mut c_void {
        CUSTOM_ALLOCATIONS.fetch_add(1, Ordering::Relaxed);
        unsafe { libc::malloc(size) }
    }

    unsafe extern "C" fn counting_free(ptr: *mut c_void) {
        CUSTOM_RELEASES.fetch_add(1, Ordering::Relaxed);
        unsafe { libc::free(ptr) }
    }

    #[test]
    fn custom_provider_supplies_blocks() {
        let pool =
            unsafe { fixed_pool_create_with_provider(8, 2, counting_malloc, counting_free) };
        assert!(!pool.is_null());

        unsafe {
            let objects = (0..5)
                .map(|_| fixed_pool_allocate(pool))
                .collect::<Vec<_>>();

            assert!(objects.iter().all(|object| !object.is_null()));
            assert_eq!(CUSTOM_ALLOCATIONS.load(Ordering::Relaxed), 3);

            for object in objects {
                fixed_pool_deallocate(pool, object);
            }

            fixed_pool_destroy(pool);
        }

        assert_eq!(CUSTOM_RELEASES.load(Ordering::Relaxed), 3);
    }

    unsafe extern "C" fn failing_malloc(_size: usize) -> *mut c_void {
        ptr::null_mut()
    }

    unsafe extern "C" fn unreachable_free(_ptr: *mut c_void) {}

    #[test]
    fn exhausted_provider_yields_null() {
        let pool =
            unsafe { fixed_pool_create_with_provider(8, 2, failing_malloc, unreachable_free) };

        unsafe {
            assert!(fixed_pool_allocate(pool).is_null());
            assert_eq!(fixed_pool_allocated_count(pool), 0);

            fixed_pool_destroy(pool);
        }
    }
}
