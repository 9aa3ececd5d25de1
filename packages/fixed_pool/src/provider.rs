use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

/// Supplies whole memory blocks to a pool and takes them back when the pool is dropped.
///
/// The pool never asks the provider for memory for individual objects, only for blocks that
/// are then carved into slots. A provider signals failure by returning `None`, which the pool
/// reports as [`Error::Exhausted`][crate::Error::Exhausted].
///
/// Providers are shared between all threads that use a pool, so they must be thread-safe.
pub trait BlockProvider: fmt::Debug + Send + Sync {
    /// Allocates a block of memory with the given layout.
    ///
    /// Returns `None` if the memory cannot be provided. The returned memory does not need to
    /// be initialized. If the returned pointer is not aligned as requested, the pool returns
    /// the block via [`deallocate()`](Self::deallocate) and treats the growth as failed.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Returns a block previously obtained from [`allocate()`](Self::allocate).
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by `allocate()` on this provider with the
    /// same `layout` and that it has not already been deallocated.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Obtains blocks from the Rust global allocator. This is the default provider.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemProvider;

impl BlockProvider for SystemProvider {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        assert!(layout.size() > 0, "blocks are never zero-sized");

        // SAFETY: The layout is non-zero-sized, as asserted above.
        NonNull::new(unsafe { alloc::alloc(layout) })
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: Forwarding guarantees from the caller that the block came from `alloc()`
        // with the same layout.
        unsafe {
            alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

/// Function that allocates `size` bytes and returns null on failure, shaped like `malloc`.
pub type AllocateFn = unsafe extern "C" fn(size: usize) -> *mut c_void;

/// Function that releases memory obtained from the matching [`AllocateFn`], shaped like `free`.
pub type DeallocateFn = unsafe extern "C" fn(ptr: *mut c_void);

/// Obtains blocks from a pair of `malloc`/`free`-shaped functions.
///
/// These functions only know about byte sizes, not alignment. Blocks they return that do not
/// satisfy the alignment the pool requires are handed back and the growth is treated as failed.
/// Functions with `malloc` semantics are suitably aligned for any object with fundamental
/// alignment.
#[derive(Clone, Copy)]
pub struct FnProvider {
    allocate_fn: AllocateFn,
    deallocate_fn: DeallocateFn,
}

impl FnProvider {
    /// Creates a provider from an allocate/deallocate function pair.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    ///
    /// * `allocate_fn` either returns null or a pointer to at least `size` writable bytes that
    ///   remain valid until passed to `deallocate_fn`.
    /// * `deallocate_fn` accepts every non-null pointer returned by `allocate_fn`.
    /// * Both functions may be called from any thread.
    #[must_use]
    pub unsafe fn new(allocate_fn: AllocateFn, deallocate_fn: DeallocateFn) -> Self {
        Self {
            allocate_fn,
            deallocate_fn,
        }
    }

    /// A provider backed by the C runtime's `malloc` and `free`.
    #[must_use]
    pub fn libc() -> Self {
        // SAFETY: malloc/free satisfy the contract of `new()` and are thread-safe.
        unsafe { Self::new(libc::malloc, libc::free) }
    }
}

impl fmt::Debug for FnProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProvider")
            .field("allocate_fn", &(self.allocate_fn as *const ()))
            .field("deallocate_fn", &(self.deallocate_fn as *const ()))
            .finish()
    }
}

impl BlockProvider for FnProvider {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: The functions satisfy the contract established in `new()`.
        let ptr = unsafe { (self.allocate_fn)(layout.size()) };

        NonNull::new(ptr.cast::<u8>())
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, _layout: Layout) {
        // SAFETY: The caller guarantees the pointer came from our `allocate()`, which means it
        // came from `allocate_fn`, whose matching release function is `deallocate_fn`.
        unsafe {
            (self.deallocate_fn)(ptr.as_ptr().cast::<c_void>());
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::ptr;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SystemProvider: Send, Sync, BlockProvider);
    assert_impl_all!(FnProvider: Send, Sync, BlockProvider);

    #[test]
    fn system_provider_round_trip() {
        let layout = Layout::from_size_align(256, 64).unwrap();
        let provider = SystemProvider;

        let ptr = provider.allocate(layout).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 64, 0);

        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 256);
            provider.deallocate(ptr, layout);
        }
    }

    #[test]
    fn libc_provider_round_trip() {
        let layout = Layout::from_size_align(128, 8).unwrap();
        let provider = FnProvider::libc();

        let ptr = provider.allocate(layout).unwrap();

        unsafe {
            ptr.as_ptr().write_bytes(0xCD, 128);
            provider.deallocate(ptr, layout);
        }
    }

    unsafe extern "C" fn always_null(_size: usize) -> *mut c_void {
        ptr::null_mut()
    }

    unsafe extern "C" fn never_called(_ptr: *mut c_void) {
        panic!("nothing was allocated, so nothing may be deallocated");
    }

    #[test]
    fn fn_provider_reports_null_as_none() {
        let provider = unsafe { FnProvider::new(always_null, never_called) };

        assert!(provider.allocate(Layout::new::<u64>()).is_none());
    }
}
