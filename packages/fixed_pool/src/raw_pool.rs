use std::alloc::Layout;
use std::iter::FusedIterator;
use std::ptr::NonNull;
use std::thread;

use parking_lot::MutexGuard;
use tracing::{trace, warn};

use crate::error::Result;
use crate::{
    BlockManager, Chains, DropPolicy, Error, PoolConfig, RawPoolBuilder, SlotAddress, SlotLayout,
    Tracker, Tracking,
};

/// A type-erased pool of fixed-size memory slots.
///
/// `RawPool` hands out uninitialized memory for objects of the [`Layout`] given at creation
/// time and takes it back when the caller is done. It never constructs or destructs objects;
/// that is the job of the typed [`Pool<T>`][crate::Pool] built on top of it, or of the caller.
///
/// Memory is carved from blocks that are allocated on demand and kept until the pool is
/// dropped, so every pointer returned by [`allocate()`](Self::allocate) stays valid and in place
/// until it is returned via [`deallocate()`](Self::deallocate), no matter how much the pool
/// grows in the meantime.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use fixed_pool::RawPool;
///
/// let pool = RawPool::builder().layout(Layout::new::<u64>()).build();
///
/// let ptr = pool.allocate().unwrap().cast::<u64>();
///
/// // SAFETY: The memory is valid for a u64 and not used by anyone else.
/// unsafe {
///     ptr.write(1234);
///     assert_eq!(ptr.read(), 1234);
/// }
///
/// assert_eq!(pool.allocated_count(), 1);
///
/// // SAFETY: The pointer came from this pool and is not used after this.
/// unsafe { pool.deallocate(ptr.cast()) };
///
/// assert!(pool.is_empty());
/// ```
///
/// # Thread safety
///
/// The pool is thread-safe ([`Send`] and [`Sync`]). Allocation and deallocation may be called
/// concurrently from any number of threads.
#[derive(Debug)]
pub struct RawPool {
    blocks: BlockManager,
    tracker: Tracker,
    drop_policy: DropPolicy,
}

impl RawPool {
    /// Creates a builder for configuring and constructing a [`RawPool`].
    ///
    /// The object layout (or size) is mandatory, all other settings are optional.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::RawPool;
    ///
    /// let pool = RawPool::builder().object_size(40).build();
    ///
    /// assert_eq!(pool.object_layout().size(), 40);
    /// ```
    #[inline]
    pub fn builder() -> RawPoolBuilder {
        RawPoolBuilder::new()
    }

    /// # Panics
    ///
    /// Panics if the layout has zero size.
    #[must_use]
    pub(crate) fn new_inner(object_layout: Layout, config: PoolConfig) -> Self {
        assert!(
            object_layout.size() > 0,
            "pool must have non-zero object size"
        );

        let layout = SlotLayout::calculate(object_layout, config.block_capacity);

        Self {
            blocks: BlockManager::new(
                layout,
                config.block_capacity,
                config.max_blocks,
                config.provider,
            ),
            tracker: Tracker::new(config.tracking),
            drop_policy: config.drop_policy,
        }
    }

    /// The layout of the objects this pool allocates memory for.
    #[must_use]
    #[inline]
    pub fn object_layout(&self) -> Layout {
        self.blocks.layout().object_layout()
    }

    /// Reserves a slot and returns a pointer to its uninitialized object memory.
    ///
    /// The pool grows by one block if all existing slots are occupied.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] if the pool needs to grow but cannot, either because the
    /// block limit has been reached or because the block provider could not supply memory.
    pub fn allocate(&self) -> Result<NonNull<u8>> {
        let address = self.tracker.reserve(&self.blocks)?;

        trace!(%address, "allocated slot");

        Ok(self.blocks.pointer_of(address))
    }

    /// Returns a slot to the pool, making it available for reuse.
    ///
    /// Any object in the slot is not dropped. The caller is responsible for destructing it
    /// first, if needed.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently allocated (e.g. it was already deallocated).
    ///
    /// In debug builds, panics if the pointer was not returned by [`allocate()`] on this pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was returned by [`allocate()`] on this pool. In
    /// release builds, passing any other pointer is undefined behavior.
    ///
    /// The memory must not be accessed after this call.
    ///
    /// [`allocate()`]: Self::allocate
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        // SAFETY: Forwarding guarantees from the caller.
        let address = unsafe { self.blocks.address_of(ptr) };

        self.tracker.release(&self.blocks, address);

        trace!(%address, "deallocated slot");
    }

    /// Number of objects in each block. The pool grows in increments of this many slots.
    #[must_use]
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.blocks.block_capacity().get() as usize
    }

    /// Number of slots currently allocated.
    ///
    /// With [`Tracking::Unordered`], this is only approximate while other threads are
    /// concurrently allocating or deallocating.
    #[must_use]
    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.tracker.len()
    }

    /// Number of slots the pool can hand out before it needs to grow again. This is the number
    /// of blocks created so far times [`pool_size()`](Self::pool_size).
    #[must_use]
    #[inline]
    pub fn max_allocated_count(&self) -> usize {
        self.blocks.capacity()
    }

    /// Whether no slots are currently allocated.
    ///
    /// An empty pool may still be holding memory blocks.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.allocated_count() == 0
    }

    /// Number of blocks created so far.
    #[must_use]
    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.block_count()
    }

    /// Number of blocks the pool may create before it reports exhaustion.
    #[must_use]
    #[inline]
    pub fn max_blocks(&self) -> usize {
        self.blocks.max_blocks()
    }

    /// How the pool tracks its free and occupied slots.
    #[must_use]
    #[inline]
    pub fn tracking(&self) -> Tracking {
        self.tracker.tracking()
    }

    /// What happens to remaining allocations when the pool is dropped.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// Grows the pool so that at least `additional` more slots can be allocated without further
    /// growth. Does nothing if the capacity is already sufficient.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`] if the required blocks cannot be created. Blocks created
    /// before the failure are kept.
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    pub fn reserve(&self, additional: usize) -> Result<()> {
        self.tracker.reserve_capacity(&self.blocks, additional)
    }

    /// Enumerates the allocated slots in ascending address order.
    ///
    /// The returned iterator holds the pool's lock for as long as it exists. Calling
    /// [`allocate()`](Self::allocate), [`deallocate()`](Self::deallocate) or
    /// [`reserve()`](Self::reserve) on the same thread before dropping the iterator deadlocks,
    /// and other threads block in those calls until it is dropped. Read-only queries such as
    /// [`allocated_count()`](Self::allocated_count) do not take the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IterationUnsupported`] if the pool uses [`Tracking::Unordered`].
    pub fn iter(&self) -> Result<RawIter<'_>> {
        let chains = self
            .tracker
            .lock_chains()
            .ok_or(Error::IterationUnsupported)?;

        Ok(RawIter {
            blocks: &self.blocks,
            next: chains.first_occupied(),
            _chains: chains,
        })
    }

    /// Finds the stable coordinates of the slot whose object memory starts at `ptr`.
    ///
    /// Returns `None` if the pointer is not the start of an object slot of this pool. The slot
    /// does not need to be allocated. This scans the block table, so it takes time proportional
    /// to the number of blocks.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::{RawPool, SlotAddress};
    /// use new_zealand::nz;
    ///
    /// let pool = RawPool::builder().object_size(8).block_capacity(nz!(2)).build();
    ///
    /// let pointers = (0..3).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();
    ///
    /// let address = pool.locate(pointers[2]).unwrap();
    /// assert_eq!((address.block(), address.slot()), (1, 0));
    ///
    /// let mut elsewhere = 0_u64;
    /// assert_eq!(pool.locate(std::ptr::NonNull::from(&mut elsewhere).cast()), None);
    /// ```
    #[must_use]
    pub fn locate(&self, ptr: NonNull<u8>) -> Option<SlotAddress> {
        self.blocks.locate(ptr)
    }

    /// Calls `drop_fn` on every allocated slot and forgets about them, leaving the pool to
    /// believe it is empty.
    ///
    /// Used by typed pools to destruct remaining objects right before the pool goes away. If
    /// `drop_fn` panics, the remaining objects are leaked.
    ///
    /// # Safety
    ///
    /// Every allocated slot must hold an initialized object that `drop_fn` may destruct, and
    /// none of them may be used afterwards.
    pub(crate) unsafe fn drop_remaining(&mut self, drop_fn: unsafe fn(NonNull<u8>)) {
        if self.is_empty() {
            return;
        }

        let occupied = self
            .blocks
            .addresses()
            .filter(|address| self.blocks.header(*address).is_occupied())
            .collect::<Vec<SlotAddress>>();

        for address in occupied {
            // SAFETY: Forwarding guarantees from the caller.
            unsafe {
                drop_fn(self.blocks.pointer_of(address));
            }
        }

        // The slots are not released one by one because the blocks are about to be freed.
        // A fresh tracker is enough to make the pool consider itself empty.
        self.tracker = Tracker::new(self.tracker.tracking());
    }
}

impl Drop for RawPool {
    fn drop(&mut self) {
        let remaining = self.allocated_count();

        if remaining == 0 {
            return;
        }

        match self.drop_policy {
            DropPolicy::MayDropItems => {
                warn!(
                    remaining,
                    "pool dropped with allocated slots; their objects are not destructed"
                );
            }
            DropPolicy::MustNotDropItems => {
                // Panicking while already panicking would abort, hiding the original panic.
                if !thread::panicking() {
                    panic!(
                        "dropped a pool with {remaining} allocated slots while using the MustNotDropItems drop policy"
                    );
                }
            }
        }
    }
}

/// Iterator over the allocated slots of a [`RawPool`] in ascending address order.
///
/// Created by [`RawPool::iter()`]. Holds the pool's lock until dropped.
#[derive(Debug)]
pub struct RawIter<'p> {
    blocks: &'p BlockManager,
    next: SlotAddress,
    _chains: MutexGuard<'p, Chains>,
}

impl Iterator for RawIter<'_> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_none() {
            return None;
        }

        let current = self.next;

        // SAFETY: We hold the lock that guards the chains via `_chains`.
        self.next = unsafe { self.blocks.header(current).next() };

        Some(self.blocks.pointer_of(current))
    }
}

impl FusedIterator for RawIter<'_> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::fmt;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(RawPool: Send, Sync, fmt::Debug);

    fn pool(tracking: Tracking) -> RawPool {
        RawPool::builder()
            .layout(Layout::new::<u64>())
            .block_capacity(nz!(4))
            .tracking(tracking)
            .build()
    }

    #[test]
    fn allocate_and_deallocate_track_counts() {
        for tracking in [Tracking::Ordered, Tracking::Unordered] {
            let pool = pool(tracking);

            assert_eq!(pool.allocated_count(), 0);
            assert_eq!(pool.max_allocated_count(), 0);
            assert_eq!(pool.block_count(), 0);

            let a = pool.allocate().unwrap();
            let b = pool.allocate().unwrap();

            assert_ne!(a, b);
            assert_eq!(pool.allocated_count(), 2);
            assert_eq!(pool.max_allocated_count(), 4);
            assert_eq!(pool.block_count(), 1);

            unsafe {
                pool.deallocate(a);
                pool.deallocate(b);
            }

            assert!(pool.is_empty());
            assert_eq!(pool.max_allocated_count(), 4);
        }
    }

    #[test]
    fn memory_is_usable_and_aligned() {
        let pool = RawPool::builder()
            .layout(Layout::from_size_align(24, 16).unwrap())
            .block_capacity(nz!(3))
            .build();

        let pointers = (0..7).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();

        for (index, ptr) in pointers.iter().enumerate() {
            assert_eq!(ptr.as_ptr().addr() % 16, 0);

            let fill = u8::try_from(index).unwrap();
            unsafe { ptr.as_ptr().write_bytes(fill, 24) };
        }

        for (index, ptr) in pointers.iter().enumerate() {
            let expected = u8::try_from(index).unwrap();

            for offset in 0..24 {
                assert_eq!(unsafe { ptr.as_ptr().add(offset).read() }, expected);
            }
        }

        for ptr in pointers {
            unsafe { pool.deallocate(ptr) };
        }
    }

    #[test]
    fn iter_yields_ascending_addresses() {
        let pool = pool(Tracking::Ordered);

        let pointers = (0..10).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();

        for ptr in pointers.iter().step_by(3) {
            unsafe { pool.deallocate(*ptr) };
        }

        let live = pool.iter().unwrap().collect::<Vec<_>>();
        let expected = pointers
            .iter()
            .enumerate()
            .filter(|(index, _)| index % 3 != 0)
            .map(|(_, ptr)| *ptr)
            .collect::<Vec<_>>();

        assert_eq!(live, expected);

        // Iteration can be restarted and gives the same result.
        assert_eq!(pool.iter().unwrap().count(), expected.len());

        for ptr in expected {
            unsafe { pool.deallocate(ptr) };
        }
    }

    #[test]
    fn queries_do_not_block_on_live_iterator() {
        let pool = pool(Tracking::Ordered);

        let pointers = (0..3).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();

        let mut iter = pool.iter().unwrap();
        assert!(iter.next().is_some());

        assert_eq!(pool.allocated_count(), 3);
        assert!(!pool.is_empty());
        assert_eq!(pool.block_count(), 1);
        assert!(pool.locate(*pointers.first().unwrap()).is_some());

        drop(iter);

        for ptr in pointers {
            unsafe { pool.deallocate(ptr) };
        }
    }

    #[test]
    fn iter_on_unordered_pool_is_unsupported() {
        let pool = pool(Tracking::Unordered);

        assert!(matches!(pool.iter(), Err(Error::IterationUnsupported)));
    }

    #[test]
    fn exhaustion_with_fixed_capacity() {
        let pool = RawPool::builder()
            .layout(Layout::new::<u32>())
            .block_capacity(nz!(2))
            .max_blocks(nz!(1))
            .build();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        assert!(matches!(
            pool.allocate(),
            Err(Error::Exhausted {
                block_count: 1,
                block_capacity: 2
            })
        ));

        unsafe {
            pool.deallocate(a);
            pool.deallocate(b);
        }
    }

    #[test]
    fn reserve_creates_blocks_up_front() {
        let pool = pool(Tracking::Ordered);

        pool.reserve(9).unwrap();

        assert_eq!(pool.block_count(), 3);
        assert_eq!(pool.allocated_count(), 0);

        // Already enough room.
        pool.reserve(12).unwrap();
        assert_eq!(pool.block_count(), 3);
    }

    #[test]
    #[should_panic]
    fn double_deallocate_panics() {
        let pool = pool(Tracking::Ordered);

        let ptr = pool.allocate().unwrap();

        unsafe {
            pool.deallocate(ptr);
            pool.deallocate(ptr);
        }
    }

    #[test]
    fn drop_with_allocated_slots_is_allowed_by_default() {
        let pool = pool(Tracking::Ordered);

        _ = pool.allocate().unwrap();

        drop(pool);
    }

    #[test]
    fn drop_with_allocated_slots_panics_if_forbidden() {
        let pool = RawPool::builder()
            .layout(Layout::new::<u64>())
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        _ = pool.allocate().unwrap();

        let result = catch_unwind(AssertUnwindSafe(move || drop(pool)));
        assert!(result.is_err());
    }

    #[test]
    fn drop_remaining_visits_every_allocated_slot() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPPED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn count(_ptr: NonNull<u8>) {
            DROPPED.fetch_add(1, Ordering::Relaxed);
        }

        let mut pool = RawPool::builder()
            .layout(Layout::new::<u64>())
            .block_capacity(nz!(4))
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        let pointers = (0..6).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();
        unsafe { pool.deallocate(pointers[1]) };

        unsafe { pool.drop_remaining(count) };

        assert_eq!(DROPPED.load(Ordering::Relaxed), 5);
        assert!(pool.is_empty());

        // Would panic if the pool still believed it had allocated slots.
        drop(pool);
    }
}
