use std::alloc::Layout;
use std::{any, fmt};
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::ptr::NonNull;

use scopeguard::ScopeGuard;

use crate::error::Result;
use crate::{
    CreateError, DropPolicy, PoolBuilder, PoolConfig, Pooled, RawIter, RawPool, SlotAddress,
    Tracking, drop_in_place_erased,
};

/// A thread-safe pool of objects of type `T`, allocated from fixed-size slots in preallocated
/// memory blocks.
///
/// Objects are created in place in a free slot and destructed in place when their [`Pooled`]
/// handle is dropped, after which the slot is reused for the next object. Objects never move:
/// the pool grows by appending blocks, never by relocating existing ones.
///
/// # Examples
///
/// ```
/// use fixed_pool::Pool;
///
/// let pool = Pool::<String>::builder().build();
///
/// let first = pool.create("first".to_string()).unwrap();
/// let second = pool.create_with(|| "second".to_string()).unwrap();
///
/// assert_eq!(*first, "first");
/// assert_eq!(*second, "second");
/// assert_eq!(pool.allocated_count(), 2);
///
/// drop(first);
/// assert_eq!(pool.allocated_count(), 1);
/// ```
///
/// # Thread safety
///
/// The pool is [`Send`] and [`Sync`] if `T` is [`Send`]. Objects may be created and destroyed
/// concurrently from any number of threads. Choose [`Tracking::Unordered`] for pools under
/// heavy concurrent use.
pub struct Pool<T> {
    raw: RawPool,

    _items: PhantomData<T>,
}

impl<T> Pool<T> {
    /// Creates a builder for configuring and constructing a [`Pool<T>`].
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::Pool;
    ///
    /// let pool = Pool::<u64>::builder().build();
    ///
    /// assert!(pool.is_empty());
    /// ```
    #[inline]
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }

    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[must_use]
    pub(crate) fn new_inner(config: PoolConfig) -> Self {
        Self {
            raw: RawPool::new_inner(Layout::new::<T>(), config),
            _items: PhantomData,
        }
    }

    pub(crate) fn raw(&self) -> &RawPool {
        &self.raw
    }

    /// Moves `value` into a free slot of the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`][crate::Error::Exhausted] if the pool needs to grow but
    /// cannot. The value is dropped.
    pub fn create(&self, value: T) -> Result<Pooled<'_, T>> {
        self.create_with(|| value)
    }

    /// Creates an object in a free slot of the pool using the value returned by `f`.
    ///
    /// The slot is reserved before `f` is called. If `f` panics, the slot is released before
    /// the panic continues.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`][crate::Error::Exhausted] if the pool needs to grow but
    /// cannot. In this case, `f` is not called.
    pub fn create_with(&self, f: impl FnOnce() -> T) -> Result<Pooled<'_, T>> {
        let slot = self.raw.allocate()?;

        let slot_guard = scopeguard::guard(slot, |slot| {
            // SAFETY: The slot was allocated above and nothing has been written to it.
            unsafe { self.raw.deallocate(slot) };
        });

        let value = f();

        let ptr = ScopeGuard::into_inner(slot_guard).cast::<T>();

        // SAFETY: The slot is sized and aligned for a T and we own it.
        unsafe {
            ptr.write(value);
        }

        // SAFETY: We just initialized the object in a slot of this pool.
        Ok(unsafe { Pooled::new(&self.raw, ptr) })
    }

    /// Creates an object in a free slot of the pool using the value returned by `f`, which may
    /// fail.
    ///
    /// If `f` fails (or panics), the slot is released before returning.
    ///
    /// # Errors
    ///
    /// Returns [`CreateError::Pool`] if the pool needs to grow but cannot, in which case `f` is
    /// not called. Returns [`CreateError::Constructor`] with the error from `f` if it fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::{CreateError, Pool};
    ///
    /// let pool = Pool::<u16>::builder().build();
    ///
    /// let parsed = pool.try_create_with(|| "1234".parse::<u16>()).unwrap();
    /// assert_eq!(*parsed, 1234);
    ///
    /// let failed = pool.try_create_with(|| "nope".parse::<u16>());
    /// assert!(matches!(failed, Err(CreateError::Constructor(_))));
    ///
    /// assert_eq!(pool.allocated_count(), 1);
    /// ```
    pub fn try_create_with<E>(
        &self,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<Pooled<'_, T>, CreateError<E>> {
        let slot = self.raw.allocate()?;

        let slot_guard = scopeguard::guard(slot, |slot| {
            // SAFETY: The slot was allocated above and nothing has been written to it.
            unsafe { self.raw.deallocate(slot) };
        });

        // On failure, the guard releases the slot as we return.
        let value = f().map_err(CreateError::Constructor)?;

        let ptr = ScopeGuard::into_inner(slot_guard).cast::<T>();

        // SAFETY: The slot is sized and aligned for a T and we own it.
        unsafe {
            ptr.write(value);
        }

        // SAFETY: We just initialized the object in a slot of this pool.
        Ok(unsafe { Pooled::new(&self.raw, ptr) })
    }

    /// Moves `value` into a free slot of the pool, panicking if the pool is exhausted.
    ///
    /// # Panics
    ///
    /// Panics if the pool needs to grow but cannot.
    #[inline]
    pub fn create_or_panic(&self, value: T) -> Pooled<'_, T> {
        self.create(value)
            .unwrap_or_else(|error| panic!("resource exhausted: {error}"))
    }

    /// Destructs an object released via [`Pooled::into_raw()`] and returns its slot to the pool.
    ///
    /// The slot is returned to the pool even if the destructor panics.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not currently allocated.
    ///
    /// In debug builds, panics if the pointer does not point to an object slot of this pool.
    ///
    /// # Safety
    ///
    /// The caller must ensure that `ptr` was obtained from a handle of this pool via
    /// [`Pooled::into_raw()`] and that neither the pointer nor any copy of it is used after this
    /// call. In release builds, passing any other pointer is undefined behavior.
    pub unsafe fn destroy(&self, ptr: NonNull<T>) {
        let slot = ptr.cast::<u8>();

        let _slot_guard = scopeguard::guard(slot, |slot| {
            // SAFETY: Forwarding guarantees from the caller.
            unsafe { self.raw.deallocate(slot) };
        });

        // SAFETY: Forwarding guarantees from the caller, who owned the object.
        unsafe {
            drop_in_place_erased::<T>(slot);
        }
    }

    /// Number of objects in each block. The pool grows in increments of this many objects.
    #[must_use]
    #[inline]
    pub fn pool_size(&self) -> usize {
        self.raw.pool_size()
    }

    /// Number of objects currently in the pool.
    ///
    /// With [`Tracking::Unordered`], this is only approximate while other threads are
    /// concurrently creating or destroying objects.
    #[must_use]
    #[inline]
    pub fn allocated_count(&self) -> usize {
        self.raw.allocated_count()
    }

    /// Number of objects the pool can hold before it needs to grow again.
    #[must_use]
    #[inline]
    pub fn max_allocated_count(&self) -> usize {
        self.raw.max_allocated_count()
    }

    /// Whether the pool has no objects.
    ///
    /// An empty pool may still be holding memory blocks.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    /// Number of blocks created so far.
    #[must_use]
    #[inline]
    pub fn block_count(&self) -> usize {
        self.raw.block_count()
    }

    /// Number of blocks the pool may create before it reports exhaustion.
    #[must_use]
    #[inline]
    pub fn max_blocks(&self) -> usize {
        self.raw.max_blocks()
    }

    /// How the pool tracks its free and occupied slots.
    #[must_use]
    #[inline]
    pub fn tracking(&self) -> Tracking {
        self.raw.tracking()
    }

    /// What happens to remaining objects when the pool is dropped.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.raw.drop_policy()
    }

    /// Grows the pool so that at least `additional` more objects can be created without further
    /// growth. Does nothing if the capacity is already sufficient.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Exhausted`][crate::Error::Exhausted] if the required blocks cannot be
    /// created.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::Pool;
    /// use new_zealand::nz;
    ///
    /// let pool = Pool::<u64>::builder().block_capacity(nz!(8)).build();
    ///
    /// pool.reserve(20).unwrap();
    /// assert_eq!(pool.max_allocated_count(), 24);
    /// ```
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    #[inline]
    pub fn reserve(&self, additional: usize) -> Result<()> {
        self.raw.reserve(additional)
    }

    /// Finds the stable coordinates of the slot that holds the object at `ptr`.
    ///
    /// Returns `None` if the pointer does not point to an object slot of this pool. This scans
    /// the block table, so it takes time proportional to the number of blocks.
    #[must_use]
    pub fn locate(&self, ptr: NonNull<T>) -> Option<SlotAddress> {
        self.raw.locate(ptr.cast())
    }

    /// Enumerates the objects in the pool in ascending address order.
    ///
    /// The iterator yields pointers rather than references because the objects are owned by
    /// their handles. Dereferencing them is only valid while the owning handle is not being used
    /// to access the object.
    ///
    /// The iterator holds the pool's lock for as long as it exists. Creating or destroying
    /// objects or calling [`reserve()`](Self::reserve) on the same thread before dropping the
    /// iterator deadlocks, and other threads block in those calls until it is dropped. Read-only
    /// queries such as [`allocated_count()`](Self::allocated_count) do not take the lock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IterationUnsupported`][crate::Error::IterationUnsupported] if the pool
    /// uses [`Tracking::Unordered`].
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::Pool;
    ///
    /// let pool = Pool::<u32>::builder().build();
    ///
    /// let items = (0..5)
    ///     .map(|n| pool.create(n * 10).unwrap())
    ///     .collect::<Vec<_>>();
    ///
    /// let values = pool
    ///     .iter()
    ///     .unwrap()
    ///     // SAFETY: The handles are not in use while we read.
    ///     .map(|ptr| unsafe { ptr.read() })
    ///     .collect::<Vec<_>>();
    ///
    /// assert_eq!(values, vec![0, 10, 20, 30, 40]);
    /// # drop(items);
    /// ```
    pub fn iter(&self) -> Result<Iter<'_, T>> {
        Ok(Iter {
            raw: self.raw.iter()?,
            _items: PhantomData,
        })
    }
}

impl<T> Drop for Pool<T> {
    fn drop(&mut self) {
        if self.raw.drop_policy() == DropPolicy::MayDropItems {
            // SAFETY: Every allocated slot holds an initialized T (handles borrow the pool, so
            // none remain) except for objects released via into_raw(), which are ours to drop.
            unsafe {
                self.raw.drop_remaining(drop_in_place_erased::<T>);
            }
        }

        // With MustNotDropItems, the raw pool panics when it sees the remaining objects.
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("raw", &self.raw)
            .field("item_type", &any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

// SAFETY: Sharing the pool lets other threads create objects (moving a T into the pool) and
// destroy objects (dropping a T), which requires T: Send. Shared access never hands out a &T.
unsafe impl<T: Send> Sync for Pool<T> {}

/// Iterator over the objects of a [`Pool<T>`] in ascending address order.
///
/// Created by [`Pool::iter()`]. Holds the pool's lock until dropped.
pub struct Iter<'p, T> {
    raw: RawIter<'p>,

    _items: PhantomData<&'p T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = NonNull<T>;

    #[inline]
    fn next(&mut self) -> Option<Self::Item> {
        self.raw.next().map(NonNull::cast)
    }
}

impl<T> FusedIterator for Iter<'_, T> {}

impl<T> fmt::Debug for Iter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("raw", &self.raw)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::cell::Cell;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::rc::Rc;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Error;

    assert_impl_all!(Pool<u64>: Send, Sync, fmt::Debug);
    assert_impl_all!(Pool<Cell<u64>>: Send, Sync);
    assert_not_impl_any!(Pool<Rc<u64>>: Send, Sync);

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn create_round_trip() {
        let pool = Pool::<(u32, String)>::builder().build();

        let item = pool.create((7, "seven".to_string())).unwrap();

        assert_eq!(item.0, 7);
        assert_eq!(item.1, "seven");
    }

    #[test]
    fn create_with_panic_releases_slot() {
        let pool = Pool::<String>::builder().build();

        let result = catch_unwind(AssertUnwindSafe(|| {
            pool.create_with(|| panic!("constructor failed")).map(drop)
        }));

        assert!(result.is_err());
        assert!(pool.is_empty());
    }

    #[test]
    fn try_create_with_failure_releases_slot() {
        let pool = Pool::<u64>::builder().build();

        let result = pool.try_create_with(|| Err::<u64, _>("no"));

        assert!(matches!(result, Err(CreateError::Constructor("no"))));
        assert!(pool.is_empty());

        // The released slot is the first one reused.
        let item = pool.try_create_with(|| Ok::<_, ()>(9)).unwrap();
        let first = pool.iter().unwrap().next().unwrap();
        assert_eq!(Some(first), item.as_ptr());
    }

    #[test]
    fn try_create_with_reports_exhaustion() {
        let pool = Pool::<u64>::builder()
            .block_capacity(nz!(1))
            .max_blocks(nz!(1))
            .build();

        let _held = pool.create(1).unwrap();

        let result = pool.try_create_with(|| -> Result<u64, ()> {
            panic!("must not be called when the pool is exhausted")
        });

        assert!(matches!(
            result,
            Err(CreateError::Pool(Error::Exhausted { .. }))
        ));
    }

    #[test]
    fn create_or_panic_succeeds_with_room() {
        let pool = Pool::<u8>::builder().build();

        assert_eq!(*pool.create_or_panic(3), 3);
    }

    #[test]
    #[should_panic]
    fn create_or_panic_panics_when_exhausted() {
        let pool = Pool::<u8>::builder()
            .block_capacity(nz!(1))
            .max_blocks(nz!(1))
            .build();

        let _held = pool.create_or_panic(1);
        let _never = pool.create_or_panic(2);
    }

    #[test]
    fn destroy_drops_and_releases() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<DropCounter>::builder().build();

        let ptr = pool
            .create(DropCounter(Arc::clone(&drops)))
            .unwrap()
            .into_raw()
            .unwrap();

        assert_eq!(drops.load(Ordering::Relaxed), 0);

        unsafe { pool.destroy(ptr) };

        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn dropping_pool_drops_leaked_objects() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<DropCounter>::builder().block_capacity(nz!(2)).build();

        for _ in 0..5 {
            _ = pool
                .create(DropCounter(Arc::clone(&drops)))
                .unwrap()
                .into_raw();
        }

        drop(pool);

        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }

    #[test]
    fn dropping_non_empty_pool_panics_if_forbidden() {
        let pool = Pool::<u64>::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        _ = pool.create(1).unwrap().into_raw();

        let result = catch_unwind(AssertUnwindSafe(move || drop(pool)));
        assert!(result.is_err());
    }

    #[test]
    fn dropping_empty_pool_is_fine_if_forbidden() {
        let pool = Pool::<u64>::builder()
            .drop_policy(DropPolicy::MustNotDropItems)
            .build();

        drop(pool.create(1).unwrap());
        drop(pool);
    }

    #[test]
    fn iter_on_unordered_pool_is_unsupported() {
        let pool = Pool::<u64>::builder().tracking(Tracking::Unordered).build();

        let _item = pool.create(1).unwrap();

        assert!(matches!(pool.iter(), Err(Error::IterationUnsupported)));
    }

    #[test]
    fn capacity_queries() {
        let pool = Pool::<u64>::builder().block_capacity(nz!(4)).build();

        assert_eq!(pool.pool_size(), 4);
        assert_eq!(pool.max_allocated_count(), 0);

        let items = (0..5).map(|n| pool.create(n).unwrap()).collect::<Vec<_>>();

        assert_eq!(pool.allocated_count(), 5);
        assert_eq!(pool.block_count(), 2);
        assert_eq!(pool.max_allocated_count(), 8);
        assert!(pool.allocated_count() <= pool.max_allocated_count());

        drop(items);
        assert!(pool.is_empty());
        assert_eq!(pool.max_allocated_count(), 8);
    }

    #[test]
    fn error_classification() {
        let pool = Pool::<u64>::builder()
            .block_capacity(nz!(1))
            .max_blocks(nz!(1))
            .build();

        let _held = pool.create(1).unwrap();

        assert!(pool.create(2).unwrap_err().is_exhausted());
        assert!(!Error::IterationUnsupported.is_exhausted());
    }
}
