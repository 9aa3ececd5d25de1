use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::{Pool, RawPool};

/// Destructs the `T` at `ptr` in place.
///
/// # Safety
///
/// `ptr` must point to an initialized `T` that is not used afterwards.
pub(crate) unsafe fn drop_in_place_erased<T>(ptr: NonNull<u8>) {
    // SAFETY: Forwarding guarantees from the caller.
    unsafe {
        ptr.cast::<T>().drop_in_place();
    }
}

/// An owning handle to an object in a [`Pool`].
///
/// The handle exclusively owns its object: when the handle is dropped or
/// [`reset()`](Self::reset), the object is destructed and its slot returned to the pool, exactly
/// once. Handles can be moved but not copied. A handle may also be empty, in which case dropping
/// it does nothing.
///
/// The handle can be [mapped](Self::map) to a related type, such as a trait object, while still
/// destructing the original concrete type when the time comes.
///
/// # Examples
///
/// ```
/// use fixed_pool::{Pool, Pooled};
///
/// let pool = Pool::<String>::builder().build();
///
/// let mut greeting = pool.create("Hello".to_string()).unwrap();
/// greeting.push_str(", world");
/// assert_eq!(*greeting, "Hello, world");
///
/// // Ownership can be moved out, leaving an empty handle behind.
/// let moved = greeting.take();
/// assert!(greeting.is_empty());
/// assert_eq!(pool.allocated_count(), 1);
///
/// drop(moved);
/// assert_eq!(pool.allocated_count(), 0);
/// ```
///
/// # Thread safety
///
/// The handle is [`Send`] if `T` is [`Send`] and [`Sync`] if `T` is [`Sync`]. Only handles
/// of [`Send`] objects can be [mapped](Self::map), so a mapped handle never carries a
/// destructor that must run on the thread that created the object.
#[must_use]
pub struct Pooled<'p, T: ?Sized> {
    inner: Option<Live<'p, T>>,

    _owns: PhantomData<T>,
}

struct Live<'p, T: ?Sized> {
    pool: &'p RawPool,

    /// The object as seen through this handle's type.
    value: NonNull<T>,

    /// Start of the object as allocated, which is where the pool expects it back.
    slot: NonNull<u8>,

    /// Destructor of the type originally placed in the slot.
    drop_fn: unsafe fn(NonNull<u8>),

    /// Whether `value` is a view produced by `map()` rather than the object as created.
    mapped: bool,
}

impl<'p, T> Pooled<'p, T> {
    /// # Safety
    ///
    /// `value` must point to an initialized `T` in a slot allocated from `pool`, with no other
    /// owner.
    pub(crate) unsafe fn new(pool: &'p RawPool, value: NonNull<T>) -> Self {
        Self {
            inner: Some(Live {
                pool,
                value,
                slot: value.cast(),
                drop_fn: drop_in_place_erased::<T>,
                mapped: false,
            }),
            _owns: PhantomData,
        }
    }

    /// Releases ownership of the object without destructing it, returning a pointer to it.
    ///
    /// The object stays allocated. Destroy it via [`Pool::destroy()`] or take ownership back via
    /// [`from_raw()`](Self::from_raw). Returns `None` if the handle is empty.
    ///
    /// # Panics
    ///
    /// Panics if the handle was produced by [`map()`](Self::map). Its pointer is a view into the
    /// object rather than the object as created, so it could never be handed back to the pool.
    /// The handle is dropped as usual while unwinding.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::Pool;
    ///
    /// let pool = Pool::<u64>::builder().build();
    ///
    /// let ptr = pool.create(5).unwrap().into_raw().unwrap();
    /// assert_eq!(pool.allocated_count(), 1);
    ///
    /// // SAFETY: The pointer came from this pool and is not used after this.
    /// unsafe { pool.destroy(ptr) };
    /// assert_eq!(pool.allocated_count(), 0);
    /// ```
    #[must_use]
    pub fn into_raw(mut self) -> Option<NonNull<T>> {
        assert!(
            !self.inner.as_ref().is_some_and(|live| live.mapped),
            "a mapped Pooled handle cannot be converted into a raw pointer"
        );

        self.inner.take().map(|live| live.value)
    }

    /// Takes ownership of an object previously released via [`into_raw()`](Self::into_raw).
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by `into_raw()` on a handle of an object in `pool`, and
    /// ownership must not have been taken back already.
    pub unsafe fn from_raw(pool: &'p Pool<T>, ptr: NonNull<T>) -> Self {
        // SAFETY: Forwarding guarantees from the caller.
        unsafe { Self::new(pool.raw(), ptr) }
    }
}

impl<'p, T: ?Sized> Pooled<'p, T> {
    /// Whether the handle is empty, owning no object.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.is_none()
    }

    /// Moves the ownership of the object into a new handle, leaving this one empty.
    #[inline]
    pub fn take(&mut self) -> Self {
        mem::take(self)
    }

    /// Destructs the object and returns its slot to the pool, leaving the handle empty.
    ///
    /// Does nothing if the handle is already empty. The slot is returned to the pool even if the
    /// destructor panics.
    pub fn reset(&mut self) {
        // Emptying the handle first ensures a second reset (including the one from drop) is a
        // no-op, whatever happens below.
        let Some(live) = self.inner.take() else {
            return;
        };

        let live = scopeguard::guard(live, |live| {
            // SAFETY: The slot was allocated from this pool and the handle owned it. Nobody
            // can reach it after this.
            unsafe { live.pool.deallocate(live.slot) };
        });

        // SAFETY: The handle owned the object, which has the type `drop_fn` was created for.
        unsafe {
            (live.drop_fn)(live.slot);
        }
    }

    /// Converts the handle into a handle of a related type, for example a trait object or one
    /// of the object's fields.
    ///
    /// When the new handle is dropped, the object originally created in the pool is destructed,
    /// whatever the type of the new handle. An empty handle maps to an empty handle.
    ///
    /// Only handles of [`Send`] objects can be mapped. Otherwise a mapped view of a [`Send`] type
    /// (say, a `String` field next to an `Rc`) could carry the object's destructor to another
    /// thread.
    ///
    /// ```compile_fail
    /// use std::rc::Rc;
    ///
    /// use fixed_pool::Pool;
    ///
    /// let pool = Pool::<(Rc<u32>, String)>::builder().build();
    /// let pair = pool.create((Rc::new(1), "name".to_string())).unwrap();
    ///
    /// let name = pair.map(|pair| &mut pair.1);
    /// ```
    ///
    /// # Examples
    ///
    /// ```
    /// use std::fmt::Display;
    ///
    /// use fixed_pool::{Pool, Pooled};
    ///
    /// let pool = Pool::<u32>::builder().build();
    ///
    /// let number = pool.create(42).unwrap();
    /// let display: Pooled<'_, dyn Display> = number.map(|n| n as &mut dyn Display);
    ///
    /// assert_eq!(display.to_string(), "42");
    /// ```
    pub fn map<U: ?Sized>(mut self, f: impl FnOnce(&mut T) -> &mut U) -> Pooled<'p, U>
    where
        T: Send,
    {
        let Some(live) = self.inner.as_mut() else {
            return Pooled::default();
        };

        // If `f` panics, `self` is still intact and destructs the object as usual.
        // SAFETY: The handle exclusively owns the object.
        let value = NonNull::from(f(unsafe { live.value.as_mut() }));

        let (pool, slot, drop_fn) = (live.pool, live.slot, live.drop_fn);

        // Ownership moves to the new handle, so this one must not destruct anything.
        self.inner = None;

        Pooled {
            inner: Some(Live {
                pool,
                value,
                slot,
                drop_fn,
                mapped: true,
            }),
            _owns: PhantomData,
        }
    }

    /// A shared reference to the object, or `None` if the handle is empty.
    #[must_use]
    #[inline]
    pub fn get(&self) -> Option<&T> {
        // SAFETY: The handle exclusively owns the object and the borrow is tied to the handle.
        self.inner.as_ref().map(|live| unsafe { live.value.as_ref() })
    }

    /// An exclusive reference to the object, or `None` if the handle is empty.
    #[must_use]
    #[inline]
    pub fn get_mut(&mut self) -> Option<&mut T> {
        // SAFETY: The handle exclusively owns the object and the borrow is tied to the handle.
        self.inner
            .as_mut()
            .map(|live| unsafe { live.value.as_mut() })
    }

    /// A pointer to the object, or `None` if the handle is empty.
    ///
    /// The pointer is valid for as long as the handle owns the object.
    #[must_use]
    #[inline]
    pub fn as_ptr(&self) -> Option<NonNull<T>> {
        self.inner.as_ref().map(|live| live.value)
    }
}

impl<T: ?Sized> Default for Pooled<'_, T> {
    /// An empty handle.
    #[inline]
    fn default() -> Self {
        Self {
            inner: None,
            _owns: PhantomData,
        }
    }
}

impl<T: ?Sized> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        self.reset();
    }
}

impl<T: ?Sized> Deref for Pooled<'_, T> {
    type Target = T;

    /// # Panics
    ///
    /// Panics if the handle is empty.
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.get().expect("dereferenced an empty Pooled handle")
    }
}

impl<T: ?Sized> DerefMut for Pooled<'_, T> {
    /// # Panics
    ///
    /// Panics if the handle is empty.
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.get_mut().expect("dereferenced an empty Pooled handle")
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Pooled<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some(value) => f.debug_tuple("Pooled").field(&value).finish(),
            None => f.write_str("Pooled(<empty>)"),
        }
    }
}

// SAFETY: The handle owns a T, so it may move to another thread whenever T may. If the handle
// was mapped, the object it destructs is also Send because map() requires it. The shared pool
// reference is fine to move because the pool is Sync.
unsafe impl<T: ?Sized + Send> Send for Pooled<'_, T> {}

// SAFETY: Shared access to the handle only gives shared access to the T.
unsafe impl<T: ?Sized + Sync> Sync for Pooled<'_, T> {}

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
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(Pooled<'static, u32>: Send, Sync, Default);
    assert_impl_all!(Pooled<'static, Cell<u32>>: Send);
    assert_not_impl_any!(Pooled<'static, Cell<u32>>: Sync);
    assert_not_impl_any!(Pooled<'static, Rc<u32>>: Send, Sync);
    assert_not_impl_any!(Pooled<'static, u32>: Clone, Copy);
    assert_not_impl_any!(Pooled<'static, (Rc<u32>, String)>: Send, Sync);

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    trait Speak {
        fn speak(&self) -> String;
    }

    struct Dog {
        name: String,
        drops: Arc<AtomicUsize>,
    }

    impl Speak for Dog {
        fn speak(&self) -> String {
            format!("{} says woof", self.name)
        }
    }

    impl Drop for Dog {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn default_handle_is_empty() {
        let mut handle = Pooled::<u32>::default();

        assert!(handle.is_empty());
        assert!(handle.get().is_none());
        assert!(handle.get_mut().is_none());
        assert!(handle.as_ptr().is_none());

        handle.reset();
        assert!(handle.into_raw().is_none());
    }

    #[test]
    #[should_panic]
    fn deref_of_empty_handle_panics() {
        let handle = Pooled::<u32>::default();
        assert_eq!(*handle, 0);
    }

    #[test]
    fn reset_is_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<DropCounter>::builder().build();

        let mut handle = pool.create(DropCounter(Arc::clone(&drops))).unwrap();

        handle.reset();
        handle.reset();
        drop(handle);

        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert_eq!(pool.allocated_count(), 0);
    }

    #[test]
    fn take_transfers_ownership() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<DropCounter>::builder().build();

        let mut source = pool.create(DropCounter(Arc::clone(&drops))).unwrap();
        let target = source.take();

        assert!(source.is_empty());
        assert!(!target.is_empty());

        drop(source);
        assert_eq!(drops.load(Ordering::Relaxed), 0);

        drop(target);
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn map_to_trait_object_keeps_original_destructor() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<Dog>::builder().build();

        let dog = pool
            .create(Dog {
                name: "Rex".to_string(),
                drops: Arc::clone(&drops),
            })
            .unwrap();

        let speaker: Pooled<'_, dyn Speak> = dog.map(|dog| dog as &mut dyn Speak);
        assert_eq!(speaker.speak(), "Rex says woof");
        assert_eq!(pool.allocated_count(), 1);

        drop(speaker);

        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn map_to_field_keeps_original_destructor() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<Dog>::builder().build();

        let dog = pool
            .create(Dog {
                name: "Fido".to_string(),
                drops: Arc::clone(&drops),
            })
            .unwrap();

        let mut name = dog.map(|dog| &mut dog.name);
        name.push('!');
        assert_eq!(*name, "Fido!");

        drop(name);

        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn map_of_empty_handle_is_empty() {
        let handle = Pooled::<u32>::default();
        let mapped: Pooled<'_, dyn fmt::Debug> = handle.map(|n| n as &mut dyn fmt::Debug);

        assert!(mapped.is_empty());
    }

    #[test]
    fn panicking_map_still_releases() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<DropCounter>::builder().build();

        let handle = pool.create(DropCounter(Arc::clone(&drops))).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| {
            handle.map::<u8>(|_| panic!("mapping failed"))
        }));

        assert!(result.is_err());
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn panicking_destructor_still_releases() {
        struct Explosive;

        impl Drop for Explosive {
            fn drop(&mut self) {
                panic!("boom");
            }
        }

        let pool = Pool::<Explosive>::builder().build();
        let mut handle = pool.create(Explosive).unwrap();

        let result = catch_unwind(AssertUnwindSafe(|| handle.reset()));

        assert!(result.is_err());
        assert!(handle.is_empty());
        assert!(pool.is_empty());
    }

    #[test]
    fn raw_round_trip() {
        let pool = Pool::<String>::builder().build();

        let ptr = pool.create("raw".to_string()).unwrap().into_raw().unwrap();
        assert_eq!(pool.allocated_count(), 1);

        let handle = unsafe { Pooled::from_raw(&pool, ptr) };
        assert_eq!(*handle, "raw");

        drop(handle);
        assert!(pool.is_empty());
    }

    #[test]
    fn mapped_handle_of_send_object_moves_between_threads() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<Dog>::builder().build();

        let dog = pool
            .create(Dog {
                name: "Laika".to_string(),
                drops: Arc::clone(&drops),
            })
            .unwrap();

        let name = dog.map(|dog| &mut dog.name);

        thread::scope(|s| {
            s.spawn(move || {
                assert_eq!(*name, "Laika");
                drop(name);
            });
        });

        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn into_raw_of_mapped_handle_panics_and_releases() {
        let drops = Arc::new(AtomicUsize::new(0));
        let pool = Pool::<Dog>::builder().build();

        let dog = pool
            .create(Dog {
                name: "Rover".to_string(),
                drops: Arc::clone(&drops),
            })
            .unwrap();

        let name = dog.map(|dog| &mut dog.name);

        let result = catch_unwind(AssertUnwindSafe(|| name.into_raw()));

        assert!(result.is_err());
        assert_eq!(drops.load(Ordering::Relaxed), 1);
        assert!(pool.is_empty());
    }

    #[test]
    fn debug_output() {
        let pool = Pool::<u32>::builder().build();

        let handle = pool.create(7).unwrap();
        assert_eq!(format!("{handle:?}"), "Pooled(7)");

        assert_eq!(format!("{:?}", Pooled::<u32>::default()), "Pooled(<empty>)");
    }
}
