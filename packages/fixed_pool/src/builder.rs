use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;
use std::sync::Arc;

use new_zealand::nz;

use crate::{BlockProvider, DropPolicy, Pool, RawPool, SystemProvider, Tracking};

/// Number of slots in each block unless configured otherwise.
#[cfg(not(miri))]
pub const DEFAULT_BLOCK_CAPACITY: NonZero<u32> = nz!(256);

// Under Miri, we use a smaller block capacity because Miri test runtime scales by memory usage.
#[cfg(miri)]
pub const DEFAULT_BLOCK_CAPACITY: NonZero<u32> = nz!(16);

/// Number of blocks a pool may create unless configured otherwise.
pub const DEFAULT_MAX_BLOCKS: NonZero<u32> = nz!(4096);

/// Highest block limit a pool accepts. The block table is allocated up front, so this bounds
/// its size to 8 MiB on 64-bit platforms.
pub const MAX_BLOCKS_LIMIT: NonZero<u32> = nz!(1_048_576);

/// Alignment of objects in pools configured by object size alone, matching what `malloc`
/// guarantees on common 64-bit platforms.
pub const DEFAULT_OBJECT_ALIGN: usize = 16;

/// Settings shared by all pool builders.
#[derive(Clone, Debug)]
pub(crate) struct PoolConfig {
    pub(crate) block_capacity: NonZero<u32>,
    pub(crate) max_blocks: NonZero<u32>,
    pub(crate) tracking: Tracking,
    pub(crate) drop_policy: DropPolicy,
    pub(crate) provider: Arc<dyn BlockProvider>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CAPACITY,
            max_blocks: DEFAULT_MAX_BLOCKS,
            tracking: Tracking::default(),
            drop_policy: DropPolicy::default(),
            provider: Arc::new(SystemProvider),
        }
    }
}

/// Builder for creating an instance of [`Pool<T>`].
///
/// All settings are optional.
///
/// # Examples
///
/// ```
/// use fixed_pool::{Pool, Tracking};
/// use new_zealand::nz;
///
/// let pool = Pool::<String>::builder()
///     .block_capacity(nz!(64))
///     .max_blocks(nz!(2))
///     .tracking(Tracking::Unordered)
///     .build();
///
/// assert_eq!(pool.pool_size(), 64);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct PoolBuilder<T> {
    config: PoolConfig,

    _item: PhantomData<fn() -> T>,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> PoolBuilder<T> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            _item: PhantomData,
            _not_sync: PhantomData,
        }
    }

    /// Sets the number of objects in each block. The pool grows one block at a time.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is `u32::MAX`, which is reserved.
    #[inline]
    pub fn block_capacity(mut self, block_capacity: NonZero<u32>) -> Self {
        assert!(
            block_capacity.get() < u32::MAX,
            "block capacity must be less than u32::MAX"
        );
        self.config.block_capacity = block_capacity;
        self
    }

    /// Sets the maximum number of blocks the pool may create. Use `nz!(1)` for a pool that
    /// never grows beyond its first block.
    ///
    /// The pool reserves one pointer-sized block table entry per possible block when it is
    /// built, whether or not the blocks are ever created.
    ///
    /// # Panics
    ///
    /// Panics if the limit exceeds [`MAX_BLOCKS_LIMIT`].
    #[inline]
    pub fn max_blocks(mut self, max_blocks: NonZero<u32>) -> Self {
        assert!(
            max_blocks <= MAX_BLOCKS_LIMIT,
            "max blocks must not exceed {MAX_BLOCKS_LIMIT}, got {max_blocks}"
        );
        self.config.max_blocks = max_blocks;
        self
    }

    /// Sets how the pool tracks its free and occupied slots.
    #[inline]
    pub fn tracking(mut self, tracking: Tracking) -> Self {
        self.config.tracking = tracking;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs how
    /// to treat remaining objects in the pool when the pool is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::{DropPolicy, Pool};
    ///
    /// let pool = Pool::<u32>::builder()
    ///     .drop_policy(DropPolicy::MustNotDropItems)
    ///     .build();
    /// ```
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.config.drop_policy = policy;
        self
    }

    /// Sets the provider the pool obtains its memory blocks from.
    ///
    /// # Examples
    ///
    /// ```
    /// use fixed_pool::{FnProvider, Pool};
    ///
    /// let pool = Pool::<u64>::builder().provider(FnProvider::libc()).build();
    ///
    /// let item = pool.create(7).unwrap();
    /// assert_eq!(*item, 7);
    /// ```
    #[inline]
    pub fn provider(mut self, provider: impl BlockProvider + 'static) -> Self {
        self.config.provider = Arc::new(provider);
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[must_use]
    #[inline]
    pub fn build(self) -> Pool<T> {
        Pool::new_inner(self.config)
    }
}

/// Builder for creating an instance of [`RawPool`].
///
/// [`RawPool`] requires the object memory layout to be specified at construction time.
/// Use `.layout()` to provide a specific layout, `.layout_of::<T>()` to generate
/// a layout based on the provided type or `.object_size()` to use a size with the default
/// alignment of [`DEFAULT_OBJECT_ALIGN`].
///
/// The layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use fixed_pool::RawPool;
/// use new_zealand::nz;
///
/// let pool = RawPool::builder()
///     .layout(Layout::new::<[u32; 4]>())
///     .block_capacity(nz!(16))
///     .build();
///
/// assert_eq!(pool.pool_size(), 16);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[derive(Debug)]
#[must_use]
pub struct RawPoolBuilder {
    object_layout: Option<Layout>,
    config: PoolConfig,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl RawPoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            object_layout: None,
            config: PoolConfig::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the memory layout of the objects stored in the pool.
    ///
    /// # Panics
    ///
    /// Panics if the layout has zero size.
    #[inline]
    pub fn layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "pool must have non-zero object size");
        self.object_layout = Some(layout);
        self
    }

    /// Sets the memory layout of the objects stored in the pool based on a type.
    ///
    /// # Panics
    ///
    /// Panics if `T` is a zero-sized type.
    #[inline]
    pub fn layout_of<T>(self) -> Self {
        self.layout(Layout::new::<T>())
    }

    /// Sets the size of the objects stored in the pool, aligned to [`DEFAULT_OBJECT_ALIGN`].
    ///
    /// # Panics
    ///
    /// Panics if the size is zero or too large to form a valid layout.
    #[inline]
    pub fn object_size(self, size: usize) -> Self {
        let layout = Layout::from_size_align(size, DEFAULT_OBJECT_ALIGN)
            .expect("object size must not overflow isize when rounded up to the alignment");

        self.layout(layout)
    }

    /// Sets the number of objects in each block. The pool grows one block at a time.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is `u32::MAX`, which is reserved.
    #[inline]
    pub fn block_capacity(mut self, block_capacity: NonZero<u32>) -> Self {
        assert!(
            block_capacity.get() < u32::MAX,
            "block capacity must be less than u32::MAX"
        );
        self.config.block_capacity = block_capacity;
        self
    }

    /// Sets the maximum number of blocks the pool may create. Use `nz!(1)` for a pool that
    /// never grows beyond its first block.
    ///
    /// The pool reserves one pointer-sized block table entry per possible block when it is
    /// built, whether or not the blocks are ever created.
    ///
    /// # Panics
    ///
    /// Panics if the limit exceeds [`MAX_BLOCKS_LIMIT`].
    #[inline]
    pub fn max_blocks(mut self, max_blocks: NonZero<u32>) -> Self {
        assert!(
            max_blocks <= MAX_BLOCKS_LIMIT,
            "max blocks must not exceed {MAX_BLOCKS_LIMIT}, got {max_blocks}"
        );
        self.config.max_blocks = max_blocks;
        self
    }

    /// Sets how the pool tracks its free and occupied slots.
    #[inline]
    pub fn tracking(mut self, tracking: Tracking) -> Self {
        self.config.tracking = tracking;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. A raw pool cannot destruct the
    /// objects in its slots, so with [`DropPolicy::MayDropItems`] any remaining objects are
    /// leaked when the pool is dropped (their memory is still released).
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.config.drop_policy = policy;
        self
    }

    /// Sets the provider the pool obtains its memory blocks from.
    #[inline]
    pub fn provider(mut self, provider: impl BlockProvider + 'static) -> Self {
        self.config.provider = Arc::new(provider);
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no layout has been set using [`layout`](Self::layout),
    /// [`layout_of`](Self::layout_of) or [`object_size`](Self::object_size).
    #[must_use]
    #[inline]
    pub fn build(self) -> RawPool {
        let layout = self.object_layout.expect(
            "layout must be set using .layout(), .layout_of::<T>() or .object_size() before calling .build()",
        );

        RawPool::new_inner(layout, self.config)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::FnProvider;

    assert_impl_all!(PoolBuilder<String>: Send, fmt::Debug);
    assert_not_impl_any!(PoolBuilder<String>: Sync);
    assert_impl_all!(RawPoolBuilder: Send, fmt::Debug);
    assert_not_impl_any!(RawPoolBuilder: Sync);

    #[test]
    fn defaults() {
        let builder = PoolBuilder::<u64>::new();

        assert_eq!(builder.config.block_capacity, DEFAULT_BLOCK_CAPACITY);
        assert_eq!(builder.config.max_blocks, DEFAULT_MAX_BLOCKS);
        assert_eq!(builder.config.tracking, Tracking::Ordered);
        assert_eq!(builder.config.drop_policy, DropPolicy::MayDropItems);
    }

    #[test]
    fn settings_reach_the_pool() {
        let pool = PoolBuilder::<u64>::new()
            .block_capacity(nz!(8))
            .max_blocks(nz!(3))
            .tracking(Tracking::Unordered)
            .drop_policy(DropPolicy::MustNotDropItems)
            .provider(FnProvider::libc())
            .build();

        assert_eq!(pool.pool_size(), 8);
        assert_eq!(pool.max_blocks(), 3);
        assert_eq!(pool.tracking(), Tracking::Unordered);
        assert_eq!(pool.drop_policy(), DropPolicy::MustNotDropItems);
    }

    #[test]
    fn object_size_uses_default_alignment() {
        let builder = RawPoolBuilder::new().object_size(20);

        assert_eq!(
            builder.object_layout,
            Some(Layout::from_size_align(20, DEFAULT_OBJECT_ALIGN).unwrap())
        );
    }

    #[test]
    fn layout_of_sets_layout() {
        let builder = RawPoolBuilder::new().layout_of::<String>();

        assert_eq!(builder.object_layout, Some(Layout::new::<String>()));
    }

    #[test]
    #[should_panic]
    fn raw_build_without_layout_panics() {
        drop(RawPoolBuilder::new().build());
    }

    #[test]
    #[should_panic]
    fn zero_object_size_panics() {
        drop(RawPoolBuilder::new().object_size(0));
    }

    #[test]
    #[should_panic]
    fn zero_sized_type_panics() {
        drop(PoolBuilder::<()>::new().build());
    }

    #[test]
    #[should_panic]
    fn reserved_block_capacity_panics() {
        drop(PoolBuilder::<u64>::new().block_capacity(NonZero::new(u32::MAX).unwrap()));
    }

    #[test]
    #[should_panic]
    fn reserved_max_blocks_panics() {
        drop(RawPoolBuilder::new().max_blocks(NonZero::new(u32::MAX).unwrap()));
    }

    #[test]
    #[should_panic(expected = "max blocks must not exceed")]
    fn max_blocks_above_limit_panics() {
        drop(PoolBuilder::<u64>::new().max_blocks(nz!(1_000_000_000)));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri is slow to allocate a table this large.
    fn max_blocks_at_limit_is_accepted() {
        let pool = PoolBuilder::<u64>::new().max_blocks(MAX_BLOCKS_LIMIT).build();

        assert_eq!(pool.max_blocks(), MAX_BLOCKS_LIMIT.get() as usize);
    }
}
