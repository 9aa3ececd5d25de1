use std::num::NonZero;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::{fmt, iter};

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::Result;
use crate::{BlockProvider, Error, SlotAddress, SlotHeader, SlotLayout};

/// Owns the memory blocks of a pool and converts between slot addresses and memory locations.
///
/// Blocks are append-only: once published, a block is never moved, shrunk or released until
/// the manager itself is dropped. This is what keeps every [`SlotAddress`] (and every pointer
/// derived from one) valid while the pool grows.
///
/// The block table is a fixed-length array of atomic pointers, so address lookups never take
/// a lock and may run concurrently with growth. Growth itself is serialized via
/// [`begin_growth()`](Self::begin_growth).
pub(crate) struct BlockManager {
    layout: SlotLayout,

    block_capacity: NonZero<u32>,

    /// One entry per block that may ever exist. Entries below `block_count` are non-null and
    /// never change again.
    blocks: Box<[AtomicPtr<u8>]>,

    /// Number of published blocks. Only increases.
    block_count: AtomicUsize,

    /// Serializes block creation. Holders of the guard are the only writers of `blocks` and
    /// `block_count`.
    growth: Mutex<()>,

    provider: Arc<dyn BlockProvider>,
}

impl BlockManager {
    #[must_use]
    pub(crate) fn new(
        layout: SlotLayout,
        block_capacity: NonZero<u32>,
        max_blocks: NonZero<u32>,
        provider: Arc<dyn BlockProvider>,
    ) -> Self {
        // The sentinel uses u32::MAX for both parts, so real coordinates must stay below it.
        assert!(
            max_blocks.get() < u32::MAX && block_capacity.get() < u32::MAX,
            "block limits must leave room for the sentinel address"
        );

        let blocks = iter::repeat_with(|| AtomicPtr::new(ptr::null_mut()))
            .take(max_blocks.get() as usize)
            .collect();

        Self {
            layout,
            block_capacity,
            blocks,
            block_count: AtomicUsize::new(0),
            growth: Mutex::new(()),
            provider,
        }
    }

    #[must_use]
    pub(crate) fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    #[must_use]
    pub(crate) fn block_capacity(&self) -> NonZero<u32> {
        self.block_capacity
    }

    #[must_use]
    pub(crate) fn max_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of blocks created so far.
    #[must_use]
    pub(crate) fn block_count(&self) -> usize {
        self.block_count.load(Ordering::Acquire)
    }

    /// Total number of slots in all blocks created so far.
    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        // Cannot overflow: that would imply the blocks are larger than virtual memory.
        self.block_count()
            .wrapping_mul(self.block_capacity.get() as usize)
    }

    /// Obtains exclusive permission to append blocks.
    ///
    /// Callers that race to grow the pool should re-check whether growth is still needed after
    /// this returns, to avoid appending a block for each racing thread.
    #[must_use]
    pub(crate) fn begin_growth(&self) -> Growth<'_> {
        Growth {
            manager: self,
            _guard: self.growth.lock(),
        }
    }

    /// Returns the header of the slot at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the address does not refer to a slot in a created block.
    #[must_use]
    pub(crate) fn header(&self, address: SlotAddress) -> &SlotHeader {
        // SAFETY: header_ptr() only returns pointers to initialized headers inside published
        // blocks, which live as long as `self`. Headers only mutate through interior mutability.
        unsafe { self.header_ptr(address).as_ref() }
    }

    /// Returns a pointer to the object memory of the slot at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the address does not refer to a slot in a created block.
    #[must_use]
    pub(crate) fn pointer_of(&self, address: SlotAddress) -> NonNull<u8> {
        // SAFETY: The object follows the header within the same slot, so the offset stays
        // inside the block allocation.
        unsafe {
            self.header_ptr(address)
                .cast::<u8>()
                .byte_add(self.layout.object_offset())
        }
    }

    /// Converts an object pointer previously returned by [`pointer_of()`](Self::pointer_of)
    /// back to its slot address.
    ///
    /// In debug builds, the pointer is verified to point at the start of an object slot in one
    /// of our blocks and a foreign pointer causes a panic.
    ///
    /// # Safety
    ///
    /// The caller must ensure the pointer was returned by `pointer_of()` on this manager. In
    /// release builds, passing any other pointer is undefined behavior.
    #[must_use]
    pub(crate) unsafe fn address_of(&self, object: NonNull<u8>) -> SlotAddress {
        #[cfg(debug_assertions)]
        let located = self.locate(object).unwrap_or_else(|| {
            panic!("pointer {object:p} does not point to an object slot of this pool")
        });

        // SAFETY: The caller guarantees the pointer came from pointer_of(), so stepping back
        // by the object offset lands on the header of the same slot.
        let header = unsafe {
            object
                .byte_sub(self.layout.object_offset())
                .cast::<SlotHeader>()
                .as_ref()
        };

        #[cfg(debug_assertions)]
        debug_assert_eq!(header.address(), located);

        header.address()
    }

    /// Finds the slot whose object starts at `object` by scanning the blocks.
    ///
    /// Returns `None` for pointers that are outside our blocks or not at a slot boundary.
    #[must_use]
    pub(crate) fn locate(&self, object: NonNull<u8>) -> Option<SlotAddress> {
        let target = object.as_ptr().addr();
        let block_size = self.layout.block_layout().size();

        (0..self.block_count()).find_map(|block_index| {
            let start = self.block_base(block_index).as_ptr().addr();
            let offset = target.checked_sub(start)?;

            if offset >= block_size {
                return None;
            }

            let within_slots = offset.checked_sub(self.layout.object_offset())?;

            #[expect(
                clippy::integer_division,
                clippy::modulo_arithmetic,
                reason = "stride is non-zero and we want the exact slot index"
            )]
            let (slot, remainder) = (
                within_slots / self.layout.stride(),
                within_slots % self.layout.stride(),
            );

            if remainder != 0 {
                return None;
            }

            Some(SlotAddress::new(
                u32::try_from(block_index).ok()?,
                u32::try_from(slot).ok()?,
            ))
        })
    }

    /// Every slot address of every created block, in ascending order.
    pub(crate) fn addresses(&self) -> impl Iterator<Item = SlotAddress> + '_ {
        let block_capacity = self.block_capacity.get();

        (0..self.block_count()).flat_map(move |block| {
            // Block indexes are bounded by max_blocks, which is a u32.
            #[expect(
                clippy::cast_possible_truncation,
                reason = "block indexes are bounded by a u32 limit"
            )]
            let block = block as u32;

            (0..block_capacity).map(move |slot| SlotAddress::new(block, slot))
        })
    }

    fn block_base(&self, block_index: usize) -> NonNull<u8> {
        let block = self
            .blocks
            .get(block_index)
            .unwrap_or_else(|| panic!("block {block_index} is beyond the block table"));

        // Acquire pairs with the Release in append_block(), making the headers written before
        // publication visible to us.
        NonNull::new(block.load(Ordering::Acquire))
            .unwrap_or_else(|| panic!("block {block_index} has not been created"))
    }

    fn header_ptr(&self, address: SlotAddress) -> NonNull<SlotHeader> {
        assert!(
            address.slot() < self.block_capacity.get(),
            "slot {address} is out of bounds in blocks of capacity {}",
            self.block_capacity
        );

        let base = self.block_base(address.block_index());

        // Guarded by the bounds check above. Cannot overflow because that would imply the block
        // extends beyond virtual memory.
        let offset = address.slot_index().wrapping_mul(self.layout.stride());

        // SAFETY: The offset is within the block allocation due to the bounds check.
        unsafe { base.byte_add(offset).cast::<SlotHeader>() }
    }
}

impl fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockManager")
            .field("layout", &self.layout)
            .field("block_capacity", &self.block_capacity)
            .field("max_blocks", &self.blocks.len())
            .field("block_count", &self.block_count())
            .field("provider", &self.provider)
            .finish_non_exhaustive()
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        let block_layout = self.layout.block_layout();
        let block_count = *self.block_count.get_mut();

        for block in self.blocks.iter().take(block_count) {
            let block = NonNull::new(block.load(Ordering::Relaxed))
                .expect("every block below block_count has been published");

            // SAFETY: The block was obtained from this provider with this layout and blocks
            // are released exactly once, here.
            unsafe {
                self.provider.deallocate(block, block_layout);
            }
        }
    }
}

/// Exclusive permission to append blocks to a [`BlockManager`].
pub(crate) struct Growth<'a> {
    manager: &'a BlockManager,
    _guard: MutexGuard<'a, ()>,
}

impl Growth<'_> {
    /// Allocates a new block, initializes the headers of all its slots and publishes it.
    ///
    /// Returns the index of the new block. Fails with [`Error::Exhausted`] if the block limit
    /// is reached or the provider cannot supply suitable memory.
    pub(crate) fn append_block(&self) -> Result<u32> {
        let manager = self.manager;
        let block_index = manager.block_count.load(Ordering::Relaxed);
        let block_layout = manager.layout.block_layout();

        if block_index >= manager.max_blocks() {
            warn!(
                block_count = block_index,
                max_blocks = manager.max_blocks(),
                "pool reached its block limit"
            );
            return Err(manager.exhausted());
        }

        let Some(base) = manager.provider.allocate(block_layout) else {
            warn!(
                block_count = block_index,
                bytes = block_layout.size(),
                "block provider could not supply memory"
            );
            return Err(manager.exhausted());
        };

        if base.as_ptr().addr() & block_layout.align().wrapping_sub(1) != 0 {
            // SAFETY: We just received this block from the provider with this layout.
            unsafe {
                manager.provider.deallocate(base, block_layout);
            }

            warn!(
                address = ?base,
                align = block_layout.align(),
                "block provider returned misaligned memory"
            );
            return Err(manager.exhausted());
        }

        #[expect(
            clippy::cast_possible_truncation,
            reason = "block_index is below max_blocks, which is a u32"
        )]
        let block = block_index as u32;

        for slot in 0..manager.block_capacity.get() {
            // Cannot overflow because the block allocation itself did not overflow.
            let offset = (slot as usize).wrapping_mul(manager.layout.stride());

            // SAFETY: The offset addresses a slot within the block we just allocated, and
            // the stride keeps every header aligned.
            unsafe {
                base.byte_add(offset)
                    .cast::<SlotHeader>()
                    .write(SlotHeader::new(SlotAddress::new(block, slot)));
            }
        }

        #[expect(
            clippy::indexing_slicing,
            reason = "we checked block_index against the table length above"
        )]
        manager.blocks[block_index].store(base.as_ptr(), Ordering::Release);

        // Cannot overflow because block_index < max_blocks.
        manager
            .block_count
            .store(block_index.wrapping_add(1), Ordering::Release);

        debug!(
            block,
            block_capacity = manager.block_capacity.get(),
            bytes = block_layout.size(),
            "appended pool block"
        );

        Ok(block)
    }
}

impl BlockManager {
    fn exhausted(&self) -> Error {
        Error::Exhausted {
            block_count: self.block_count(),
            block_capacity: self.block_capacity.get() as usize,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use std::alloc::Layout;
    use std::collections::HashSet;

    use new_zealand::nz;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::SystemProvider;

    assert_impl_all!(BlockManager: Send, Sync);

    fn manager_for<T>(block_capacity: NonZero<u32>, max_blocks: NonZero<u32>) -> BlockManager {
        BlockManager::new(
            SlotLayout::calculate(Layout::new::<T>(), block_capacity),
            block_capacity,
            max_blocks,
            Arc::new(SystemProvider),
        )
    }

    /// Hands out blocks that start one byte past a properly aligned allocation.
    #[derive(Debug, Default)]
    struct OffsetProvider {
        deallocations: AtomicUsize,
    }

    impl OffsetProvider {
        fn padded(layout: Layout) -> Layout {
            let size = layout.size().checked_add(layout.align()).unwrap();
            Layout::from_size_align(size, layout.align()).unwrap()
        }
    }

    impl BlockProvider for OffsetProvider {
        fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
            let base = SystemProvider.allocate(Self::padded(layout))?;

            Some(unsafe { base.byte_add(1) })
        }

        unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
            self.deallocations.fetch_add(1, Ordering::Relaxed);

            let base = unsafe { ptr.byte_sub(1) };

            unsafe {
                SystemProvider.deallocate(base, Self::padded(layout));
            }
        }
    }

    #[test]
    fn misaligned_block_is_returned_and_reported_as_exhaustion() {
        let provider = Arc::new(OffsetProvider::default());
        let shared: Arc<dyn BlockProvider> = Arc::<OffsetProvider>::clone(&provider);
        let block_capacity = nz!(4);

        let manager = BlockManager::new(
            SlotLayout::calculate(Layout::new::<u64>(), block_capacity),
            block_capacity,
            nz!(2),
            shared,
        );

        let result = manager.begin_growth().append_block();

        assert!(matches!(
            result,
            Err(Error::Exhausted {
                block_count: 0,
                block_capacity: 4
            })
        ));
        assert_eq!(provider.deallocations.load(Ordering::Relaxed), 1);
        assert_eq!(manager.block_count(), 0);

        drop(manager);

        // Nothing was published, so dropping the manager returns nothing more.
        assert_eq!(provider.deallocations.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn starts_without_blocks() {
        let manager = manager_for::<u64>(nz!(4), nz!(8));

        assert_eq!(manager.block_count(), 0);
        assert_eq!(manager.capacity(), 0);
        assert_eq!(manager.addresses().count(), 0);
    }

    #[test]
    fn growth_appends_blocks_in_order() {
        let manager = manager_for::<u64>(nz!(4), nz!(8));

        let growth = manager.begin_growth();
        assert_eq!(growth.append_block().unwrap(), 0);
        assert_eq!(growth.append_block().unwrap(), 1);
        drop(growth);

        assert_eq!(manager.block_count(), 2);
        assert_eq!(manager.capacity(), 8);
    }

    #[test]
    fn growth_stops_at_block_limit() {
        let manager = manager_for::<u64>(nz!(2), nz!(1));

        let growth = manager.begin_growth();
        growth.append_block().unwrap();

        let error = growth.append_block().unwrap_err();
        assert!(matches!(
            error,
            Error::Exhausted {
                block_count: 1,
                block_capacity: 2
            }
        ));
    }

    #[test]
    fn headers_are_stamped_with_their_address() {
        let manager = manager_for::<u32>(nz!(3), nz!(4));
        manager.begin_growth().append_block().unwrap();
        manager.begin_growth().append_block().unwrap();

        for address in manager.addresses() {
            let header = manager.header(address);
            assert_eq!(header.address(), address);
            assert!(!header.is_occupied());
        }
    }

    #[test]
    fn pointer_and_address_round_trip() {
        let manager = manager_for::<u64>(nz!(5), nz!(4));
        manager.begin_growth().append_block().unwrap();
        manager.begin_growth().append_block().unwrap();

        for address in manager.addresses() {
            let ptr = manager.pointer_of(address);
            assert_eq!(unsafe { manager.address_of(ptr) }, address);
            assert_eq!(manager.locate(ptr), Some(address));
        }
    }

    #[test]
    fn object_pointers_do_not_overlap() {
        let manager = manager_for::<[u8; 24]>(nz!(8), nz!(4));
        manager.begin_growth().append_block().unwrap();
        manager.begin_growth().append_block().unwrap();

        let mut ranges = manager
            .addresses()
            .map(|address| {
                let start = manager.pointer_of(address).as_ptr().addr();
                (start, start + 24)
            })
            .collect::<Vec<_>>();

        ranges.sort_unstable();

        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "object ranges overlap: {pair:?}");
        }

        let unique = ranges.iter().map(|r| r.0).collect::<HashSet<_>>();
        assert_eq!(unique.len(), 16);
    }

    #[test]
    fn object_pointers_are_aligned() {
        #[repr(align(32))]
        struct Aligned(#[expect(dead_code, reason = "only the layout matters")] [u8; 8]);

        let manager = manager_for::<Aligned>(nz!(7), nz!(2));
        manager.begin_growth().append_block().unwrap();

        for address in manager.addresses() {
            assert_eq!(manager.pointer_of(address).as_ptr().addr() % 32, 0);
        }
    }

    #[test]
    fn locate_rejects_foreign_pointers() {
        let manager = manager_for::<u64>(nz!(4), nz!(2));
        manager.begin_growth().append_block().unwrap();

        let mut local = 0_u64;
        assert_eq!(manager.locate(NonNull::from(&mut local).cast()), None);

        // A pointer into the middle of an object is not a slot boundary.
        let inside = unsafe { manager.pointer_of(SlotAddress::new(0, 1)).byte_add(1) };
        assert_eq!(manager.locate(inside), None);
    }

    #[test]
    #[should_panic]
    fn header_of_missing_block_panics() {
        let manager = manager_for::<u64>(nz!(4), nz!(2));
        _ = manager.header(SlotAddress::new(1, 0));
    }

    #[test]
    #[should_panic]
    fn header_of_out_of_bounds_slot_panics() {
        let manager = manager_for::<u64>(nz!(4), nz!(2));
        manager.begin_growth().append_block().unwrap();
        _ = manager.header(SlotAddress::new(0, 4));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic]
    fn address_of_foreign_pointer_panics_in_debug_builds() {
        let manager = manager_for::<u64>(nz!(4), nz!(2));
        manager.begin_growth().append_block().unwrap();

        let mut local = 0_u64;
        _ = unsafe { manager.address_of(NonNull::from(&mut local).cast()) };
    }
}
