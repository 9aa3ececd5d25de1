use std::alloc::Layout;
use std::num::NonZero;

use crate::SlotHeader;

/// Geometry of the slots in one pool: where the object sits relative to the slot header and
/// how far apart consecutive slots are.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct SlotLayout {
    /// Layout of the objects stored in the slots.
    object_layout: Layout,

    /// Distance in bytes between the start of consecutive slots. This is the header plus the
    /// object, padded so that every slot in the block stays aligned.
    stride: usize,

    /// Byte offset from the start of a slot (its header) to the object.
    object_offset: usize,

    /// Layout of one whole block of slots, as requested from the block provider.
    block_layout: Layout,
}

impl SlotLayout {
    /// Calculates slot geometry for objects of `object_layout`, with `block_capacity` slots
    /// per block.
    ///
    /// # Panics
    ///
    /// Panics if the object layout has zero size or if the block size would overflow.
    #[must_use]
    pub(crate) fn calculate(object_layout: Layout, block_capacity: NonZero<u32>) -> Self {
        assert!(
            object_layout.size() > 0,
            "slot layout cannot be calculated for zero-sized objects"
        );

        let header_layout = Layout::new::<SlotHeader>();

        let (slot_layout, object_offset) = header_layout
            .extend(object_layout)
            .expect("layout extension cannot fail for valid layouts with reasonable sizes");

        // Padding to alignment turns the size into the array stride, so every header and every
        // object in the block lands on a correctly aligned address.
        let slot_layout = slot_layout.pad_to_align();

        let block_size = slot_layout
            .size()
            .checked_mul(block_capacity.get() as usize)
            .expect("block size calculation cannot overflow for reasonable capacity values");

        let block_layout = Layout::from_size_align(block_size, slot_layout.align())
            .expect("block layout calculation cannot fail for valid slot layouts");

        Self {
            object_layout,
            stride: slot_layout.size(),
            object_offset,
            block_layout,
        }
    }

    #[must_use]
    pub(crate) fn object_layout(&self) -> Layout {
        self.object_layout
    }

    #[must_use]
    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    #[must_use]
    pub(crate) fn object_offset(&self) -> usize {
        self.object_offset
    }

    #[must_use]
    pub(crate) fn block_layout(&self) -> Layout {
        self.block_layout
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn stride_covers_header_and_object() {
        let layout = SlotLayout::calculate(Layout::new::<u64>(), nz!(4));

        assert!(layout.stride() >= size_of::<SlotHeader>() + size_of::<u64>());
        assert_eq!(layout.stride() % align_of::<SlotHeader>(), 0);
        assert_eq!(layout.stride() % align_of::<u64>(), 0);
        assert_eq!(layout.block_layout().size(), layout.stride() * 4);
    }

    #[test]
    fn object_offset_respects_object_alignment() {
        #[repr(align(64))]
        struct Aligned([u8; 64]);

        let layout = SlotLayout::calculate(Layout::new::<Aligned>(), nz!(3));

        assert_eq!(layout.object_offset() % 64, 0);
        assert_eq!(layout.stride() % 64, 0);
        assert_eq!(layout.block_layout().align(), 64);
        assert_eq!(layout.object_layout(), Layout::new::<Aligned>());
    }

    #[test]
    fn small_objects_still_get_a_full_header() {
        let layout = SlotLayout::calculate(Layout::new::<u8>(), nz!(1));

        assert_eq!(layout.object_offset(), size_of::<SlotHeader>());
        assert!(layout.stride() > size_of::<SlotHeader>());
    }

    #[test]
    #[should_panic]
    fn zero_sized_object_panics() {
        drop(SlotLayout::calculate(Layout::new::<()>(), nz!(1)));
    }
}
