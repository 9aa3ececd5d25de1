use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::SlotAddress;

/// Bookkeeping stored in front of every slot.
///
/// The header is written once when its block is created and afterwards only touched by the
/// tracker that owns the slot. Object memory follows the header at the offset calculated by
/// [`SlotLayout`][crate::SlotLayout].
#[derive(Debug)]
#[repr(C)]
pub(crate) struct SlotHeader {
    /// The coordinates of this slot. Immutable after block creation, which is what makes
    /// pointer-to-address conversion O(1).
    address: SlotAddress,

    /// Next slot in whichever ordered chain (free or occupied) currently contains this slot.
    /// Only read or written while holding the ordered tracker's lock.
    next: UnsafeCell<SlotAddress>,

    /// Whether the slot currently holds a live object.
    occupied: AtomicBool,
}

impl SlotHeader {
    #[must_use]
    pub(crate) fn new(address: SlotAddress) -> Self {
        Self {
            address,
            next: UnsafeCell::new(SlotAddress::NONE),
            occupied: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub(crate) fn address(&self) -> SlotAddress {
        self.address
    }

    /// # Safety
    ///
    /// The caller must hold the lock that guards the chain this slot belongs to.
    #[must_use]
    pub(crate) unsafe fn next(&self) -> SlotAddress {
        // SAFETY: The lock held by the caller prevents concurrent writes.
        unsafe { *self.next.get() }
    }

    /// # Safety
    ///
    /// The caller must hold the lock that guards the chain this slot belongs to.
    pub(crate) unsafe fn set_next(&self, next: SlotAddress) {
        debug_assert_ne!(next, self.address, "slot {} may not link to itself", self.address);

        // SAFETY: The lock held by the caller prevents concurrent reads and writes.
        unsafe {
            *self.next.get() = next;
        }
    }

    #[must_use]
    pub(crate) fn is_occupied(&self) -> bool {
        self.occupied.load(Ordering::Acquire)
    }

    /// Marks a free slot as occupied.
    ///
    /// # Panics
    ///
    /// Panics if the slot was already occupied, which would mean the tracker handed out the
    /// same slot twice.
    pub(crate) fn mark_occupied(&self) {
        let was_occupied = self.occupied.swap(true, Ordering::AcqRel);

        assert!(
            !was_occupied,
            "slot {} was handed out while still occupied",
            self.address
        );
    }

    /// Marks an occupied slot as free.
    ///
    /// # Panics
    ///
    /// Panics if the slot was not occupied. This detects releasing the same slot twice.
    pub(crate) fn mark_free(&self) {
        let was_occupied = self.occupied.swap(false, Ordering::AcqRel);

        assert!(
            was_occupied,
            "slot {} was released but it was not occupied (double release?)",
            self.address
        );
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    reason = "tests focus on succinct code and do not need to tick all the boxes"
)]
mod tests {
    use super::*;

    #[test]
    fn fresh_header_is_free_and_unlinked() {
        let header = SlotHeader::new(SlotAddress::new(2, 9));

        assert_eq!(header.address(), SlotAddress::new(2, 9));
        assert!(!header.is_occupied());
        assert_eq!(unsafe { header.next() }, SlotAddress::NONE);
    }

    #[test]
    fn occupancy_round_trip() {
        let header = SlotHeader::new(SlotAddress::new(0, 0));

        header.mark_occupied();
        assert!(header.is_occupied());

        header.mark_free();
        assert!(!header.is_occupied());
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let header = SlotHeader::new(SlotAddress::new(0, 0));

        header.mark_occupied();
        header.mark_free();
        header.mark_free();
    }

    #[test]
    #[should_panic]
    fn double_occupy_panics() {
        let header = SlotHeader::new(SlotAddress::new(0, 0));

        header.mark_occupied();
        header.mark_occupied();
    }

    #[test]
    fn links_can_be_updated() {
        let header = SlotHeader::new(SlotAddress::new(0, 0));

        unsafe {
            header.set_next(SlotAddress::new(0, 1));
            assert_eq!(header.next(), SlotAddress::new(0, 1));
        }
    }
}
