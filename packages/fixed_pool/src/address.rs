use std::fmt;

/// Stable coordinates of a slot within a pool: the block that holds it and its index inside
/// that block.
///
/// Blocks are only ever appended, so a coordinate stays valid for the entire lifetime of the
/// pool. Coordinates are ordered first by block, then by slot, which is the order in which the
/// ordered tracker keeps its chains.
///
/// [`SlotAddress::NONE`] is a reserved value that terminates chains and sorts after every real
/// address.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct SlotAddress {
    // Field order matters: the derived `Ord` compares `block` before `slot`.
    block: u32,
    slot: u32,
}

impl SlotAddress {
    /// The "no address" sentinel, used to mark the end of a chain or an empty chain.
    pub const NONE: Self = Self {
        block: u32::MAX,
        slot: u32::MAX,
    };

    #[must_use]
    pub(crate) const fn new(block: u32, slot: u32) -> Self {
        Self { block, slot }
    }

    /// Index of the block containing the slot.
    #[must_use]
    #[inline]
    pub fn block(self) -> u32 {
        self.block
    }

    /// Index of the slot within its block.
    #[must_use]
    #[inline]
    pub fn slot(self) -> u32 {
        self.slot
    }

    /// Whether this is the [`NONE`](Self::NONE) sentinel.
    #[must_use]
    #[inline]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    pub(crate) fn block_index(self) -> usize {
        self.block as usize
    }

    pub(crate) fn slot_index(self) -> usize {
        self.slot as usize
    }
}

impl fmt::Debug for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("SlotAddress(NONE)")
        } else {
            write!(f, "SlotAddress({}:{})", self.block, self.slot)
        }
    }
}

impl fmt::Display for SlotAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            f.write_str("none")
        } else {
            write!(f, "{}:{}", self.block, self.slot)
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SlotAddress: Send, Sync, Copy, Ord, fmt::Debug);

    #[test]
    fn orders_by_block_then_slot() {
        let a = SlotAddress::new(0, 5);
        let b = SlotAddress::new(1, 0);
        let c = SlotAddress::new(1, 3);

        assert!(a < b);
        assert!(b < c);
        assert!(a < c);

        // A later block wins even if its slot index is lower.
        assert!(SlotAddress::new(0, 200) < SlotAddress::new(2, 1));
    }

    #[test]
    fn none_sorts_after_everything() {
        assert!(SlotAddress::new(u32::MAX - 1, u32::MAX) < SlotAddress::NONE);
        assert!(SlotAddress::new(0, 0) < SlotAddress::NONE);
        assert!(SlotAddress::NONE.is_none());
        assert!(!SlotAddress::new(0, 0).is_none());
    }

    #[test]
    fn formatting() {
        assert_eq!(SlotAddress::new(3, 7).to_string(), "3:7");
        assert_eq!(SlotAddress::NONE.to_string(), "none");
        assert_eq!(format!("{:?}", SlotAddress::new(1, 2)), "SlotAddress(1:2)");
    }
}
