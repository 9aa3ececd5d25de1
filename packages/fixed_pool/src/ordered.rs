use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;
use crate::{BlockManager, SlotAddress};

/// Tracks free and occupied slots as two intrusive singly-linked chains threaded through the
/// slot headers, both kept in ascending address order at all times.
///
/// Keeping the chains ordered costs a predecessor scan on every splice, in exchange for:
///
/// * deterministic lowest-address-first reuse of free slots, and
/// * address-order iteration over live objects.
///
/// All operations, growth included, run under one mutex. The live count is only written under
/// that mutex but can be read without it, so queries do not block behind an iterator.
#[derive(Debug)]
pub(crate) struct OrderedTracker {
    chains: Mutex<Chains>,
    len: AtomicUsize,
}

/// The state guarded by the ordered tracker's lock.
#[derive(Debug)]
pub(crate) struct Chains {
    first_free: SlotAddress,
    first_occupied: SlotAddress,
}

impl OrderedTracker {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            chains: Mutex::new(Chains {
                first_free: SlotAddress::NONE,
                first_occupied: SlotAddress::NONE,
            }),
            len: AtomicUsize::new(0),
        }
    }

    /// Takes the lowest free slot, growing the pool if there is none, and links it into the
    /// occupied chain.
    pub(crate) fn reserve(&self, blocks: &BlockManager) -> Result<SlotAddress> {
        let mut chains = self.chains.lock();

        if chains.first_free.is_none() {
            chains.append_block(blocks)?;
        }

        let address = chains.first_free;
        let header = blocks.header(address);

        // SAFETY: We hold the lock that guards both chains.
        chains.first_free = unsafe { header.next() };

        // SAFETY: We hold the lock and just unlinked the slot from the free chain.
        unsafe {
            insert_sorted(&mut chains.first_occupied, blocks, address);
        }

        header.mark_occupied();

        self.len.fetch_add(1, Ordering::Relaxed);

        Ok(address)
    }

    /// Moves an occupied slot back into the free chain.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not occupied.
    pub(crate) fn release(&self, blocks: &BlockManager, address: SlotAddress) {
        let mut chains = self.chains.lock();

        // This comes first so that a double release panics before any chain is touched.
        blocks.header(address).mark_free();

        // SAFETY: We hold the lock that guards both chains.
        unsafe {
            remove_sorted(&mut chains.first_occupied, blocks, address);
        }

        // SAFETY: We hold the lock and just unlinked the slot from the occupied chain.
        unsafe {
            insert_sorted(&mut chains.first_free, blocks, address);
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
    }

    /// Grows the pool until at least `additional` slots are free.
    pub(crate) fn reserve_capacity(&self, blocks: &BlockManager, additional: usize) -> Result<()> {
        let mut chains = self.chains.lock();

        let required = self
            .len
            .load(Ordering::Relaxed)
            .checked_add(additional)
            .expect("requested capacity exceeds size of virtual memory");

        while blocks.capacity() < required {
            chains.append_block(blocks)?;
        }

        Ok(())
    }

    /// Number of occupied slots. Does not take the lock.
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Locks the chains, preventing any reservation or release until the guard is dropped.
    #[must_use]
    pub(crate) fn lock(&self) -> MutexGuard<'_, Chains> {
        self.chains.lock()
    }

    #[cfg(test)]
    pub(crate) fn integrity_check(&self, blocks: &BlockManager) {
        self.chains.lock().integrity_check(blocks, self.len());
    }
}

impl Chains {
    /// Head of the occupied chain: the lowest occupied address, or `NONE` if empty.
    #[must_use]
    pub(crate) fn first_occupied(&self) -> SlotAddress {
        self.first_occupied
    }

    /// Appends a block and links all its slots to the end of the free chain.
    ///
    /// Every slot of a new block has a higher address than any existing slot, so appending at
    /// the tail keeps the free chain ordered.
    fn append_block(&mut self, blocks: &BlockManager) -> Result<()> {
        let block = blocks.begin_growth().append_block()?;
        let block_capacity = blocks.block_capacity().get();

        for slot in 0..block_capacity {
            let next = slot
                .checked_add(1)
                .filter(|next| *next < block_capacity)
                .map_or(SlotAddress::NONE, |next| SlotAddress::new(block, next));

            // SAFETY: The new slots are not yet reachable from any chain and we hold the lock.
            unsafe {
                blocks.header(SlotAddress::new(block, slot)).set_next(next);
            }
        }

        let first_new = SlotAddress::new(block, 0);

        if self.first_free.is_none() {
            self.first_free = first_new;
        } else {
            let mut tail = self.first_free;

            loop {
                // SAFETY: We hold the lock that guards both chains.
                let next = unsafe { blocks.header(tail).next() };

                if next.is_none() {
                    break;
                }

                tail = next;
            }

            // SAFETY: We hold the lock that guards both chains.
            unsafe {
                blocks.header(tail).set_next(first_new);
            }
        }

        Ok(())
    }

    /// Verifies that both chains are strictly ascending, that together they cover every slot
    /// exactly once and that the occupancy flags and `len` agree with them.
    #[cfg(test)]
    pub(crate) fn integrity_check(&self, blocks: &BlockManager, len: usize) {
        let walk = |head: SlotAddress, expect_occupied: bool| {
            let mut count = 0_usize;
            let mut previous = SlotAddress::NONE;
            let mut current = head;

            while !current.is_none() {
                assert!(
                    previous.is_none() || previous < current,
                    "chain is out of order: {previous} is followed by {current}"
                );

                let header = blocks.header(current);
                assert_eq!(
                    header.is_occupied(),
                    expect_occupied,
                    "slot {current} is in the wrong chain"
                );

                count += 1;
                previous = current;

                // SAFETY: The caller holds the lock (we are reached through a guard).
                current = unsafe { header.next() };
            }

            count
        };

        let occupied = walk(self.first_occupied, true);
        let free = walk(self.first_free, false);

        assert_eq!(occupied, len, "occupied chain length disagrees with len");
        assert_eq!(
            occupied + free,
            blocks.capacity(),
            "chains do not cover every slot"
        );
    }
}

/// Returns the last address in the chain starting at `first` that sorts before `target`.
///
/// # Safety
///
/// The caller must hold the lock guarding the chain, and `first` must sort before `target`.
unsafe fn find_predecessor(
    blocks: &BlockManager,
    first: SlotAddress,
    target: SlotAddress,
) -> SlotAddress {
    debug_assert!(first < target);

    let mut previous = first;

    loop {
        // SAFETY: Forwarding the lock requirement from the caller.
        let next = unsafe { blocks.header(previous).next() };

        // NONE sorts after every real address, which stops the scan at the end of the chain.
        if next < target {
            previous = next;
        } else {
            return previous;
        }
    }
}

/// Links `address` into the ordered chain starting at `head`.
///
/// # Safety
///
/// The caller must hold the lock guarding the chain, and `address` must not be in any chain.
unsafe fn insert_sorted(head: &mut SlotAddress, blocks: &BlockManager, address: SlotAddress) {
    let header = blocks.header(address);

    if head.is_none() || address < *head {
        // SAFETY: Forwarding the lock requirement from the caller.
        unsafe {
            header.set_next(*head);
        }

        *head = address;
        return;
    }

    // SAFETY: Forwarding the lock requirement from the caller. The head sorts before us.
    let previous = blocks.header(unsafe { find_predecessor(blocks, *head, address) });

    // SAFETY: Forwarding the lock requirement from the caller.
    let next = unsafe { previous.next() };

    // SAFETY: Forwarding the lock requirement from the caller.
    unsafe {
        header.set_next(next);
    }

    // SAFETY: Forwarding the lock requirement from the caller.
    unsafe {
        previous.set_next(address);
    }
}

/// Unlinks `address` from the ordered chain starting at `head`.
///
/// # Panics
///
/// Panics if `address` is not in the chain.
///
/// # Safety
///
/// The caller must hold the lock guarding the chain.
unsafe fn remove_sorted(head: &mut SlotAddress, blocks: &BlockManager, address: SlotAddress) {
    let header = blocks.header(address);

    // SAFETY: Forwarding the lock requirement from the caller.
    let next = unsafe { header.next() };

    if *head == address {
        *head = next;
    } else {
        assert!(
            !head.is_none() && *head < address,
            "slot {address} is not in the chain"
        );

        // SAFETY: Forwarding the lock requirement from the caller. The head sorts before us.
        let previous = blocks.header(unsafe { find_predecessor(blocks, *head, address) });

        // SAFETY: Forwarding the lock requirement from the caller.
        let previous_next = unsafe { previous.next() };

        assert_eq!(previous_next, address, "slot {address} is not in the chain");

        // SAFETY: Forwarding the lock requirement from the caller.
        unsafe {
            previous.set_next(next);
        }
    }

    // SAFETY: Forwarding the lock requirement from the caller.
    unsafe {
        header.set_next(SlotAddress::NONE);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::Layout;
    use std::num::NonZero;
    use std::sync::Arc;

    use new_zealand::nz;

    use super::*;
    use crate::{Error, SlotLayout, SystemProvider};

    fn blocks(block_capacity: NonZero<u32>, max_blocks: NonZero<u32>) -> BlockManager {
        BlockManager::new(
            SlotLayout::calculate(Layout::new::<u64>(), block_capacity),
            block_capacity,
            max_blocks,
            Arc::new(SystemProvider),
        )
    }

    fn occupied(tracker: &OrderedTracker, blocks: &BlockManager) -> Vec<SlotAddress> {
        let chains = tracker.lock();
        let mut result = Vec::new();
        let mut current = chains.first_occupied();

        while !current.is_none() {
            result.push(current);
            // SAFETY: We hold the lock via `chains`.
            current = unsafe { blocks.header(current).next() };
        }

        result
    }

    #[test]
    fn reserves_in_ascending_order() {
        let blocks = blocks(nz!(4), nz!(4));
        let tracker = OrderedTracker::new();

        let addresses = (0..6)
            .map(|_| tracker.reserve(&blocks).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(
            addresses,
            vec![
                SlotAddress::new(0, 0),
                SlotAddress::new(0, 1),
                SlotAddress::new(0, 2),
                SlotAddress::new(0, 3),
                SlotAddress::new(1, 0),
                SlotAddress::new(1, 1),
            ]
        );
        assert_eq!(tracker.len(), 6);
        assert_eq!(blocks.block_count(), 2);

        tracker.integrity_check(&blocks);
    }

    #[test]
    fn reuses_lowest_free_slot_first() {
        let blocks = blocks(nz!(8), nz!(4));
        let tracker = OrderedTracker::new();

        for _ in 0..8 {
            tracker.reserve(&blocks).unwrap();
        }

        // Release out of order; reuse must still be lowest-first.
        for slot in [6, 2, 4, 0] {
            tracker.release(&blocks, SlotAddress::new(0, slot));
        }

        tracker.integrity_check(&blocks);

        let reused = (0..4)
            .map(|_| tracker.reserve(&blocks).unwrap())
            .collect::<Vec<_>>();

        assert_eq!(
            reused,
            vec![
                SlotAddress::new(0, 0),
                SlotAddress::new(0, 2),
                SlotAddress::new(0, 4),
                SlotAddress::new(0, 6),
            ]
        );
        assert_eq!(blocks.block_count(), 1);

        tracker.integrity_check(&blocks);
    }

    #[test]
    fn occupied_chain_stays_sorted() {
        let blocks = blocks(nz!(4), nz!(8));
        let tracker = OrderedTracker::new();

        for _ in 0..12 {
            tracker.reserve(&blocks).unwrap();
        }

        for slot in [1, 3] {
            tracker.release(&blocks, SlotAddress::new(0, slot));
            tracker.release(&blocks, SlotAddress::new(2, slot));
        }

        tracker.release(&blocks, SlotAddress::new(1, 0));

        // Refill the holes and add some more, crossing into a new block.
        for _ in 0..7 {
            tracker.reserve(&blocks).unwrap();
        }

        let live = occupied(&tracker, &blocks);
        assert_eq!(live.len(), 14);
        assert!(live.windows(2).all(|pair| pair[0] < pair[1]));

        tracker.integrity_check(&blocks);
    }

    #[test]
    fn release_of_head_and_tail() {
        let blocks = blocks(nz!(4), nz!(1));
        let tracker = OrderedTracker::new();

        for _ in 0..4 {
            tracker.reserve(&blocks).unwrap();
        }

        tracker.release(&blocks, SlotAddress::new(0, 0));
        tracker.release(&blocks, SlotAddress::new(0, 3));

        assert_eq!(
            occupied(&tracker, &blocks),
            vec![SlotAddress::new(0, 1), SlotAddress::new(0, 2)]
        );

        tracker.integrity_check(&blocks);
    }

    #[test]
    fn exhaustion_leaves_state_intact() {
        let blocks = blocks(nz!(2), nz!(1));
        let tracker = OrderedTracker::new();

        tracker.reserve(&blocks).unwrap();
        tracker.reserve(&blocks).unwrap();

        assert!(matches!(
            tracker.reserve(&blocks),
            Err(Error::Exhausted { .. })
        ));
        assert_eq!(tracker.len(), 2);

        tracker.release(&blocks, SlotAddress::new(0, 1));
        assert_eq!(tracker.reserve(&blocks).unwrap(), SlotAddress::new(0, 1));

        tracker.integrity_check(&blocks);
    }

    #[test]
    fn reserve_capacity_appends_to_free_tail() {
        let blocks = blocks(nz!(4), nz!(8));
        let tracker = OrderedTracker::new();

        tracker.reserve(&blocks).unwrap();
        tracker.reserve(&blocks).unwrap();

        tracker.reserve_capacity(&blocks, 10).unwrap();
        assert!(blocks.capacity() >= 12);
        tracker.integrity_check(&blocks);

        // The lowest free slot is still the one right after the occupied ones.
        assert_eq!(tracker.reserve(&blocks).unwrap(), SlotAddress::new(0, 2));
        tracker.integrity_check(&blocks);
    }

    #[test]
    fn len_is_readable_while_locked() {
        let blocks = blocks(nz!(4), nz!(2));
        let tracker = OrderedTracker::new();

        tracker.reserve(&blocks).unwrap();
        tracker.reserve(&blocks).unwrap();

        let _chains = tracker.lock();

        // Would deadlock if the count lived behind the chains lock.
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let blocks = blocks(nz!(4), nz!(1));
        let tracker = OrderedTracker::new();

        let address = tracker.reserve(&blocks).unwrap();
        tracker.release(&blocks, address);
        tracker.release(&blocks, address);
    }
}
