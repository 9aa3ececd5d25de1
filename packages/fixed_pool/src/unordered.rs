use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::queue::SegQueue;

use crate::error::Result;
use crate::{BlockManager, SlotAddress};

/// Tracks free slots in a lock-free queue, without any ordering guarantees.
///
/// Reservation and release never take a lock in the common case. Only growth serializes,
/// via the block manager's growth guard. The set of occupied slots is not tracked, so pools
/// using this tracker cannot enumerate their live objects.
#[derive(Debug)]
pub(crate) struct UnorderedTracker {
    free: SegQueue<SlotAddress>,
    len: AtomicUsize,
}

impl UnorderedTracker {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            free: SegQueue::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Takes any free slot, growing the pool if there is none.
    pub(crate) fn reserve(&self, blocks: &BlockManager) -> Result<SlotAddress> {
        let address = match self.free.pop() {
            Some(address) => address,
            None => self.grow(blocks)?,
        };

        blocks.header(address).mark_occupied();
        self.len.fetch_add(1, Ordering::Relaxed);

        Ok(address)
    }

    /// Returns an occupied slot to the free queue.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not occupied.
    pub(crate) fn release(&self, blocks: &BlockManager, address: SlotAddress) {
        // The flag must flip before the slot becomes visible to other reservers.
        blocks.header(address).mark_free();
        self.len.fetch_sub(1, Ordering::Relaxed);
        self.free.push(address);
    }

    /// Grows the pool until at least `additional` slots are free.
    pub(crate) fn reserve_capacity(&self, blocks: &BlockManager, additional: usize) -> Result<()> {
        let growth = blocks.begin_growth();

        let required = self
            .len
            .load(Ordering::Relaxed)
            .checked_add(additional)
            .expect("requested capacity exceeds size of virtual memory");

        while blocks.capacity() < required {
            let block = growth.append_block()?;

            for slot in 0..blocks.block_capacity().get() {
                self.free.push(SlotAddress::new(block, slot));
            }
        }

        Ok(())
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Appends a block, keeps its first slot for the caller and offers the rest to everyone.
    fn grow(&self, blocks: &BlockManager) -> Result<SlotAddress> {
        let growth = blocks.begin_growth();

        // Another thread may have grown the pool (or released a slot) while we waited.
        if let Some(address) = self.free.pop() {
            return Ok(address);
        }

        let block = growth.append_block()?;

        for slot in 1..blocks.block_capacity().get() {
            self.free.push(SlotAddress::new(block, slot));
        }

        Ok(SlotAddress::new(block, 0))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::alloc::Layout;
    use std::collections::HashSet;
    use std::num::NonZero;
    use std::sync::{Arc, Barrier};
    use std::thread;

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

    #[test]
    fn reserves_distinct_slots() {
        let blocks = blocks(nz!(4), nz!(4));
        let tracker = UnorderedTracker::new();

        let addresses = (0..10)
            .map(|_| tracker.reserve(&blocks).unwrap())
            .collect::<HashSet<_>>();

        assert_eq!(addresses.len(), 10);
        assert_eq!(tracker.len(), 10);
        assert_eq!(blocks.block_count(), 3);

        for address in &addresses {
            assert!(blocks.header(*address).is_occupied());
        }
    }

    #[test]
    fn released_slots_are_reused() {
        let blocks = blocks(nz!(4), nz!(1));
        let tracker = UnorderedTracker::new();

        let addresses = (0..4)
            .map(|_| tracker.reserve(&blocks).unwrap())
            .collect::<Vec<_>>();

        assert!(matches!(
            tracker.reserve(&blocks),
            Err(Error::Exhausted { .. })
        ));

        tracker.release(&blocks, addresses[2]);
        assert_eq!(tracker.len(), 3);
        assert!(!blocks.header(addresses[2]).is_occupied());

        assert_eq!(tracker.reserve(&blocks).unwrap(), addresses[2]);
        assert_eq!(tracker.len(), 4);
    }

    #[test]
    fn reserve_capacity_grows_up_front() {
        let blocks = blocks(nz!(4), nz!(8));
        let tracker = UnorderedTracker::new();

        tracker.reserve_capacity(&blocks, 9).unwrap();
        assert_eq!(blocks.block_count(), 3);

        for _ in 0..12 {
            tracker.reserve(&blocks).unwrap();
        }

        assert_eq!(blocks.block_count(), 3);
    }

    #[test]
    fn reserve_capacity_fails_beyond_limit() {
        let blocks = blocks(nz!(4), nz!(2));
        let tracker = UnorderedTracker::new();

        assert!(matches!(
            tracker.reserve_capacity(&blocks, 9),
            Err(Error::Exhausted { .. })
        ));
    }

    #[test]
    #[should_panic]
    fn double_release_panics() {
        let blocks = blocks(nz!(4), nz!(1));
        let tracker = UnorderedTracker::new();

        let address = tracker.reserve(&blocks).unwrap();
        tracker.release(&blocks, address);
        tracker.release(&blocks, address);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Too slow for Miri.
    fn concurrent_growth_does_not_overshoot() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 16;

        let blocks = blocks(nz!(32), nz!(64));
        let tracker = UnorderedTracker::new();
        let barrier = Barrier::new(THREADS);

        let all = thread::scope(|s| {
            let handles = (0..THREADS)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();

                        (0..PER_THREAD)
                            .map(|_| tracker.reserve(&blocks).unwrap())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();

            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect::<Vec<_>>()
        });

        let unique = all.iter().copied().collect::<HashSet<_>>();
        assert_eq!(unique.len(), THREADS * PER_THREAD);
        assert_eq!(tracker.len(), THREADS * PER_THREAD);

        // 128 objects fit in 4 blocks. Racing growers re-check the queue, so we never need
        // more than that.
        assert_eq!(blocks.block_count(), 4);
    }
}
