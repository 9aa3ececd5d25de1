use parking_lot::MutexGuard;

use crate::error::Result;
use crate::{BlockManager, Chains, OrderedTracker, SlotAddress, UnorderedTracker};

/// Selects how a pool keeps track of which slots are free and which are occupied.
///
/// # Examples
///
/// ```
/// use fixed_pool::{Pool, Tracking};
///
/// let pool = Pool::<u64>::builder().tracking(Tracking::Unordered).build();
///
/// let item = pool.create(42).unwrap();
/// assert_eq!(*item, 42);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Tracking {
    /// Free and occupied slots are kept in address order under a mutex.
    ///
    /// The lowest free address is always reused first and live objects can be enumerated in
    /// address order via [`Pool::iter()`][crate::Pool::iter]. Each allocation and release costs
    /// a scan proportional to the number of slots, so this suits small pools best.
    #[default]
    Ordered,

    /// Free slots are kept in a lock-free queue in no particular order.
    ///
    /// Allocation and release are cheap and scale across threads but live objects cannot be
    /// enumerated.
    Unordered,
}

/// The slot tracking strategy of one pool.
#[derive(Debug)]
pub(crate) enum Tracker {
    Ordered(OrderedTracker),
    Unordered(UnorderedTracker),
}

impl Tracker {
    #[must_use]
    pub(crate) fn new(tracking: Tracking) -> Self {
        match tracking {
            Tracking::Ordered => Self::Ordered(OrderedTracker::new()),
            Tracking::Unordered => Self::Unordered(UnorderedTracker::new()),
        }
    }

    #[must_use]
    pub(crate) fn tracking(&self) -> Tracking {
        match self {
            Self::Ordered(_) => Tracking::Ordered,
            Self::Unordered(_) => Tracking::Unordered,
        }
    }

    pub(crate) fn reserve(&self, blocks: &BlockManager) -> Result<SlotAddress> {
        match self {
            Self::Ordered(tracker) => tracker.reserve(blocks),
            Self::Unordered(tracker) => tracker.reserve(blocks),
        }
    }

    pub(crate) fn release(&self, blocks: &BlockManager, address: SlotAddress) {
        match self {
            Self::Ordered(tracker) => tracker.release(blocks, address),
            Self::Unordered(tracker) => tracker.release(blocks, address),
        }
    }

    pub(crate) fn reserve_capacity(&self, blocks: &BlockManager, additional: usize) -> Result<()> {
        match self {
            Self::Ordered(tracker) => tracker.reserve_capacity(blocks, additional),
            Self::Unordered(tracker) => tracker.reserve_capacity(blocks, additional),
        }
    }

    #[must_use]
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Ordered(tracker) => tracker.len(),
            Self::Unordered(tracker) => tracker.len(),
        }
    }

    /// Locks the ordered chains for enumeration, if this tracker keeps them.
    #[must_use]
    pub(crate) fn lock_chains(&self) -> Option<MutexGuard<'_, Chains>> {
        match self {
            Self::Ordered(tracker) => Some(tracker.lock()),
            Self::Unordered(_) => None,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn default_is_ordered() {
        assert_eq!(Tracking::default(), Tracking::Ordered);
    }

    #[test]
    fn reports_own_strategy() {
        assert_eq!(Tracker::new(Tracking::Ordered).tracking(), Tracking::Ordered);
        assert_eq!(
            Tracker::new(Tracking::Unordered).tracking(),
            Tracking::Unordered
        );
    }

    #[test]
    fn only_ordered_exposes_chains() {
        assert!(Tracker::new(Tracking::Ordered).lock_chains().is_some());
        assert!(Tracker::new(Tracking::Unordered).lock_chains().is_none());
    }
}
