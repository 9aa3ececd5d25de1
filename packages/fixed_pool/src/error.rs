use thiserror::Error;

/// Errors returned by pool operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The pool has no vacant slot and could not obtain another block, either because the
    /// configured block limit was reached or because the block provider returned no memory.
    #[error(
        "pool exhausted: {block_count} blocks of {block_capacity} slots are in use and no further block could be obtained"
    )]
    Exhausted {
        /// Number of blocks the pool held when growth failed.
        block_count: usize,

        /// Number of slots in each block.
        block_capacity: usize,
    },

    /// Iteration over live objects was requested from a pool whose tracker keeps no order.
    #[error("iteration is only supported by pools that use ordered tracking")]
    IterationUnsupported,
}

impl Error {
    /// Whether the error means the pool could not grow.
    #[must_use]
    #[inline]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Failure of a fallible in-place construction.
///
/// Whichever variant is returned, no slot remains reserved for the failed object.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CreateError<E> {
    /// The pool could not provide a slot. The constructor was not called.
    #[error(transparent)]
    Pool(#[from] Error),

    /// The constructor reported a failure. The reserved slot was released before returning.
    #[error("object constructor failed")]
    Constructor(#[source] E),
}

/// A specialized `Result` type for pool operations, returning the crate's
/// [`Error`] type as the error value unless specified otherwise.
pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::error::Error as _;
    use std::fmt::{self, Debug};

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);
    assert_impl_all!(CreateError<fmt::Error>: Send, Sync, Debug);

    #[test]
    fn exhausted_message_names_the_limits() {
        let error = Error::Exhausted {
            block_count: 3,
            block_capacity: 64,
        };

        let message = error.to_string();
        assert!(message.contains("3 blocks"));
        assert!(message.contains("64 slots"));
    }

    #[test]
    fn constructor_error_exposes_source() {
        let error: CreateError<fmt::Error> = CreateError::Constructor(fmt::Error);

        assert!(error.source().is_some());
        assert_eq!(error.to_string(), "object constructor failed");
    }

    #[test]
    fn pool_error_converts_into_create_error() {
        let error: CreateError<fmt::Error> = Error::IterationUnsupported.into();

        assert!(matches!(
            error,
            CreateError::Pool(Error::IterationUnsupported)
        ));
    }
}
