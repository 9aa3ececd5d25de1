/// Determines what happens to objects still in the pool when the pool is dropped.
///
/// By default, the pool drops its remaining objects when it is dropped.
///
/// # Examples
///
/// ```
/// use fixed_pool::{DropPolicy, Pool};
///
/// // The drop policy is set at pool creation time.
/// let pool = Pool::<u32>::builder()
///     .drop_policy(DropPolicy::MustNotDropItems)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// Remaining objects are cleaned up when the pool is dropped. This is the default.
    ///
    /// A typed [`Pool<T>`][crate::Pool] drops each remaining object in place. A type-erased
    /// [`RawPool`][crate::RawPool] does not know how to drop its objects, so they are leaked
    /// without running their destructors (their memory is still returned to the provider).
    #[default]
    MayDropItems,

    /// The pool will panic if it still contains objects when it is dropped.
    ///
    /// This may be valuable if there are external requirements before the objects can be
    /// dropped. For example, it may be known that unsafe code keeps out of band pointers to the
    /// objects, with objects only destroyed after such pointers have been discarded.
    MustNotDropItems,
}
