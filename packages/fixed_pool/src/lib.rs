#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A pool of same-sized objects, carved from memory blocks that are allocated up front and never
//! moved.
//!
//! This crate provides [`Pool<T>`], which creates objects in place in free slots and destructs
//! them in place when their [`Pooled`] handle is dropped, and [`RawPool`], its type-erased core
//! that hands out raw memory for objects of a [`std::alloc::Layout`] chosen at creation time.
//! Both grow by appending blocks of slots, so no object ever moves and growth never invalidates
//! a pointer.
//!
//! This is part of the [Folo project](https://github.com/folo-rs/folo) that provides mechanisms for
//! high-performance hardware-aware programming in Rust.
//!
//! # Slot tracking
//!
//! A pool uses one of two strategies to track its free and occupied slots, chosen via
//! [`Tracking`] when the pool is built:
//!
//! * [`Tracking::Ordered`] (default) keeps free and occupied slots in address order under a
//!   mutex. The lowest free slot is always reused first and live objects can be enumerated in
//!   address order via [`Pool::iter()`].
//! * [`Tracking::Unordered`] keeps free slots in a lock-free queue. Allocation and release
//!   scale across threads but live objects cannot be enumerated.
//!
//! # Capacity
//!
//! Each block holds a fixed number of slots ([`Pool::pool_size()`]) and a pool may create up to
//! a configured number of blocks. When the pool cannot grow further, or its
//! [`BlockProvider`] runs out of memory, creation fails with [`Error::Exhausted`].
//!
//! # Examples
//!
//! ```
//! use fixed_pool::{Pool, Pooled};
//! use new_zealand::nz;
//!
//! let pool = Pool::<u64>::builder()
//!     .block_capacity(nz!(4))
//!     .max_blocks(nz!(1))
//!     .build();
//!
//! let items = (0..4)
//!     .map(|n| pool.create(n).unwrap())
//!     .collect::<Vec<Pooled<'_, u64>>>();
//!
//! assert_eq!(pool.allocated_count(), 4);
//!
//! // The single block is full and the pool may not grow.
//! assert!(pool.create(4).unwrap_err().is_exhausted());
//!
//! drop(items);
//! assert!(pool.is_empty());
//! ```
//!
//! Handles can be converted to trait objects while still destructing the original type:
//!
//! ```
//! use std::fmt::Display;
//!
//! use fixed_pool::{Pool, Pooled};
//!
//! let pool = Pool::<f32>::builder().build();
//!
//! let shown: Pooled<'_, dyn Display> = pool
//!     .create(1.5)
//!     .unwrap()
//!     .map(|v| v as &mut dyn Display);
//!
//! assert_eq!(shown.to_string(), "1.5");
//! ```
//!
//! # Foreign code
//!
//! The [`ffi`] module exposes a type-erased pool through C-compatible functions.

mod address;
mod blocks;
mod builder;
mod drop_policy;
mod error;
pub mod ffi;
mod header;
mod layout;
mod ordered;
mod pool;
mod pooled;
mod provider;
mod raw_pool;
mod tracker;
mod unordered;

pub use address::*;
pub(crate) use blocks::*;
pub use builder::{
    DEFAULT_BLOCK_CAPACITY, DEFAULT_MAX_BLOCKS, DEFAULT_OBJECT_ALIGN, MAX_BLOCKS_LIMIT, PoolBuilder,
    RawPoolBuilder,
};
pub(crate) use builder::PoolConfig;
pub use drop_policy::*;
pub use error::{CreateError, Error};
pub(crate) use header::*;
pub(crate) use layout::*;
pub(crate) use ordered::*;
pub use pool::{Iter, Pool};
pub use pooled::Pooled;
pub(crate) use pooled::drop_in_place_erased;
pub use provider::*;
pub use raw_pool::{RawIter, RawPool};
pub(crate) use tracker::Tracker;
pub use tracker::Tracking;
pub(crate) use unordered::*;
