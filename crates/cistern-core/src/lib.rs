//! Cistern core: the bucket contract.
//!
//! This crate provides the foundational building blocks shared by every
//! cistern backend: the [`Bucket`] trait and its derived operations, the
//! kinded [`CisternError`] type, key utilities, and the cold listing
//! iterator. Concrete backends live in `cistern-storage`.

pub mod bucket;
pub mod error;
pub mod iter;
pub mod key;

pub use bucket::{
    ensure_active, transfer, Bucket, CopyOptions, DiscardWriter, ObjectReader, ObjectWriter,
    SyncFlags, SyncOptions,
};
pub use error::CisternError;
pub use iter::{BucketItem, BucketIterator, ItemCursor};

/// Convenience Result type using [`CisternError`].
pub type Result<T> = std::result::Result<T, CisternError>;
