//! The listing iterator contract.
//!
//! Listings are cold cursors: nothing is fetched until [`BucketIterator::next`]
//! is called, each call re-checks cancellation, and at most one backend page
//! is held in memory at a time. Items are immutable point-in-time snapshots
//! with no consistency guarantee across pages.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::Result;

/// A single listing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketItem {
    key: String,
    bucket: String,
    hash: Option<String>,
}

impl BucketItem {
    /// Create an item without a content hash.
    pub fn new(key: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            bucket: bucket.into(),
            hash: None,
        }
    }

    /// Create an item carrying a backend content hash (an ETag equivalent).
    pub fn with_hash(
        key: impl Into<String>,
        bucket: impl Into<String>,
        hash: Option<String>,
    ) -> Self {
        Self {
            key: key.into(),
            bucket: bucket.into(),
            hash,
        }
    }

    /// The object key, relative to the bucket's prefix.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The owning bucket's name attribute.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Content hash where the backend provides one, `None` elsewhere.
    pub fn hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }
}

/// Backend-specific cursor driving a [`BucketIterator`].
#[async_trait]
pub trait ItemCursor: Send {
    /// Advance to the next item, or `None` when the listing is exhausted.
    async fn next(&mut self, ctx: &CancellationToken) -> Result<Option<BucketItem>>;
}

/// A cold cursor over bucket items in lexicographic key order.
pub struct BucketIterator {
    cursor: Box<dyn ItemCursor>,
}

impl BucketIterator {
    /// Wrap a backend cursor.
    pub fn new(cursor: Box<dyn ItemCursor>) -> Self {
        Self { cursor }
    }

    /// An iterator over nothing.
    pub fn empty() -> Self {
        Self {
            cursor: Box::new(EmptyCursor),
        }
    }

    /// Advance to the next item, or `None` when the listing is exhausted.
    pub async fn next(&mut self, ctx: &CancellationToken) -> Result<Option<BucketItem>> {
        self.cursor.next(ctx).await
    }

    /// Drain the cursor, collecting every remaining item.
    pub async fn collect(mut self, ctx: &CancellationToken) -> Result<Vec<BucketItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next(ctx).await? {
            items.push(item);
        }
        Ok(items)
    }
}

struct EmptyCursor;

#[async_trait]
impl ItemCursor for EmptyCursor {
    async fn next(&mut self, _ctx: &CancellationToken) -> Result<Option<BucketItem>> {
        Ok(None)
    }
}
