//! The Bucket trait — the single interface for all storage backends.
//!
//! Every operation goes through this trait. Implementations include the
//! local filesystem, S3 in single-request and multipart variants, a tar
//! archive bucket layered over S3, and MongoDB GridFS. Application code
//! never talks to a backend directly.
//!
//! Derived operations (`put`, `get`, `upload`, `download`, `copy`,
//! `remove_matching`, `remove_prefix`) have default implementations over the
//! primitive ones, so backends only provide the operations that genuinely
//! differ. Every mutating operation honors the bucket's dry-run flag through
//! a single early-exit point: `writer` hands out a [`DiscardWriter`] and
//! `remove`/`remove_many` return before touching the backend.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use regex::Regex;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::CisternError;
use crate::iter::BucketIterator;
use crate::key;
use crate::Result;

/// A streaming reader handed out by [`Bucket::reader`] and [`Bucket::get`].
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Fail with [`CisternError::Cancelled`] if the token has been cancelled.
///
/// Backends call this before and after every suspension point; the sync
/// engine calls it between objects.
pub fn ensure_active(ctx: &CancellationToken) -> Result<()> {
    if ctx.is_cancelled() {
        return Err(CisternError::Cancelled);
    }
    Ok(())
}

/// Per-bucket behavior flags.
///
/// Read on every call and mutated only through the setter surface on
/// [`Bucket`]. Updates are visible to subsequent operations; they are not
/// synchronized with in-flight ones.
#[derive(Debug, Default)]
pub struct SyncFlags {
    dry_run: AtomicBool,
    delete_on_push: AtomicBool,
    delete_on_pull: AtomicBool,
}

impl SyncFlags {
    /// Create flags with the given initial values.
    pub fn new(dry_run: bool, delete_on_push: bool, delete_on_pull: bool) -> Self {
        Self {
            dry_run: AtomicBool::new(dry_run),
            delete_on_push: AtomicBool::new(delete_on_push),
            delete_on_pull: AtomicBool::new(delete_on_pull),
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run.load(Ordering::Relaxed)
    }

    pub fn set_dry_run(&self, on: bool) {
        self.dry_run.store(on, Ordering::Relaxed);
    }

    pub fn delete_on_push(&self) -> bool {
        self.delete_on_push.load(Ordering::Relaxed)
    }

    pub fn set_delete_on_push(&self, on: bool) {
        self.delete_on_push.store(on, Ordering::Relaxed);
    }

    pub fn delete_on_pull(&self) -> bool {
        self.delete_on_pull.load(Ordering::Relaxed)
    }

    pub fn set_delete_on_pull(&self, on: bool) {
        self.delete_on_pull.store(on, Ordering::Relaxed);
    }
}

/// Options for [`Bucket::push`] and [`Bucket::pull`].
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// The local side of the sync: a filesystem directory.
    pub local: PathBuf,
    /// The remote side: a key prefix inside the bucket. Empty means the
    /// bucket root (the bucket's own prefix still applies).
    pub remote: String,
    /// Optional regular expression excluding matches from the transfer:
    /// matched against the key's final segment on pull and against the
    /// relative local path on push. An invalid expression fails the
    /// operation before any I/O.
    pub exclude: Option<String>,
}

/// Options for [`Bucket::copy`].
///
/// The destination may be the same bucket instance. Dry-run is a property of
/// writes to a bucket, not reads from it: a dry-run destination swallows the
/// copy, while a dry-run source still materializes a live destination.
pub struct CopyOptions<'a> {
    /// The key to read from this bucket.
    pub source_key: String,
    /// The key to create in the destination bucket.
    pub destination_key: String,
    /// The bucket receiving the copy.
    pub destination: &'a dyn Bucket,
}

/// A scoped streaming writer returned by [`Bucket::writer`].
///
/// Data is buffered or streamed backend-side and committed by `close`.
/// Dropping a writer without closing leaves the target key unwritten on
/// remote backends and in an undefined local-only state on the filesystem.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append a chunk of data.
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;

    /// Commit the object. Consumes the writer; no further writes are
    /// possible afterwards.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Writer handed out by dry-run buckets: accepts and drops all data.
pub struct DiscardWriter;

#[async_trait]
impl ObjectWriter for DiscardWriter {
    async fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Pump a reader into a writer and commit it.
pub async fn transfer(
    ctx: &CancellationToken,
    source: &mut (dyn AsyncRead + Send + Unpin),
    mut writer: Box<dyn ObjectWriter>,
) -> Result<()> {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        ensure_active(ctx)?;
        let n = source
            .read(&mut buf)
            .await
            .map_err(|e| CisternError::io("copying data to writer", e))?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
    }
    writer.close().await
}

/// The uniform storage interface.
///
/// All operations take a cancellation token and fail promptly once it is
/// cancelled. Implementations must be `Send + Sync`; concurrent calls on
/// distinct keys are safe, and the only shared mutable state is the flag
/// surface in [`SyncFlags`].
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Backend-specific bucket name attribute: a filesystem path, a remote
    /// bucket identifier, or a GridFS bucket name.
    fn name(&self) -> String;

    /// The flag surface backing the dry-run and delete-on-sync setters.
    fn flags(&self) -> &SyncFlags;

    /// Verify the backend is reachable. No side effects on success.
    async fn check(&self, ctx: &CancellationToken) -> Result<()>;

    /// Whether an object exists at `key`. A transport failure is an error,
    /// not `false`.
    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool>;

    /// Open a streaming writer for `key`. The object becomes visible only
    /// when the writer is closed.
    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>>;

    /// Open a streaming reader for `key`.
    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader>;

    /// List keys under `prefix` in lexicographic byte order.
    ///
    /// The returned iterator is cold and never holds more than one backend
    /// page; an already-cancelled token fails here, before any I/O.
    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<BucketIterator>;

    /// Remove a single object.
    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()>;

    /// Remove a batch of objects. Backends with a wire-level batch delete
    /// chunk the keys; per-key failures surface as one
    /// [`CisternError::Removal`] naming them all.
    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()>;

    /// Sync a local directory tree into the bucket.
    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()>;

    /// Sync the bucket into a local directory tree.
    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()>;

    /// Join key fragments into a canonical key for this bucket.
    fn join(&self, parts: &[&str]) -> String {
        key::join(parts.iter().copied())
    }

    fn dry_run(&self) -> bool {
        self.flags().dry_run()
    }

    fn set_dry_run(&self, on: bool) {
        self.flags().set_dry_run(on);
    }

    fn delete_on_push(&self) -> bool {
        self.flags().delete_on_push()
    }

    fn set_delete_on_push(&self, on: bool) {
        self.flags().set_delete_on_push(on);
    }

    fn delete_on_pull(&self) -> bool {
        self.flags().delete_on_pull()
    }

    fn set_delete_on_pull(&self, on: bool) {
        self.flags().set_delete_on_pull(on);
    }

    /// Set both delete-on-sync flags at once.
    fn set_delete_on_sync(&self, on: bool) {
        self.set_delete_on_push(on);
        self.set_delete_on_pull(on);
    }

    /// Write the contents of `source` to `key`.
    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<()> {
        let writer = self.writer(ctx, key).await?;
        transfer(ctx, source, writer).await
    }

    /// Read the object at `key`.
    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.reader(ctx, key).await
    }

    /// Write a local file to `key`.
    async fn upload(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        ensure_active(ctx)?;
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| CisternError::io(format!("opening file {}", path.display()), e))?;
        self.put(ctx, key, &mut file).await
    }

    /// Read the object at `key` into a local file, creating intermediate
    /// directories as needed.
    async fn download(&self, ctx: &CancellationToken, key: &str, path: &Path) -> Result<()> {
        let mut reader = self.reader(ctx, key).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                CisternError::io(
                    format!("creating base directories for {}", path.display()),
                    e,
                )
            })?;
        }
        let mut file = fs::File::create(path)
            .await
            .map_err(|e| CisternError::io(format!("opening file {}", path.display()), e))?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| CisternError::from_io(key, e))?;
        file.flush()
            .await
            .map_err(|e| CisternError::io(format!("flushing {}", path.display()), e))?;
        Ok(())
    }

    /// Duplicate an object into another (or the same) bucket.
    async fn copy(&self, ctx: &CancellationToken, opts: CopyOptions<'_>) -> Result<()> {
        let mut reader = self.reader(ctx, &opts.source_key).await?;
        let writer = opts.destination.writer(ctx, &opts.destination_key).await?;
        transfer(ctx, &mut *reader, writer).await
    }

    /// Remove every key matching `expression`.
    ///
    /// The expression is compiled before anything is listed, so an invalid
    /// pattern fails without touching the backend.
    async fn remove_matching(&self, ctx: &CancellationToken, expression: &str) -> Result<()> {
        let re = Regex::new(expression).map_err(|e| {
            CisternError::invalid_input(format!("invalid match expression '{expression}': {e}"))
        })?;
        let mut iter = self.list(ctx, "").await?;
        let mut matched = Vec::new();
        while let Some(item) = iter.next(ctx).await? {
            if re.is_match(item.key()) {
                matched.push(item.key().to_string());
            }
        }
        if matched.is_empty() {
            return Ok(());
        }
        self.remove_many(ctx, &matched).await
    }

    /// Remove every key starting with `prefix`.
    async fn remove_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()> {
        self.remove_matching(ctx, &format!("^{}", regex::escape(prefix)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_round_trip() {
        let flags = SyncFlags::default();
        assert!(!flags.dry_run());
        flags.set_dry_run(true);
        assert!(flags.dry_run());
        flags.set_delete_on_push(true);
        flags.set_delete_on_pull(true);
        assert!(flags.delete_on_push());
        assert!(flags.delete_on_pull());
    }

    #[test]
    fn test_ensure_active() {
        let ctx = CancellationToken::new();
        assert!(ensure_active(&ctx).is_ok());
        ctx.cancel();
        assert!(matches!(ensure_active(&ctx), Err(CisternError::Cancelled)));
    }

    #[tokio::test]
    async fn test_discard_writer_accepts_everything() {
        let mut writer = DiscardWriter;
        writer.write_all(b"anything").await.unwrap();
        Box::new(writer).close().await.unwrap();
    }
}
