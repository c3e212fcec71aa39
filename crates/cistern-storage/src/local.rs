//! Filesystem-backed bucket.
//!
//! [`LocalBucket`] maps keys to files under `<path>/<prefix>/` using the
//! host separator, or a literal `/` when slash mode is set (useful for
//! exercising cross-platform key handling on Windows). Intermediate
//! directories are created with mode 0700 and files with mode 0600.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use cistern_core::bucket::{ensure_active, DiscardWriter, ObjectReader, ObjectWriter};
use cistern_core::iter::{BucketItem, BucketIterator, ItemCursor};
use cistern_core::{key, Bucket, CisternError, Result, SyncFlags, SyncOptions};

use crate::sync;

/// Options for constructing a [`LocalBucket`].
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    /// Root directory backing the bucket.
    pub path: PathBuf,
    /// Key prefix scoping every operation.
    pub prefix: String,
    /// Force `/` as the path separator instead of the host separator.
    pub use_slash_separator: bool,
    /// Mutating operations succeed without persisting anything.
    pub dry_run: bool,
    /// Reconcile remote deletions after push.
    pub delete_on_push: bool,
    /// Reconcile local deletions after pull.
    pub delete_on_pull: bool,
}

/// A [`Bucket`] backed by the local filesystem.
#[derive(Debug)]
pub struct LocalBucket {
    path: PathBuf,
    prefix: String,
    use_slash: bool,
    flags: SyncFlags,
}

impl LocalBucket {
    /// Create a bucket rooted at `opts.path`.
    ///
    /// No filesystem access happens here; [`Bucket::check`] verifies the
    /// root exists.
    pub fn new(opts: LocalOptions) -> Self {
        Self {
            path: opts.path,
            prefix: opts.prefix,
            use_slash: opts.use_slash_separator,
            flags: SyncFlags::new(opts.dry_run, opts.delete_on_push, opts.delete_on_pull),
        }
    }

    /// Full filesystem path for a key.
    fn key_to_path(&self, key: &str) -> PathBuf {
        let joined = key::join([self.prefix.as_str(), key]);
        if self.use_slash {
            self.path.join(joined)
        } else {
            self.path.join(key::to_rel_path(&joined))
        }
    }

    /// The directory holding every key of this bucket.
    fn root(&self) -> PathBuf {
        if self.prefix.is_empty() {
            self.path.clone()
        } else {
            self.path.join(key::to_rel_path(&self.prefix))
        }
    }
}

#[async_trait]
impl Bucket for LocalBucket {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn flags(&self) -> &SyncFlags {
        &self.flags
    }

    fn join(&self, parts: &[&str]) -> String {
        if self.use_slash {
            key::join(parts.iter().copied())
        } else {
            let joined: PathBuf = parts
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| key::to_rel_path(p))
                .collect();
            joined.display().to_string()
        }
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        ensure_active(ctx)?;
        let meta = fs::metadata(&self.path).await.map_err(|e| {
            CisternError::io(format!("bucket path {} is not usable", self.path.display()), e)
        })?;
        if !meta.is_dir() {
            return Err(CisternError::io_msg(format!(
                "bucket path {} is not a directory",
                self.path.display()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        ensure_active(ctx)?;
        key::validate(key)?;
        match fs::metadata(self.key_to_path(key)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CisternError::io(format!("checking {key}"), e)),
        }
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        ensure_active(ctx)?;
        key::validate(key)?;
        if self.dry_run() {
            return Ok(Box::new(DiscardWriter));
        }
        let path = self.key_to_path(key);
        if let Some(parent) = path.parent() {
            create_dir_private(parent)
                .await
                .map_err(|e| CisternError::io("creating base directories", e))?;
        }
        let file = open_private(&path)
            .await
            .map_err(|e| CisternError::io(format!("opening file {}", path.display()), e))?;
        debug!("opened writer for {}", key);
        Ok(Box::new(LocalWriter {
            file,
            ctx: ctx.clone(),
        }))
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        ensure_active(ctx)?;
        key::validate(key)?;
        let path = self.key_to_path(key);
        let file = fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                CisternError::not_found(key)
            } else {
                CisternError::io(format!("opening file {}", path.display()), e)
            }
        })?;
        Ok(Box::new(file))
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<BucketIterator> {
        ensure_active(ctx)?;
        Ok(BucketIterator::new(Box::new(LocalWalkCursor {
            bucket_name: self.name(),
            root: self.root(),
            filter: prefix.to_string(),
            stack: Vec::new(),
            started: false,
        })))
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        ensure_active(ctx)?;
        key::validate(key)?;
        if self.dry_run() {
            return Ok(());
        }
        let path = self.key_to_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CisternError::not_found(key))
            }
            Err(e) => Err(CisternError::io(
                format!("removing file {}", path.display()),
                e,
            )),
        }
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        let mut failed = Vec::new();
        for key in keys {
            ensure_active(ctx)?;
            if self.remove(ctx, key).await.is_err() {
                failed.push(key.clone());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CisternError::Removal { keys: failed })
        }
    }

    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        sync::push(self, ctx, opts).await
    }

    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        sync::pull(self, ctx, opts).await
    }
}

/// Create a directory chain with owner-only permissions.
async fn create_dir_private(path: &std::path::Path) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o700);
    builder.create(path).await
}

/// Open a file for writing with owner-only permissions, truncating any
/// existing content.
async fn open_private(path: &std::path::Path) -> std::io::Result<fs::File> {
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true);
    #[cfg(unix)]
    opts.mode(0o600);
    opts.open(path).await
}

struct LocalWriter {
    file: fs::File,
    ctx: CancellationToken,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        ensure_active(&self.ctx)?;
        self.file
            .write_all(buf)
            .await
            .map_err(|e| CisternError::io("copying data to file", e))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| CisternError::io("flushing file", e))
    }
}

/// Depth-first sorted walk over the bucket root, yielding one file per step.
///
/// Directories are read lazily: descending into one costs a single
/// `read_dir`, and cancellation is re-checked at every directory boundary.
struct LocalWalkCursor {
    bucket_name: String,
    root: PathBuf,
    filter: String,
    stack: Vec<std::vec::IntoIter<PathBuf>>,
    started: bool,
}

#[async_trait]
impl ItemCursor for LocalWalkCursor {
    async fn next(&mut self, ctx: &CancellationToken) -> Result<Option<BucketItem>> {
        if !self.started {
            self.started = true;
            ensure_active(ctx)?;
            match read_sorted(&self.root).await? {
                Some(entries) => self.stack.push(entries),
                None => return Ok(None),
            }
        }
        loop {
            ensure_active(ctx)?;
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };
            let Some(path) = frame.next() else {
                self.stack.pop();
                continue;
            };
            let meta = fs::symlink_metadata(&path)
                .await
                .map_err(|e| CisternError::io(format!("inspecting {}", path.display()), e))?;
            if meta.is_dir() {
                if let Some(entries) = read_sorted(&path).await? {
                    self.stack.push(entries);
                }
                continue;
            }
            let rel = path.strip_prefix(&self.root).map_err(|e| {
                CisternError::io_msg(format!("stripping walk root: {e}"))
            })?;
            let key = key::from_rel_path(rel);
            if key.starts_with(&self.filter) {
                return Ok(Some(BucketItem::new(key, self.bucket_name.clone())));
            }
        }
    }
}

/// Read a directory and return its entries sorted by name, or `None` when
/// the directory does not exist.
async fn read_sorted(dir: &std::path::Path) -> Result<Option<std::vec::IntoIter<PathBuf>>> {
    let mut reader = match fs::read_dir(dir).await {
        Ok(reader) => reader,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(CisternError::io(
                format!("reading directory {}", dir.display()),
                e,
            ))
        }
    };
    let mut entries = Vec::new();
    while let Some(entry) = reader
        .next_entry()
        .await
        .map_err(|e| CisternError::io(format!("reading directory {}", dir.display()), e))?
    {
        entries.push(entry.path());
    }
    entries.sort();
    Ok(Some(entries.into_iter()))
}
