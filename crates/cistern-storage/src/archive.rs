//! The archive bucket: whole-tree sync as a single tar object.
//!
//! Push serializes the local tree into one tar stream written through the
//! wrapped multipart bucket at `<remote>/synced-archive`; Pull reads the
//! same object back and untars it. Entry names are forward-slash paths
//! relative to the local root, and entries carry a zero mtime so pushing
//! identical inputs produces a byte-equivalent archive.
//!
//! Everything outside push/pull forwards to the wrapped bucket, so callers
//! can address the archive object directly.

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use regex::Regex;
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cistern_core::bucket::{ensure_active, ObjectReader, ObjectWriter};
use cistern_core::iter::BucketIterator;
use cistern_core::{key, Bucket, CisternError, Result, SyncFlags, SyncOptions};

use crate::s3::S3Options;
use crate::s3_multipart::S3MultipartBucket;
use crate::sync;

/// Key of the single archive object under the sync prefix.
pub const SYNC_ARCHIVE_NAME: &str = "synced-archive";

/// A [`Bucket`] whose push/pull materialize whole directory trees as one
/// tar object on S3.
pub struct S3ArchiveBucket {
    inner: S3MultipartBucket,
}

impl S3ArchiveBucket {
    /// Create an archive bucket against the given S3 location.
    pub async fn new(ctx: &CancellationToken, opts: S3Options) -> Result<Self> {
        Ok(Self {
            inner: S3MultipartBucket::new(ctx, opts).await?,
        })
    }

    fn archive_key(&self, remote: &str) -> String {
        key::join([remote, SYNC_ARCHIVE_NAME])
    }
}

#[async_trait]
impl Bucket for S3ArchiveBucket {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn flags(&self) -> &SyncFlags {
        self.inner.flags()
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        self.inner.check(ctx).await
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        self.inner.exists(ctx, key).await
    }

    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        self.inner.writer(ctx, key).await
    }

    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.inner.reader(ctx, key).await
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<BucketIterator> {
        self.inner.list(ctx, prefix).await
    }

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        self.inner.remove(ctx, key).await
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        self.inner.remove_many(ctx, keys).await
    }

    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        let exclude = sync::compile_exclude(opts)?;
        ensure_active(ctx)?;
        let files = sync::walk_local_tree(ctx, &opts.local).await?;
        let mut writer = self.inner.writer(ctx, &self.archive_key(&opts.remote)).await?;
        let mut archived = 0usize;
        for rel in files {
            ensure_active(ctx)?;
            if let Some(re) = &exclude {
                if re.is_match(&rel) {
                    continue;
                }
            }
            let path = opts.local.join(key::to_rel_path(&rel));
            append_file_entry(&mut *writer, ctx, &rel, &path).await?;
            archived += 1;
        }
        // Two zero blocks terminate a tar stream.
        writer.write_all(&[0u8; 1024]).await?;
        writer.close().await?;
        debug!(count = archived, "pushed archive");
        Ok(())
    }

    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        let exclude = sync::compile_exclude(opts)?;
        ensure_active(ctx)?;
        let reader = self.inner.reader(ctx, &self.archive_key(&opts.remote)).await?;
        let local = opts.local.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            unpack_archive(SyncIoBridge::new(reader), &local, exclude.as_ref(), &ctx)
        })
        .await
        .map_err(|e| CisternError::io_msg(format!("archive unpack task failed: {e}")))?
    }
}

/// Write one regular file into the tar stream.
async fn append_file_entry(
    writer: &mut dyn ObjectWriter,
    ctx: &CancellationToken,
    rel: &str,
    path: &Path,
) -> Result<()> {
    let meta = fs::metadata(path)
        .await
        .map_err(|e| CisternError::io(format!("inspecting {}", path.display()), e))?;
    let size = meta.len();

    let mut header = tar::Header::new_gnu();
    header
        .set_path(rel)
        .map_err(|e| CisternError::io(format!("archiving {rel}"), e))?;
    header.set_size(size);
    header.set_mode(file_mode(&meta));
    header.set_mtime(0);
    header.set_cksum();
    writer.write_all(header.as_bytes()).await?;

    let mut file = fs::File::open(path)
        .await
        .map_err(|e| CisternError::io(format!("opening file {}", path.display()), e))?;
    let mut buf = vec![0u8; 64 * 1024];
    let mut written = 0u64;
    loop {
        ensure_active(ctx)?;
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| CisternError::io(format!("reading {}", path.display()), e))?;
        if n == 0 {
            break;
        }
        written += n as u64;
        writer.write_all(&buf[..n]).await?;
    }
    if written != size {
        return Err(CisternError::io_msg(format!(
            "{} changed while archiving: expected {size} bytes, read {written}",
            path.display()
        )));
    }

    // Entries are padded to the 512-byte block boundary.
    let partial = (size % 512) as usize;
    if partial != 0 {
        writer.write_all(&vec![0u8; 512 - partial]).await?;
    }
    Ok(())
}

#[cfg(unix)]
fn file_mode(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

/// Untar a stream into `local`, skipping entries whose basename matches
/// `exclude`.
fn unpack_archive(
    reader: impl Read,
    local: &Path,
    exclude: Option<&Regex>,
    ctx: &CancellationToken,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| CisternError::io("opening archive", e))?;
    for entry in entries {
        if ctx.is_cancelled() {
            return Err(CisternError::Cancelled);
        }
        let mut entry = entry.map_err(|e| CisternError::io("reading archive entry", e))?;
        let rel: PathBuf = entry
            .path()
            .map_err(|e| CisternError::io("reading archive entry name", e))?
            .into_owned();
        let rel_key = key::from_rel_path(&rel);
        if let Some(re) = exclude {
            if re.is_match(key::base_name(&rel_key)) {
                continue;
            }
        }
        let dest = local.join(&rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CisternError::io(format!("creating base directories for {rel_key}"), e)
            })?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| CisternError::io(format!("unpacking {rel_key}"), e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Collects writes into a shared buffer for codec round trips.
    struct BufferWriter(Arc<Mutex<Vec<u8>>>);

    #[async_trait]
    impl ObjectWriter for BufferWriter {
        async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(())
        }

        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    fn write_file(root: &Path, rel: &str, data: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    async fn archive_tree(ctx: &CancellationToken, root: &Path, rels: &[&str]) -> Vec<u8> {
        let data = Arc::new(Mutex::new(Vec::new()));
        let mut writer = BufferWriter(data.clone());
        for rel in rels {
            append_file_entry(&mut writer, ctx, rel, &root.join(key::to_rel_path(rel)))
                .await
                .unwrap();
        }
        writer.write_all(&[0u8; 1024]).await.unwrap();
        Box::new(writer).close().await.unwrap();
        Arc::try_unwrap(data).unwrap().into_inner().unwrap()
    }

    #[tokio::test]
    async fn test_archive_round_trip() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let ctx = CancellationToken::new();
        write_file(src.path(), "f1", "first file");
        write_file(src.path(), "nested/f2", "second file");

        let bytes = archive_tree(&ctx, src.path(), &["f1", "nested/f2"]).await;
        unpack_archive(std::io::Cursor::new(bytes), dst.path(), None, &ctx).unwrap();

        assert_eq!(
            std::fs::read_to_string(dst.path().join("f1")).unwrap(),
            "first file"
        );
        assert_eq!(
            std::fs::read_to_string(dst.path().join("nested/f2")).unwrap(),
            "second file"
        );
    }

    #[tokio::test]
    async fn test_archive_is_deterministic() {
        let src = TempDir::new().unwrap();
        let ctx = CancellationToken::new();
        write_file(src.path(), "f1", "first file");
        write_file(src.path(), "f2", "second file");

        let first = archive_tree(&ctx, src.path(), &["f1", "f2"]).await;
        let second = archive_tree(&ctx, src.path(), &["f1", "f2"]).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_unpack_honors_excludes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let ctx = CancellationToken::new();
        write_file(src.path(), "keep.txt", "keep");
        write_file(src.path(), "python.py", "exclude");

        let bytes = archive_tree(&ctx, src.path(), &["keep.txt", "python.py"]).await;
        let exclude = Regex::new(r".*\.py").unwrap();
        unpack_archive(
            std::io::Cursor::new(bytes),
            dst.path(),
            Some(&exclude),
            &ctx,
        )
        .unwrap();

        assert!(dst.path().join("keep.txt").exists());
        assert!(!dst.path().join("python.py").exists());
    }
}
