//! GridFS-backed bucket.
//!
//! Objects live as chunked files in a MongoDB GridFS bucket scoped by a
//! `{database, name, prefix}` triple; keys become `<prefix>/<key>`
//! filenames. Writers upload a new revision and supersede prior revisions
//! on close, so reads always observe the latest put. No checksumming.

use async_trait::async_trait;
use futures::io::AsyncWriteExt as FuturesAsyncWriteExt;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson};
use mongodb::gridfs::{FilesCollectionDocument, GridFsBucket as MongoGridFsBucket};
use mongodb::options::{GridFsBucketOptions, GridFsFindOptions};
use mongodb::Client;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use cistern_core::bucket::{ensure_active, DiscardWriter, ObjectReader, ObjectWriter};
use cistern_core::iter::{BucketItem, BucketIterator, ItemCursor};
use cistern_core::{key, Bucket, CisternError, Result, SyncFlags, SyncOptions};

use crate::sync;

/// Options for constructing a [`GridFsBucket`].
#[derive(Debug, Clone, Default)]
pub struct GridFsOptions {
    /// Database holding the GridFS collections.
    pub database: String,
    /// GridFS bucket name (the collection name root).
    pub name: String,
    /// Key prefix scoping every operation.
    pub prefix: String,
    /// Mutating operations succeed without persisting anything.
    pub dry_run: bool,
    /// Reconcile remote deletions after push.
    pub delete_on_push: bool,
    /// Reconcile local deletions after pull.
    pub delete_on_pull: bool,
}

/// A [`Bucket`] over a MongoDB GridFS chunked-file collection.
pub struct GridFsBucket {
    client: Client,
    database: String,
    name: String,
    prefix: String,
    flags: SyncFlags,
}

impl GridFsBucket {
    /// Create a bucket over an existing client.
    pub async fn new(ctx: &CancellationToken, client: Client, opts: GridFsOptions) -> Result<Self> {
        ensure_active(ctx)?;
        if opts.database.is_empty() {
            return Err(CisternError::invalid_input("database must not be empty"));
        }
        if opts.name.is_empty() {
            return Err(CisternError::invalid_input("bucket name must not be empty"));
        }
        Ok(Self {
            client,
            database: opts.database,
            name: opts.name,
            prefix: opts.prefix,
            flags: SyncFlags::new(opts.dry_run, opts.delete_on_push, opts.delete_on_pull),
        })
    }

    /// Connect to `uri` and create a bucket over the new client.
    pub async fn connect(
        ctx: &CancellationToken,
        uri: &str,
        opts: GridFsOptions,
    ) -> Result<Self> {
        ensure_active(ctx)?;
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| CisternError::transport(format!("connecting to {uri}"), e))?;
        Self::new(ctx, client, opts).await
    }

    fn bucket(&self) -> MongoGridFsBucket {
        let mut opts = GridFsBucketOptions::default();
        opts.bucket_name = Some(self.name.clone());
        self.client.database(&self.database).gridfs_bucket(opts)
    }

    /// The stored filename for a bucket-relative key.
    fn full_name(&self, key: &str) -> String {
        key::join([self.prefix.as_str(), key])
    }

    /// Every revision stored under a filename.
    async fn revisions(&self, filename: &str) -> Result<Vec<FilesCollectionDocument>> {
        let cursor = self
            .bucket()
            .find(doc! { "filename": filename }, None)
            .await
            .map_err(|e| CisternError::transport(format!("finding {filename}"), e))?;
        cursor
            .try_collect()
            .await
            .map_err(|e| CisternError::transport(format!("finding {filename}"), e))
    }
}

fn map_read_error(key: &str, e: mongodb::error::Error) -> CisternError {
    use mongodb::error::{ErrorKind, GridFsErrorKind};
    if matches!(
        &*e.kind,
        ErrorKind::GridFs(GridFsErrorKind::FileNotFound { .. })
    ) {
        CisternError::not_found(key)
    } else {
        CisternError::transport(format!("reading {key}"), e)
    }
}

#[async_trait]
impl Bucket for GridFsBucket {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn flags(&self) -> &SyncFlags {
        &self.flags
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        ensure_active(ctx)?;
        self.client
            .database(&self.database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| {
                CisternError::transport(format!("pinging database {}", self.database), e)
            })?;
        Ok(())
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        ensure_active(ctx)?;
        key::validate(key)?;
        let revisions = self.revisions(&self.full_name(key)).await?;
        Ok(!revisions.is_empty())
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        ensure_active(ctx)?;
        key::validate(key)?;
        if self.dry_run() {
            return Ok(Box::new(DiscardWriter));
        }
        let filename = self.full_name(key);
        let bucket = self.bucket();
        let stream = bucket.open_upload_stream(&filename, None);
        let id = stream.id().clone();
        Ok(Box::new(GridFsWriter {
            stream,
            bucket,
            filename,
            id,
            ctx: ctx.clone(),
        }))
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        ensure_active(ctx)?;
        key::validate(key)?;
        let stream = self
            .bucket()
            .open_download_stream_by_name(self.full_name(key), None)
            .await
            .map_err(|e| map_read_error(key, e))?;
        Ok(Box::new(stream.compat()))
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<BucketIterator> {
        ensure_active(ctx)?;
        let full_prefix = self.full_name(prefix);
        let filter = doc! {
            "filename": { "$regex": format!("^{}", regex::escape(&full_prefix)) }
        };
        let mut opts = GridFsFindOptions::default();
        opts.sort = Some(doc! { "filename": 1 });
        let cursor = self
            .bucket()
            .find(filter, opts)
            .await
            .map_err(|e| CisternError::transport(format!("listing prefix {full_prefix}"), e))?;
        Ok(BucketIterator::new(Box::new(GridFsCursor {
            cursor,
            bucket_name: self.name.clone(),
            strip: self.prefix.clone(),
        })))
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        ensure_active(ctx)?;
        key::validate(key)?;
        if self.dry_run() {
            return Ok(());
        }
        let filename = self.full_name(key);
        let bucket = self.bucket();
        for revision in self.revisions(&filename).await? {
            ensure_active(ctx)?;
            bucket
                .delete(revision.id.clone())
                .await
                .map_err(|e| CisternError::transport(format!("removing {key}"), e))?;
        }
        debug!("removed {}", key);
        Ok(())
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

/// Streams into a new GridFS revision; on close, commits it and deletes the
/// revisions it supersedes.
struct GridFsWriter {
    stream: mongodb::gridfs::GridFsUploadStream,
    bucket: MongoGridFsBucket,
    filename: String,
    id: Bson,
    ctx: CancellationToken,
}

#[async_trait]
impl ObjectWriter for GridFsWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        ensure_active(&self.ctx)?;
        FuturesAsyncWriteExt::write_all(&mut self.stream, buf)
            .await
            .map_err(|e| CisternError::transport(format!("writing {}", self.filename), e))
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        ensure_active(&self.ctx)?;
        FuturesAsyncWriteExt::close(&mut self.stream)
            .await
            .map_err(|e| CisternError::transport(format!("committing {}", self.filename), e))?;

        // Supersede older revisions so reads and listings see one file.
        let cursor = self
            .bucket
            .find(doc! { "filename": &self.filename }, None)
            .await
            .map_err(|e| CisternError::transport(format!("finding {}", self.filename), e))?;
        let revisions: Vec<FilesCollectionDocument> = cursor
            .try_collect()
            .await
            .map_err(|e| CisternError::transport(format!("finding {}", self.filename), e))?;
        for revision in revisions {
            if revision.id == self.id {
                continue;
            }
            self.bucket
                .delete(revision.id.clone())
                .await
                .map_err(|e| {
                    CisternError::transport(format!("pruning revision of {}", self.filename), e)
                })?;
        }
        Ok(())
    }
}

struct GridFsCursor {
    cursor: mongodb::Cursor<FilesCollectionDocument>,
    bucket_name: String,
    strip: String,
}

#[async_trait]
impl ItemCursor for GridFsCursor {
    async fn next(&mut self, ctx: &CancellationToken) -> Result<Option<BucketItem>> {
        loop {
            ensure_active(ctx)?;
            let Some(doc) = self
                .cursor
                .try_next()
                .await
                .map_err(|e| CisternError::transport("listing files", e))?
            else {
                return Ok(None);
            };
            let Some(filename) = doc.filename else {
                continue;
            };
            return Ok(Some(BucketItem::new(
                key::strip_prefix(&filename, &self.strip),
                self.bucket_name.clone(),
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_validates_options() {
        let ctx = CancellationToken::new();
        // A client handle can be built without any server round-trip.
        let client = Client::with_uri_str("mongodb://localhost:27017")
            .await
            .unwrap();

        let missing_db = GridFsBucket::new(
            &ctx,
            client.clone(),
            GridFsOptions {
                name: "files".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(
            missing_db.err(),
            Some(CisternError::InvalidInput { .. })
        ));

        let missing_name = GridFsBucket::new(
            &ctx,
            client,
            GridFsOptions {
                database: "db".into(),
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(
            missing_name.err(),
            Some(CisternError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn test_full_name_applies_prefix() {
        let ctx = CancellationToken::new();
        let client = Client::with_uri_str("mongodb://localhost:27017")
            .await
            .unwrap();
        let bucket = GridFsBucket::new(
            &ctx,
            client,
            GridFsOptions {
                database: "db".into(),
                name: "files".into(),
                prefix: "team".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(bucket.full_name("a/b"), "team/a/b");
        assert_eq!(bucket.full_name(""), "team");
    }
}
