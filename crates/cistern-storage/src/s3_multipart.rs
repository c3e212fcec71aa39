//! The multipart S3 bucket.
//!
//! Shares all addressing, listing, and removal plumbing with the
//! single-request bucket; only the writer differs. The writer drives the
//! multipart protocol:
//!
//! ```text
//! INIT → CreateMultipartUpload → OPEN
//! OPEN → UploadPart × N        → OPEN    (1-based contiguous parts)
//! OPEN → CompleteMultipartUpload → DONE
//! OPEN → AbortMultipartUpload  → ABORTED (any error or cancellation)
//! ```
//!
//! Parts flush whenever the buffer reaches the part size; the final part
//! may be smaller and flushes on close. Completion requires the accumulated
//! ETags in part order.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use cistern_core::bucket::{ensure_active, DiscardWriter, ObjectReader, ObjectWriter};
use cistern_core::iter::BucketIterator;
use cistern_core::{key, Bucket, CisternError, Result, SyncFlags, SyncOptions};

use crate::s3::{S3Backend, S3Options};
use crate::sync;

/// Default part size: 10 MiB.
pub const DEFAULT_PART_SIZE: usize = 10 * 1024 * 1024;

/// S3 rejects non-final parts below 5 MiB.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// An S3 [`Bucket`] streaming writes through multipart uploads.
pub struct S3MultipartBucket {
    backend: Arc<S3Backend>,
    part_size: usize,
}

impl S3MultipartBucket {
    /// Create a bucket against the given S3 location.
    ///
    /// `opts.part_size` is clamped to the S3 minimum of 5 MiB.
    pub async fn new(ctx: &CancellationToken, opts: S3Options) -> Result<Self> {
        let part_size = opts.part_size.max(MIN_PART_SIZE);
        Ok(Self {
            backend: Arc::new(S3Backend::new(ctx, &opts).await?),
            part_size,
        })
    }
}

#[async_trait]
impl Bucket for S3MultipartBucket {
    fn name(&self) -> String {
        self.backend.name.clone()
    }

    fn flags(&self) -> &SyncFlags {
        &self.backend.flags
    }

    async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        self.backend.check(ctx).await
    }

    async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        self.backend.exists(ctx, key).await
    }

    #[instrument(skip(self, ctx), fields(key = %key))]
    async fn writer(&self, ctx: &CancellationToken, key: &str) -> Result<Box<dyn ObjectWriter>> {
        ensure_active(ctx)?;
        key::validate(key)?;
        if self.dry_run() {
            return Ok(Box::new(DiscardWriter));
        }
        let full_key = self.backend.full_key(key);
        let resp = self
            .backend
            .client
            .create_multipart_upload()
            .bucket(&self.backend.name)
            .key(&full_key)
            .send()
            .await
            .map_err(|e| CisternError::transport(format!("starting upload of {key}"), e))?;
        let upload_id = resp
            .upload_id()
            .ok_or_else(|| CisternError::transport_msg("no upload id in multipart response"))?
            .to_string();
        debug!(key = %key, upload_id = %upload_id, "multipart upload opened");
        Ok(Box::new(MultipartWriter {
            client: self.backend.client.clone(),
            bucket: self.backend.name.clone(),
            full_key,
            key: key.to_string(),
            upload_id,
            part_size: self.part_size,
            buffer: Vec::new(),
            parts: Vec::new(),
            next_part: 1,
            ctx: ctx.clone(),
        }))
    }

    async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.backend.reader(ctx, key).await
    }

    async fn list(&self, ctx: &CancellationToken, prefix: &str) -> Result<BucketIterator> {
        self.backend.list(ctx, prefix).await
    }

    async fn remove(&self, ctx: &CancellationToken, key: &str) -> Result<()> {
        let keys = [key.to_string()];
        self.backend.remove_many(ctx, &keys).await
    }

    async fn remove_many(&self, ctx: &CancellationToken, keys: &[String]) -> Result<()> {
        self.backend.remove_many(ctx, keys).await
    }

    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        sync::push(self, ctx, opts).await
    }

    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        sync::pull(self, ctx, opts).await
    }
}

struct MultipartWriter {
    client: Client,
    bucket: String,
    full_key: String,
    key: String,
    upload_id: String,
    part_size: usize,
    buffer: Vec<u8>,
    parts: Vec<CompletedPart>,
    next_part: i32,
    ctx: CancellationToken,
}

impl MultipartWriter {
    /// Upload `body` as the next part.
    async fn upload_part(&mut self, body: Vec<u8>) -> Result<()> {
        let part_number = self.next_part;
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .part_number(part_number)
            .body(aws_sdk_s3::primitives::ByteStream::from(body))
            .send()
            .await
            .map_err(|e| {
                CisternError::transport(
                    format!("uploading part {part_number} of {}", self.key),
                    e,
                )
            })?;
        self.parts.push(
            CompletedPart::builder()
                .e_tag(resp.e_tag().unwrap_or_default())
                .part_number(part_number)
                .build(),
        );
        self.next_part += 1;
        Ok(())
    }

    /// Abort the upload, discarding any parts already stored. Abort failures
    /// are logged; the error that triggered the abort is the one reported.
    async fn abort(&self) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .send()
            .await;
        match result {
            Ok(_) => debug!(key = %self.key, upload_id = %self.upload_id, "multipart upload aborted"),
            Err(e) => warn!(key = %self.key, error = %e, "failed to abort multipart upload"),
        }
    }
}

#[async_trait]
impl ObjectWriter for MultipartWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        if let Err(err) = ensure_active(&self.ctx) {
            self.abort().await;
            return Err(err);
        }
        self.buffer.extend_from_slice(buf);
        while self.buffer.len() >= self.part_size {
            let rest = self.buffer.split_off(self.part_size);
            let part = std::mem::replace(&mut self.buffer, rest);
            if let Err(err) = self.upload_part(part).await {
                self.abort().await;
                return Err(err);
            }
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<()> {
        if let Err(err) = ensure_active(&self.ctx) {
            self.abort().await;
            return Err(err);
        }
        // The final part may be under the minimum size; an empty object
        // still needs one empty part for a valid completion.
        if !self.buffer.is_empty() || self.parts.is_empty() {
            let part = std::mem::take(&mut self.buffer);
            if let Err(err) = self.upload_part(part).await {
                self.abort().await;
                return Err(err);
            }
        }
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(std::mem::take(&mut self.parts)))
            .build();
        let result = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.full_key)
            .upload_id(&self.upload_id)
            .multipart_upload(completed)
            .send()
            .await;
        match result {
            Ok(_) => {
                debug!(key = %self.key, upload_id = %self.upload_id, "multipart upload completed");
                Ok(())
            }
            Err(e) => {
                let err =
                    CisternError::transport(format!("completing upload of {}", self.key), e);
                self.abort().await;
                Err(err)
            }
        }
    }
}
