//! S3-backed buckets: shared client plumbing, the single-request bucket,
//! and standalone request helpers (presigned GET URLs, head-object).
//!
//! The single-request bucket issues one `PutObject` per write and suits
//! small objects; [`crate::s3_multipart::S3MultipartBucket`] shares all the
//! plumbing here but streams large objects through the multipart protocol.
//!
//! Retries are delegated to the SDK: `max_retries` configures the standard
//! retry policy, which backs off exponentially on throttling and 5xx
//! responses and treats other 4xx responses as terminal.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use aws_config::retry::RetryConfig;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use cistern_core::bucket::{ensure_active, DiscardWriter, ObjectReader, ObjectWriter};
use cistern_core::iter::{BucketItem, BucketIterator, ItemCursor};
use cistern_core::{key, Bucket, CisternError, Result, SyncFlags, SyncOptions};

use crate::sync;

/// Keys per DELETE request; S3 caps a batch at 1000 keys.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Metadata key carrying the client-side content hash.
const CHECKSUM_METADATA_KEY: &str = "cistern-content-md5";

/// Options shared by the S3 bucket variants.
#[derive(Debug, Clone)]
pub struct S3Options {
    /// Explicit credentials; when `None` the ambient provider chain applies.
    pub credentials: Option<Credentials>,
    /// AWS region of the bucket.
    pub region: String,
    /// Remote bucket name.
    pub name: String,
    /// Key prefix scoping every operation.
    pub prefix: String,
    /// Retries on transient failures; zero disables retrying.
    pub max_retries: u32,
    /// Record a content hash as object metadata on write and verify it on
    /// read.
    pub use_single_file_checksums: bool,
    /// Multipart part size in bytes; ignored by the single-request bucket
    /// and clamped to the S3 minimum by the multipart one.
    pub part_size: usize,
    /// Keys per DELETE request.
    pub batch_size: usize,
    /// Mutating operations succeed without persisting anything.
    pub dry_run: bool,
    /// Reconcile remote deletions after push.
    pub delete_on_push: bool,
    /// Reconcile local deletions after pull.
    pub delete_on_pull: bool,
}

impl Default for S3Options {
    fn default() -> Self {
        Self {
            credentials: None,
            region: String::new(),
            name: String::new(),
            prefix: String::new(),
            max_retries: 0,
            use_single_file_checksums: false,
            part_size: crate::s3_multipart::DEFAULT_PART_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            dry_run: false,
            delete_on_push: false,
            delete_on_pull: false,
        }
    }
}

/// Build static credentials from an access key pair.
pub fn static_credentials(
    access_key: impl Into<String>,
    secret_key: impl Into<String>,
    session_token: Option<String>,
) -> Credentials {
    Credentials::new(access_key, secret_key, session_token, None, "cistern-static")
}

/// Client and addressing state shared by the S3 bucket variants.
pub(crate) struct S3Backend {
    pub(crate) client: Client,
    pub(crate) name: String,
    pub(crate) prefix: String,
    pub(crate) use_checksums: bool,
    pub(crate) batch_size: usize,
    pub(crate) flags: SyncFlags,
}

impl S3Backend {
    pub(crate) async fn new(ctx: &CancellationToken, opts: &S3Options) -> Result<Self> {
        ensure_active(ctx)?;
        if opts.name.is_empty() {
            return Err(CisternError::invalid_input("bucket name must not be empty"));
        }
        if opts.region.is_empty() {
            return Err(CisternError::invalid_input("region must not be empty"));
        }
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(opts.region.clone()))
            .retry_config(RetryConfig::standard().with_max_attempts(opts.max_retries + 1));
        if let Some(credentials) = opts.credentials.clone() {
            loader = loader.credentials_provider(credentials);
        }
        let config = loader.load().await;
        debug!(bucket = %opts.name, prefix = %opts.prefix, "S3 client initialised");
        Ok(Self {
            client: Client::new(&config),
            name: opts.name.clone(),
            prefix: opts.prefix.clone(),
            use_checksums: opts.use_single_file_checksums,
            batch_size: opts.batch_size.max(1),
            flags: SyncFlags::new(opts.dry_run, opts.delete_on_push, opts.delete_on_pull),
        })
    }

    /// The wire key for a bucket-relative key.
    pub(crate) fn full_key(&self, key: &str) -> String {
        key::join([self.prefix.as_str(), key])
    }

    /// Back from a wire key to a bucket-relative one.
    fn strip_key<'a>(&self, full: &'a str) -> &'a str {
        key::strip_prefix(full, &self.prefix)
    }

    pub(crate) async fn check(&self, ctx: &CancellationToken) -> Result<()> {
        ensure_active(ctx)?;
        self.client
            .head_bucket()
            .bucket(&self.name)
            .send()
            .await
            .map_err(|e| CisternError::transport(format!("checking bucket {}", self.name), e))?;
        Ok(())
    }

    pub(crate) async fn exists(&self, ctx: &CancellationToken, key: &str) -> Result<bool> {
        ensure_active(ctx)?;
        key::validate(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.name)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service = e.into_service_error();
                if service.is_not_found() {
                    Ok(false)
                } else {
                    Err(CisternError::transport(format!("checking {key}"), service))
                }
            }
        }
    }

    pub(crate) async fn reader(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        ensure_active(ctx)?;
        key::validate(key)?;
        let resp = self
            .client
            .get_object()
            .bucket(&self.name)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    CisternError::not_found(key)
                } else {
                    CisternError::transport(format!("reading {key}"), service)
                }
            })?;
        let expected = resp
            .metadata()
            .and_then(|m| m.get(CHECKSUM_METADATA_KEY))
            .cloned();
        let reader: ObjectReader = Box::new(resp.body.into_async_read());
        match expected {
            Some(expected) if self.use_checksums => Ok(Box::new(ChecksumReader::new(
                reader,
                key.to_string(),
                expected,
            ))),
            _ => Ok(reader),
        }
    }

    pub(crate) async fn remove_many(
        &self,
        ctx: &CancellationToken,
        keys: &[String],
    ) -> Result<()> {
        ensure_active(ctx)?;
        for key in keys {
            key::validate(key)?;
        }
        if self.flags.dry_run() {
            return Ok(());
        }
        let mut failed = Vec::new();
        for chunk in keys.chunks(self.batch_size) {
            ensure_active(ctx)?;
            let objects = chunk
                .iter()
                .map(|k| {
                    ObjectIdentifier::builder()
                        .key(self.full_key(k))
                        .build()
                        .map_err(|e| CisternError::invalid_input(format!("bad delete key: {e}")))
                })
                .collect::<Result<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(objects))
                .quiet(true)
                .build()
                .map_err(|e| CisternError::invalid_input(format!("bad delete batch: {e}")))?;
            let resp = self
                .client
                .delete_objects()
                .bucket(&self.name)
                .delete(delete)
                .send()
                .await
                .map_err(|e| {
                    CisternError::transport(format!("removing {} keys", chunk.len()), e)
                })?;
            for err in resp.errors() {
                if let Some(k) = err.key() {
                    failed.push(self.strip_key(k).to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CisternError::Removal { keys: failed })
        }
    }

    pub(crate) async fn list(
        &self,
        ctx: &CancellationToken,
        prefix: &str,
    ) -> Result<BucketIterator> {
        ensure_active(ctx)?;
        Ok(BucketIterator::new(Box::new(S3ListCursor {
            client: self.client.clone(),
            bucket: self.name.clone(),
            full_prefix: self.full_key(prefix),
            strip: self.prefix.clone(),
            buffer: VecDeque::new(),
            continuation: None,
            done: false,
        })))
    }

    /// One-shot PUT used by the single-request writer.
    pub(crate) async fn put_bytes(
        &self,
        ctx: &CancellationToken,
        key: &str,
        data: Vec<u8>,
    ) -> Result<()> {
        ensure_active(ctx)?;
        let bytes = data.len();
        let digest = self
            .use_checksums
            .then(|| format!("{:x}", md5::compute(&data)));
        let mut request = self
            .client
            .put_object()
            .bucket(&self.name)
            .key(self.full_key(key))
            .body(ByteStream::from(data));
        if let Some(digest) = digest {
            request = request.metadata(CHECKSUM_METADATA_KEY, digest);
        }
        request
            .send()
            .await
            .map_err(|e| CisternError::transport(format!("uploading {key}"), e))?;
        debug!(key = %key, bytes, "put object");
        Ok(())
    }
}

/// Paginated `ListObjectsV2` cursor; one page in memory at a time.
struct S3ListCursor {
    client: Client,
    bucket: String,
    full_prefix: String,
    strip: String,
    buffer: VecDeque<BucketItem>,
    continuation: Option<String>,
    done: bool,
}

#[async_trait]
impl ItemCursor for S3ListCursor {
    async fn next(&mut self, ctx: &CancellationToken) -> Result<Option<BucketItem>> {
        while self.buffer.is_empty() && !self.done {
            ensure_active(ctx)?;
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.full_prefix);
            if let Some(token) = &self.continuation {
                request = request.continuation_token(token);
            }
            let resp = request.send().await.map_err(|e| {
                CisternError::transport(format!("listing prefix {}", self.full_prefix), e)
            })?;
            ensure_active(ctx)?;
            for object in resp.contents() {
                let Some(full) = object.key() else { continue };
                self.buffer.push_back(BucketItem::with_hash(
                    key::strip_prefix(full, &self.strip),
                    self.bucket.clone(),
                    object.e_tag().map(|t| t.trim_matches('"').to_string()),
                ));
            }
            self.continuation = resp.next_continuation_token().map(str::to_string);
            self.done = !resp.is_truncated().unwrap_or(false) || self.continuation.is_none();
        }
        Ok(self.buffer.pop_front())
    }
}

/// Reader adapter that hashes everything passing through and fails at end
/// of stream when the digest differs from the recorded one.
///
/// The mismatch surfaces as an `std::io::Error` wrapping the typed
/// [`CisternError::ChecksumMismatch`]; `CisternError::from_io` recovers it.
pub(crate) struct ChecksumReader {
    inner: ObjectReader,
    context: md5::Context,
    key: String,
    expected: String,
    verified: bool,
}

impl ChecksumReader {
    pub(crate) fn new(inner: ObjectReader, key: String, expected: String) -> Self {
        Self {
            inner,
            context: md5::Context::new(),
            key,
            expected,
            verified: false,
        }
    }
}

impl AsyncRead for ChecksumReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let filled = &buf.filled()[before..];
                if filled.is_empty() {
                    if !this.verified {
                        this.verified = true;
                        let actual = format!("{:x}", this.context.clone().compute());
                        if actual != this.expected {
                            return Poll::Ready(Err(std::io::Error::new(
                                std::io::ErrorKind::InvalidData,
                                CisternError::ChecksumMismatch {
                                    key: this.key.clone(),
                                    expected: this.expected.clone(),
                                    actual,
                                },
                            )));
                        }
                    }
                } else {
                    this.context.consume(filled);
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Buffers the object and issues one PUT on close, so a failed write leaves
/// nothing observable.
struct S3SmallWriter {
    backend: std::sync::Arc<S3Backend>,
    key: String,
    buffer: Vec<u8>,
    ctx: CancellationToken,
}

#[async_trait]
impl ObjectWriter for S3SmallWriter {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        ensure_active(&self.ctx)?;
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.backend.put_bytes(&this.ctx, &this.key, this.buffer).await
    }
}

/// An S3 [`Bucket`] issuing one request per object write.
pub struct S3Bucket {
    backend: std::sync::Arc<S3Backend>,
}

impl S3Bucket {
    /// Create a bucket against the given S3 location.
    pub async fn new(ctx: &CancellationToken, opts: S3Options) -> Result<Self> {
        Ok(Self {
            backend: std::sync::Arc::new(S3Backend::new(ctx, &opts).await?),
        })
    }
}

#[async_trait]
impl Bucket for S3Bucket {
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
        Ok(Box::new(S3SmallWriter {
            backend: self.backend.clone(),
            key: key.to_string(),
            buffer: Vec::new(),
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

/// Parameters for the standalone request helpers.
#[derive(Debug, Clone)]
pub struct PreSignRequestParams {
    pub aws_key: String,
    pub aws_secret: String,
    pub aws_session_token: Option<String>,
    pub region: String,
    pub bucket: String,
    /// The full wire key, including any prefix.
    pub file_key: String,
    /// How long a presigned URL stays valid.
    pub expiry: Duration,
}

impl PreSignRequestParams {
    async fn client(&self) -> Client {
        let credentials = static_credentials(
            self.aws_key.clone(),
            self.aws_secret.clone(),
            self.aws_session_token.clone(),
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(self.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;
        Client::new(&config)
    }
}

/// Generate a SigV4 presigned GET URL for a bucket object.
pub async fn pre_sign(ctx: &CancellationToken, params: &PreSignRequestParams) -> Result<String> {
    ensure_active(ctx)?;
    let presigning = aws_sdk_s3::presigning::PresigningConfig::expires_in(params.expiry)
        .map_err(|e| CisternError::invalid_input(format!("bad presign expiry: {e}")))?;
    let request = params
        .client()
        .await
        .get_object()
        .bucket(&params.bucket)
        .key(&params.file_key)
        .presigned(presigning)
        .await
        .map_err(|e| CisternError::transport(format!("presigning {}", params.file_key), e))?;
    Ok(request.uri().to_string())
}

/// Metadata returned by [`head_object`].
#[derive(Debug, Clone)]
pub struct HeadObjectInfo {
    pub size_bytes: u64,
    pub etag: Option<String>,
    pub last_modified: Option<SystemTime>,
}

/// Look up object metadata without fetching the body.
pub async fn head_object(
    ctx: &CancellationToken,
    params: &PreSignRequestParams,
) -> Result<HeadObjectInfo> {
    ensure_active(ctx)?;
    let resp = params
        .client()
        .await
        .head_object()
        .bucket(&params.bucket)
        .key(&params.file_key)
        .send()
        .await
        .map_err(|e| {
            let service = e.into_service_error();
            if service.is_not_found() {
                CisternError::not_found(&params.file_key)
            } else {
                CisternError::transport(format!("heading {}", params.file_key), service)
            }
        })?;
    Ok(HeadObjectInfo {
        size_bytes: resp.content_length().unwrap_or(0).max(0) as u64,
        etag: resp.e_tag().map(str::to_string),
        last_modified: resp
            .last_modified()
            .cloned()
            .and_then(|dt| SystemTime::try_from(dt).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn backend_addressing(prefix: &str) -> (String, String) {
        // Exercise the pure key plumbing without a client.
        let full = key::join([prefix, "a/b"]);
        let stripped = key::strip_prefix(&full, prefix).to_string();
        (full, stripped)
    }

    #[test]
    fn test_key_addressing_round_trip() {
        let (full, stripped) = backend_addressing("team/project");
        assert_eq!(full, "team/project/a/b");
        assert_eq!(stripped, "a/b");

        let (full, stripped) = backend_addressing("");
        assert_eq!(full, "a/b");
        assert_eq!(stripped, "a/b");
    }

    #[test]
    fn test_default_options() {
        let opts = S3Options::default();
        assert_eq!(opts.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(opts.max_retries, 0);
        assert!(!opts.use_single_file_checksums);
    }

    #[tokio::test]
    async fn test_checksum_reader_accepts_matching_content() {
        let data = b"hello world!".to_vec();
        let expected = format!("{:x}", md5::compute(&data));
        let mut reader =
            ChecksumReader::new(Box::new(std::io::Cursor::new(data)), "k".into(), expected);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world!");
    }

    #[tokio::test]
    async fn test_checksum_reader_rejects_corrupted_content() {
        let data = b"hello world!".to_vec();
        let mut reader = ChecksumReader::new(
            Box::new(std::io::Cursor::new(data)),
            "k".into(),
            "0000".into(),
        );
        let mut out = Vec::new();
        let err = reader.read_to_end(&mut out).await.unwrap_err();
        let typed = CisternError::from_io("k", err);
        assert!(matches!(typed, CisternError::ChecksumMismatch { .. }));
    }
}
