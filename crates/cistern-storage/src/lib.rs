//! Storage backend implementations for cistern.
//!
//! This crate provides concrete implementations of the
//! [`Bucket`](cistern_core::Bucket) trait:
//!
//! - [`LocalBucket`] — filesystem-backed storage
//! - [`S3Bucket`] — S3 with single-request writes
//! - [`S3MultipartBucket`] — S3 with multipart writes for large objects
//! - [`S3ArchiveBucket`] — whole-tree sync as a single tar object on S3
//! - [`GridFsBucket`] — MongoDB GridFS chunked-file storage
//! - [`ParallelSyncBucket`] — fans push/pull across a worker pool
//!
//! plus the shared [`sync`] engine the non-archive backends delegate to,
//! and standalone S3 request helpers ([`pre_sign`], [`head_object`]).

pub mod archive;
pub mod gridfs;
pub mod local;
pub mod parallel;
pub mod s3;
pub mod s3_multipart;
pub mod sync;

pub use archive::{S3ArchiveBucket, SYNC_ARCHIVE_NAME};
pub use gridfs::{GridFsBucket, GridFsOptions};
pub use local::{LocalBucket, LocalOptions};
pub use parallel::{ParallelBucketOptions, ParallelSyncBucket};
pub use s3::{
    head_object, pre_sign, static_credentials, HeadObjectInfo, PreSignRequestParams, S3Bucket,
    S3Options,
};
pub use s3_multipart::S3MultipartBucket;
