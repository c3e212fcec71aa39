//! The parallel sync wrapper.
//!
//! Wraps any bucket and parallelizes only push and pull: per-object jobs
//! derived from the walk or listing are drained by a fixed pool of workers,
//! and the first terminal error cancels a child token so the remaining
//! workers stop promptly. Every other operation forwards to the inner
//! bucket unchanged, preserving error identity. Delete-on-sync
//! reconciliation runs strictly after the pool drains, so the snapshot it
//! compares against reflects the completed transfer.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cistern_core::bucket::{ensure_active, ObjectReader, ObjectWriter};
use cistern_core::iter::BucketIterator;
use cistern_core::{key, Bucket, CisternError, Result, SyncFlags, SyncOptions};

use crate::sync;

/// Options for constructing a [`ParallelSyncBucket`].
#[derive(Debug, Clone)]
pub struct ParallelBucketOptions {
    /// Number of concurrent transfer workers.
    pub workers: usize,
    /// Mutating operations succeed without persisting anything.
    pub dry_run: bool,
    /// Reconcile remote deletions after push.
    pub delete_on_push: bool,
    /// Reconcile local deletions after pull.
    pub delete_on_pull: bool,
}

impl Default for ParallelBucketOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|p| p.get())
                .unwrap_or(1),
            dry_run: false,
            delete_on_push: false,
            delete_on_pull: false,
        }
    }
}

/// A [`Bucket`] decorator fanning push/pull work across a worker pool.
pub struct ParallelSyncBucket {
    inner: Arc<dyn Bucket>,
    workers: usize,
    flags: SyncFlags,
}

impl ParallelSyncBucket {
    /// Wrap `inner`, validating the worker count.
    pub fn new(opts: ParallelBucketOptions, inner: Arc<dyn Bucket>) -> Result<Self> {
        if opts.workers == 0 {
            return Err(CisternError::invalid_input(
                "worker count must be at least one",
            ));
        }
        Ok(Self {
            inner,
            workers: opts.workers,
            flags: SyncFlags::new(opts.dry_run, opts.delete_on_push, opts.delete_on_pull),
        })
    }

    /// Drain `jobs` with the worker pool. The first error cancels the
    /// shared child token and is returned after every worker has stopped.
    async fn run_pool(&self, ctx: &CancellationToken, jobs: Vec<Job>) -> Result<()> {
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let child = ctx.child_token();
        let failure: Arc<Mutex<Option<CisternError>>> = Arc::new(Mutex::new(None));

        let mut handles = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let queue = queue.clone();
            let child = child.clone();
            let failure = failure.clone();
            let inner = self.inner.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if child.is_cancelled() {
                        return;
                    }
                    let Some(job) = queue.lock().await.pop_front() else {
                        return;
                    };
                    let result = match &job {
                        Job::Upload { key, path } => inner.upload(&child, key, path).await,
                        Job::Download { key, path } => inner.download(&child, key, path).await,
                    };
                    if let Err(err) = result {
                        let mut slot = failure.lock().await;
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        child.cancel();
                        return;
                    }
                }
            }));
        }
        for handle in handles {
            handle
                .await
                .map_err(|e| CisternError::io_msg(format!("sync worker panicked: {e}")))?;
        }
        if let Some(err) = failure.lock().await.take() {
            return Err(err);
        }
        ensure_active(ctx)
    }
}

enum Job {
    Upload {
        key: String,
        path: std::path::PathBuf,
    },
    Download {
        key: String,
        path: std::path::PathBuf,
    },
}

#[async_trait]
impl Bucket for ParallelSyncBucket {
    fn name(&self) -> String {
        self.inner.name()
    }

    fn flags(&self) -> &SyncFlags {
        &self.flags
    }

    // Flag updates propagate so the inner bucket's own mutating operations
    // observe them too.
    fn set_dry_run(&self, on: bool) {
        self.flags.set_dry_run(on);
        self.inner.set_dry_run(on);
    }

    fn set_delete_on_push(&self, on: bool) {
        self.flags.set_delete_on_push(on);
        self.inner.set_delete_on_push(on);
    }

    fn set_delete_on_pull(&self, on: bool) {
        self.flags.set_delete_on_pull(on);
        self.inner.set_delete_on_pull(on);
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

    async fn put(
        &self,
        ctx: &CancellationToken,
        key: &str,
        source: &mut (dyn tokio::io::AsyncRead + Send + Unpin),
    ) -> Result<()> {
        self.inner.put(ctx, key, source).await
    }

    async fn get(&self, ctx: &CancellationToken, key: &str) -> Result<ObjectReader> {
        self.inner.get(ctx, key).await
    }

    async fn upload(
        &self,
        ctx: &CancellationToken,
        key: &str,
        path: &std::path::Path,
    ) -> Result<()> {
        self.inner.upload(ctx, key, path).await
    }

    async fn download(
        &self,
        ctx: &CancellationToken,
        key: &str,
        path: &std::path::Path,
    ) -> Result<()> {
        self.inner.download(ctx, key, path).await
    }

    async fn remove_matching(&self, ctx: &CancellationToken, expression: &str) -> Result<()> {
        self.inner.remove_matching(ctx, expression).await
    }

    async fn remove_prefix(&self, ctx: &CancellationToken, prefix: &str) -> Result<()> {
        self.inner.remove_prefix(ctx, prefix).await
    }

    fn join(&self, parts: &[&str]) -> String {
        self.inner.join(parts)
    }

    async fn push(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        let exclude = sync::compile_exclude(opts)?;
        ensure_active(ctx)?;
        let files = sync::walk_local_tree(ctx, &opts.local).await?;
        let mut pushed: HashSet<String> = HashSet::new();
        let mut jobs = Vec::new();
        for rel in files {
            if let Some(re) = &exclude {
                if re.is_match(&rel) {
                    continue;
                }
            }
            jobs.push(Job::Upload {
                key: key::join([opts.remote.as_str(), rel.as_str()]),
                path: opts.local.join(key::to_rel_path(&rel)),
            });
            pushed.insert(rel);
        }
        debug!(jobs = jobs.len(), workers = self.workers, "parallel push");
        self.run_pool(ctx, jobs).await?;

        if self.flags.delete_on_push() {
            sync::delete_remote_missing(self.inner.as_ref(), ctx, &opts.remote, &pushed).await?;
        }
        Ok(())
    }

    async fn pull(&self, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
        let exclude = sync::compile_exclude(opts)?;
        ensure_active(ctx)?;
        let mut iter = self.inner.list(ctx, &opts.remote).await?;
        let mut pulled: HashSet<String> = HashSet::new();
        let mut jobs = Vec::new();
        while let Some(item) = iter.next(ctx).await? {
            if let Some(re) = &exclude {
                if re.is_match(key::base_name(item.key())) {
                    continue;
                }
            }
            let rel = key::strip_prefix(item.key(), &opts.remote).to_string();
            jobs.push(Job::Download {
                key: item.key().to_string(),
                path: opts.local.join(key::to_rel_path(&rel)),
            });
            pulled.insert(rel);
        }
        debug!(jobs = jobs.len(), workers = self.workers, "parallel pull");
        self.run_pool(ctx, jobs).await?;

        if self.flags.delete_on_pull() && !self.flags.dry_run() {
            sync::delete_local_missing(ctx, &opts.local, &pulled).await?;
        }
        Ok(())
    }
}
