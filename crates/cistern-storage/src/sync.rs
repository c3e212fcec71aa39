//! The shared Push/Pull engine.
//!
//! Every non-archive backend delegates its `push` and `pull` to the
//! functions here. Transfers run in iteration order, fail fast on the first
//! unrecoverable per-object error, and re-check cancellation between
//! objects; nothing done before a failure is rolled back.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use regex::Regex;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use cistern_core::bucket::ensure_active;
use cistern_core::{key, Bucket, CisternError, Result, SyncOptions};

/// Compile the exclude expression, failing before any I/O on an invalid
/// pattern.
pub fn compile_exclude(opts: &SyncOptions) -> Result<Option<Regex>> {
    match opts.exclude.as_deref() {
        None | Some("") => Ok(None),
        Some(expr) => Regex::new(expr)
            .map(Some)
            .map_err(|e| {
                CisternError::invalid_input(format!("invalid exclude expression '{expr}': {e}"))
            }),
    }
}

/// Walk a local directory tree, returning the relative slash-separated
/// paths of every regular file in sorted order.
///
/// Cancellation is checked at each directory boundary. Symlinks are not
/// followed; a file vanishing mid-walk fails the walk.
pub async fn walk_local_tree(ctx: &CancellationToken, root: &Path) -> Result<Vec<String>> {
    ensure_active(ctx)?;
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        ensure_active(ctx)?;
        let mut reader = fs::read_dir(&dir)
            .await
            .map_err(|e| CisternError::io(format!("walking {}", dir.display()), e))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| CisternError::io(format!("walking {}", dir.display()), e))?
        {
            let path = entry.path();
            let meta = fs::symlink_metadata(&path)
                .await
                .map_err(|e| CisternError::io(format!("inspecting {}", path.display()), e))?;
            if meta.is_dir() {
                pending.push(path);
            } else if meta.is_file() {
                let rel = path.strip_prefix(root).map_err(|e| {
                    CisternError::io_msg(format!("stripping walk root: {e}"))
                })?;
                files.push(key::from_rel_path(rel));
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Sync the bucket's contents at `opts.remote` into `opts.local`.
pub async fn pull(bucket: &dyn Bucket, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
    let exclude = compile_exclude(opts)?;
    ensure_active(ctx)?;

    let mut iter = bucket.list(ctx, &opts.remote).await?;
    let mut pulled: HashSet<String> = HashSet::new();
    while let Some(item) = iter.next(ctx).await? {
        if let Some(re) = &exclude {
            if re.is_match(key::base_name(item.key())) {
                continue;
            }
        }
        let rel = key::strip_prefix(item.key(), &opts.remote).to_string();
        let dest = opts.local.join(key::to_rel_path(&rel));
        bucket.download(ctx, item.key(), &dest).await?;
        pulled.insert(rel);
    }
    debug!(count = pulled.len(), "pull transferred objects");

    // Dry run never deletes local files, even with delete-on-pull set.
    if bucket.delete_on_pull() && !bucket.dry_run() {
        delete_local_missing(ctx, &opts.local, &pulled).await?;
    }
    Ok(())
}

/// Sync `opts.local` into the bucket at `opts.remote`.
pub async fn push(bucket: &dyn Bucket, ctx: &CancellationToken, opts: &SyncOptions) -> Result<()> {
    let exclude = compile_exclude(opts)?;
    ensure_active(ctx)?;

    let files = walk_local_tree(ctx, &opts.local).await?;
    let mut pushed: HashSet<String> = HashSet::new();
    for rel in files {
        ensure_active(ctx)?;
        if let Some(re) = &exclude {
            if re.is_match(&rel) {
                continue;
            }
        }
        let target = key::join([opts.remote.as_str(), rel.as_str()]);
        let source = opts.local.join(key::to_rel_path(&rel));
        bucket.upload(ctx, &target, &source).await?;
        pushed.insert(rel);
    }
    debug!(count = pushed.len(), "push transferred objects");

    if bucket.delete_on_push() {
        delete_remote_missing(bucket, ctx, &opts.remote, &pushed).await?;
    }
    Ok(())
}

/// Remove local files under `local` whose relative path is not in `keep`.
pub(crate) async fn delete_local_missing(
    ctx: &CancellationToken,
    local: &Path,
    keep: &HashSet<String>,
) -> Result<()> {
    for rel in walk_local_tree(ctx, local).await? {
        if keep.contains(&rel) {
            continue;
        }
        let path: PathBuf = local.join(key::to_rel_path(&rel));
        fs::remove_file(&path)
            .await
            .map_err(|e| CisternError::io(format!("removing file {}", path.display()), e))?;
    }
    Ok(())
}

/// Remove bucket keys under `remote` whose suffix is not in `keep`.
///
/// Deletion goes through [`Bucket::remove_many`], so a dry-run bucket
/// reconciles nothing.
pub(crate) async fn delete_remote_missing(
    bucket: &dyn Bucket,
    ctx: &CancellationToken,
    remote: &str,
    keep: &HashSet<String>,
) -> Result<()> {
    let mut iter = bucket.list(ctx, remote).await?;
    let mut stale = Vec::new();
    while let Some(item) = iter.next(ctx).await? {
        let rel = key::strip_prefix(item.key(), remote);
        if !keep.contains(rel) {
            stale.push(item.key().to_string());
        }
    }
    if stale.is_empty() {
        return Ok(());
    }
    bucket.remove_many(ctx, &stale).await
}
