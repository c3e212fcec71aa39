//! Bucket contract tests, run against every backend that works without
//! external services: the plain local bucket and the parallel wrapper over
//! a local bucket. Remote backends run the same semantics in `remote.rs`.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cistern_core::{Bucket, CisternError, ObjectWriter as _, SyncOptions};
use cistern_storage::{LocalBucket, LocalOptions, ParallelBucketOptions, ParallelSyncBucket};

struct Fixture {
    name: &'static str,
    _tmp: TempDir,
    bucket: Arc<dyn Bucket>,
}

fn fixtures() -> Vec<Fixture> {
    let tmp = TempDir::new().unwrap();
    let local: Arc<dyn Bucket> = Arc::new(LocalBucket::new(LocalOptions {
        path: tmp.path().to_path_buf(),
        prefix: Uuid::new_v4().to_string(),
        ..Default::default()
    }));

    let tmp2 = TempDir::new().unwrap();
    let inner = Arc::new(LocalBucket::new(LocalOptions {
        path: tmp2.path().to_path_buf(),
        prefix: Uuid::new_v4().to_string(),
        ..Default::default()
    }));
    let parallel: Arc<dyn Bucket> = Arc::new(
        ParallelSyncBucket::new(
            ParallelBucketOptions {
                workers: 4,
                ..Default::default()
            },
            inner,
        )
        .unwrap(),
    );

    vec![
        Fixture {
            name: "local",
            _tmp: tmp,
            bucket: local,
        },
        Fixture {
            name: "parallel-local",
            _tmp: tmp2,
            bucket: parallel,
        },
    ]
}

async fn put_str(bucket: &dyn Bucket, ctx: &CancellationToken, key: &str, data: &str) {
    let mut writer = bucket.writer(ctx, key).await.unwrap();
    writer.write_all(data.as_bytes()).await.unwrap();
    writer.close().await.unwrap();
}

async fn get_str(bucket: &dyn Bucket, ctx: &CancellationToken, key: &str) -> String {
    let mut reader = bucket.get(ctx, key).await.unwrap();
    let mut out = String::new();
    reader.read_to_string(&mut out).await.unwrap();
    out
}

async fn list_keys(bucket: &dyn Bucket, ctx: &CancellationToken, prefix: &str) -> Vec<String> {
    bucket
        .list(ctx, prefix)
        .await
        .unwrap()
        .collect(ctx)
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.key().to_string())
        .collect()
}

fn write_local(root: &Path, rel: &str, data: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

#[tokio::test]
async fn check_is_valid() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        fixture.bucket.check(&ctx).await.unwrap_or_else(|e| {
            panic!("{}: check failed: {e}", fixture.name);
        });
    }
}

#[tokio::test]
async fn list_is_empty_on_a_fresh_bucket() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let keys = list_keys(fixture.bucket.as_ref(), &ctx, "").await;
        assert!(keys.is_empty(), "{}: expected empty listing", fixture.name);
    }
}

#[tokio::test]
async fn list_errors_with_cancelled_token() {
    let ctx = CancellationToken::new();
    ctx.cancel();
    for fixture in fixtures() {
        assert!(
            matches!(
                fixture.bucket.list(&ctx, "").await.err(),
                Some(CisternError::Cancelled)
            ),
            "{}: expected cancellation",
            fixture.name
        );
    }
}

#[tokio::test]
async fn list_iterates_lexicographically() {
    let ctx = CancellationToken::new();
    let keys = ["0file", "Afile", "Zfile", "afile1", "cfile", "zfile1"];
    for fixture in fixtures() {
        // Insert in reverse order: stores must not list in insert order.
        for key in keys.iter().rev() {
            put_str(fixture.bucket.as_ref(), &ctx, key, "foo/bar").await;
        }
        let listed = list_keys(fixture.bucket.as_ref(), &ctx, "").await;
        assert_eq!(listed, keys, "{}", fixture.name);
    }
}

#[tokio::test]
async fn round_trip_and_remove() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        put_str(bucket, &ctx, "foo", "hello world!").await;
        assert_eq!(get_str(bucket, &ctx, "foo").await, "hello world!");
        bucket.remove(&ctx, "foo").await.unwrap();
        assert!(
            list_keys(bucket, &ctx, "").await.is_empty(),
            "{}",
            fixture.name
        );
    }
}

#[tokio::test]
async fn dry_run_writes_are_suppressed() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        put_str(bucket, &ctx, Uuid::new_v4().to_string().as_str(), "hello").await;
        bucket.set_dry_run(true);
        put_str(bucket, &ctx, Uuid::new_v4().to_string().as_str(), "hello").await;
        bucket.set_dry_run(false);
        assert_eq!(
            list_keys(bucket, &ctx, "").await.len(),
            1,
            "{}",
            fixture.name
        );
    }
}

#[tokio::test]
async fn remove_matching_leaves_unmatched_keys() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        let mut kept = Vec::new();
        for _ in 0..20 {
            let key = Uuid::new_v4().to_string();
            put_str(bucket, &ctx, &key, "keep").await;
            kept.push(key);
        }
        for _ in 0..20 {
            let key = format!("{}X", Uuid::new_v4());
            put_str(bucket, &ctx, &key, "drop").await;
        }

        bucket.remove_matching(&ctx, ".*X").await.unwrap();

        let mut listed = list_keys(bucket, &ctx, "").await;
        listed.sort();
        kept.sort();
        assert_eq!(listed, kept, "{}", fixture.name);
    }
}

#[tokio::test]
async fn remove_matching_rejects_invalid_expressions() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        assert!(
            matches!(
                fixture.bucket.remove_matching(&ctx, "[").await.err(),
                Some(CisternError::InvalidInput { .. })
            ),
            "{}",
            fixture.name
        );
    }
}

#[tokio::test]
async fn remove_prefix_scopes_to_the_prefix() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        put_str(bucket, &ctx, "scoped/one", "1").await;
        put_str(bucket, &ctx, "scoped/two", "2").await;
        put_str(bucket, &ctx, "outside", "3").await;

        bucket.remove_prefix(&ctx, "scoped").await.unwrap();
        assert_eq!(
            list_keys(bucket, &ctx, "").await,
            vec!["outside"],
            "{}",
            fixture.name
        );
    }
}

#[tokio::test]
async fn push_excludes_and_scopes_to_the_remote_prefix() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let local = TempDir::new().unwrap();
        write_local(local.path(), "a/b.txt", "text");
        write_local(local.path(), "c.py", "code");

        fixture
            .bucket
            .push(
                &ctx,
                &SyncOptions {
                    local: local.path().to_path_buf(),
                    remote: "dst".into(),
                    exclude: Some(r".*\.py".into()),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            list_keys(fixture.bucket.as_ref(), &ctx, "").await,
            vec!["dst/a/b.txt"],
            "{}",
            fixture.name
        );
    }
}

#[tokio::test]
async fn pull_mirrors_the_remote_prefix() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        put_str(bucket, &ctx, "src/one", "1").await;
        put_str(bucket, &ctx, "src/deep/two", "2").await;
        put_str(bucket, &ctx, "unrelated", "3").await;

        let mirror = TempDir::new().unwrap();
        bucket
            .pull(
                &ctx,
                &SyncOptions {
                    local: mirror.path().to_path_buf(),
                    remote: "src".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(mirror.path().join("one")).unwrap(),
            "1",
            "{}",
            fixture.name
        );
        assert_eq!(
            std::fs::read_to_string(mirror.path().join("deep/two")).unwrap(),
            "2"
        );
        assert!(!mirror.path().join("unrelated").exists());
    }
}

#[tokio::test]
async fn dry_run_pull_never_deletes_local_files() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        put_str(bucket, &ctx, "fresh", "data").await;

        let mirror = TempDir::new().unwrap();
        write_local(mirror.path(), "stale.txt", "should survive");

        bucket.set_delete_on_pull(true);
        bucket.set_dry_run(true);
        bucket
            .pull(
                &ctx,
                &SyncOptions {
                    local: mirror.path().to_path_buf(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        bucket.set_dry_run(false);
        bucket.set_delete_on_pull(false);

        assert!(
            mirror.path().join("stale.txt").exists(),
            "{}: dry-run pull must not delete local files",
            fixture.name
        );
        assert!(mirror.path().join("fresh").exists());
    }
}

#[tokio::test]
async fn delete_on_sync_reconciles_both_directions() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();

        // Push reconciliation: remote keys absent locally are removed.
        put_str(bucket, &ctx, "baz/delete1", "stale").await;
        put_str(bucket, &ctx, "baz/delete2", "stale").await;
        let local = TempDir::new().unwrap();
        write_local(local.path(), "wanted", "data");

        bucket.set_delete_on_push(true);
        bucket
            .push(
                &ctx,
                &SyncOptions {
                    local: local.path().to_path_buf(),
                    remote: "baz".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        bucket.set_delete_on_push(false);
        assert_eq!(
            list_keys(bucket, &ctx, "baz").await,
            vec!["baz/wanted"],
            "{}",
            fixture.name
        );

        // Pull reconciliation: local files absent remotely are removed.
        let mirror = TempDir::new().unwrap();
        write_local(mirror.path(), "stale.txt", "old");
        bucket.set_delete_on_pull(true);
        bucket
            .pull(
                &ctx,
                &SyncOptions {
                    local: mirror.path().to_path_buf(),
                    remote: "baz".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        bucket.set_delete_on_pull(false);
        assert!(!mirror.path().join("stale.txt").exists());
        assert!(mirror.path().join("wanted").exists());
    }
}

#[tokio::test]
async fn push_and_pull_error_promptly_when_cancelled() {
    let ctx = CancellationToken::new();
    ctx.cancel();
    for fixture in fixtures() {
        let local = TempDir::new().unwrap();
        let opts = SyncOptions {
            local: local.path().to_path_buf(),
            ..Default::default()
        };
        assert!(
            matches!(
                fixture.bucket.push(&ctx, &opts).await.err(),
                Some(CisternError::Cancelled)
            ),
            "{}",
            fixture.name
        );
        assert!(
            matches!(
                fixture.bucket.pull(&ctx, &opts).await.err(),
                Some(CisternError::Cancelled)
            ),
            "{}",
            fixture.name
        );
    }
}

#[tokio::test]
async fn items_carry_the_bucket_name() {
    let ctx = CancellationToken::new();
    for fixture in fixtures() {
        let bucket = fixture.bucket.as_ref();
        put_str(bucket, &ctx, "named", "data").await;
        let items = bucket
            .list(&ctx, "")
            .await
            .unwrap()
            .collect(&ctx)
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].bucket(), bucket.name(), "{}", fixture.name);
    }
}
