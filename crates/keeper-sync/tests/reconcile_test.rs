//! Reconciliation passes against an in-memory remote.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keeper_core::{KeeperError, KeeperResult, RemoteRow, SyncCheckpoint};
use keeper_storage::{StorageLayout, VaultRepository};
use keeper_sync::{BlobReader, CheckpointStore, RemoteVault, SyncReconciler, UploadMeta};
use secrecy::SecretString;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeRemote {
    live: Mutex<Vec<RemoteRow>>,
    deleted: Mutex<Vec<RemoteRow>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    fail_deleted_listing: AtomicBool,
    fail_live_listing: AtomicBool,
    fail_downloads: Mutex<HashSet<String>>,
    fail_delay_ms: AtomicU64,
    stall_stream: Mutex<HashSet<String>>,
    break_stream: Mutex<HashSet<String>>,
    queries: Mutex<Vec<(bool, String)>>,
    downloads: AtomicUsize,
}

fn row(name: &str) -> RemoteRow {
    RemoteRow {
        uuid: format!("uuid-{name}"),
        name: name.to_string(),
        category: String::new(),
        size: 0,
        content_type: "application/octet-stream".into(),
        description: String::new(),
    }
}

impl FakeRemote {
    fn add_live(&self, name: &str, body: &[u8]) {
        self.live.lock().unwrap().push(row(name));
        self.blobs
            .lock()
            .unwrap()
            .insert(name.to_string(), body.to_vec());
    }

    fn add_deleted(&self, name: &str) {
        self.deleted.lock().unwrap().push(row(name));
    }

    fn queries(&self) -> Vec<(bool, String)> {
        self.queries.lock().unwrap().clone()
    }
}

/// Yields nothing and then fails, like a connection dropped mid-body.
struct BrokenTail;

impl AsyncRead for BrokenTail {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Ready(Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset",
        )))
    }
}

/// Delivers the body and then hangs, like a peer that stopped sending.
struct StalledTail;

impl AsyncRead for StalledTail {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

#[async_trait]
impl RemoteVault for FakeRemote {
    async fn register(&self, _: &str, _: &SecretString, _: &str) -> KeeperResult<()> {
        Ok(())
    }

    async fn login(&self, _: &str, _: &SecretString) -> KeeperResult<SecretString> {
        Ok(SecretString::from("token"))
    }

    async fn upload(&self, _: &Path, name: &str, _: &UploadMeta) -> KeeperResult<String> {
        Ok(format!("uuid-{name}"))
    }

    async fn download(&self, name: &str) -> KeeperResult<BlobReader> {
        let failing = self.fail_downloads.lock().unwrap().contains(name);
        if failing {
            let delay = self.fail_delay_ms.load(Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            return Err(KeeperError::Remote {
                status: 500,
                body: "storage backend unavailable".into(),
            });
        }
        let body = self
            .blobs
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| KeeperError::Remote {
                status: 404,
                body: name.to_string(),
            })?;
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let reader = std::io::Cursor::new(body);
        if self.stall_stream.lock().unwrap().contains(name) {
            Ok(Box::pin(reader.chain(StalledTail)))
        } else if self.break_stream.lock().unwrap().contains(name) {
            Ok(Box::pin(reader.chain(BrokenTail)))
        } else {
            Ok(Box::pin(reader))
        }
    }

    async fn delete(&self, _: &str) -> KeeperResult<()> {
        Ok(())
    }

    async fn list_uploads(&self, deleted: bool, since: &str) -> KeeperResult<Vec<RemoteRow>> {
        self.queries
            .lock()
            .unwrap()
            .push((deleted, since.to_string()));
        if deleted {
            if self.fail_deleted_listing.load(Ordering::SeqCst) {
                return Err(KeeperError::Remote {
                    status: 503,
                    body: "try later".into(),
                });
            }
            Ok(self.deleted.lock().unwrap().clone())
        } else {
            if self.fail_live_listing.load(Ordering::SeqCst) {
                return Err(KeeperError::Remote {
                    status: 503,
                    body: "try later".into(),
                });
            }
            Ok(self.live.lock().unwrap().clone())
        }
    }
}

struct Harness {
    _tmp: TempDir,
    repo: Arc<VaultRepository>,
    remote: Arc<FakeRemote>,
    reconciler: SyncReconciler,
    layout: StorageLayout,
}

impl Harness {
    async fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let layout = StorageLayout::new(tmp.path());
        let repo = Arc::new(layout.open_files("alice").await.unwrap());
        let remote = Arc::new(FakeRemote::default());
        let checkpoints = CheckpointStore::new(layout.open_checkpoints().await.unwrap());
        let reconciler = SyncReconciler::new(repo.clone(), remote.clone(), checkpoints);
        Self {
            _tmp: tmp,
            repo,
            remote,
            reconciler,
            layout,
        }
    }

    async fn run(&self) -> KeeperResult<keeper_sync::SyncReport> {
        self.reconciler
            .run("alice", &CancellationToken::new())
            .await
    }

    async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .repo
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        names.sort();
        names
    }

    async fn checkpoint(&self) -> SyncCheckpoint {
        CheckpointStore::new(self.layout.open_checkpoints().await.unwrap())
            .load("alice")
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_pass_converges_local_to_remote() {
    let h = Harness::new().await;
    h.repo.save("b", &b"stale"[..]).await.unwrap();
    h.remote.add_live("a", b"fresh bytes");
    h.remote.add_deleted("b");

    let report = h.run().await.unwrap();

    assert_eq!(report.deleted, 1);
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.names().await, vec!["a"]);
    assert_eq!(h.repo.get_content("a").await.unwrap(), "fresh bytes");
}

#[tokio::test]
async fn test_second_pass_is_a_no_op() {
    let h = Harness::new().await;
    h.repo.save("b", &b"x"[..]).await.unwrap();
    h.repo.save("kept", &b"mine"[..]).await.unwrap();
    h.remote.add_live("a", b"1");
    h.remote.add_live("kept", b"server copy");
    h.remote.add_deleted("b");

    h.run().await.unwrap();
    let after_first = h.names().await;
    let downloads = h.remote.downloads.load(Ordering::SeqCst);

    let report = h.run().await.unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(h.names().await, after_first);
    assert_eq!(h.remote.downloads.load(Ordering::SeqCst), downloads);
    assert_eq!(h.repo.get_content("kept").await.unwrap(), "mine");
}

#[tokio::test]
async fn test_first_pass_queries_from_epoch_then_from_checkpoint() {
    let h = Harness::new().await;
    let report = h.run().await.unwrap();
    h.run().await.unwrap();

    let today = Utc::now().format("%Y-%m-%d").to_string();
    let queries = h.remote.queries();
    assert_eq!(queries[0], (true, "1970-01-01".to_string()));
    assert_eq!(queries[1], (false, "1970-01-01".to_string()));
    assert_eq!(queries[2], (true, today.clone()));
    assert_eq!(queries[3], (false, today));
    assert_eq!(h.checkpoint().await.query_date(), report.checkpoint.query_date());
}

#[tokio::test]
async fn test_failed_deletion_step_keeps_checkpoint() {
    let h = Harness::new().await;
    h.repo.save("b", &b"x"[..]).await.unwrap();
    h.remote.add_deleted("b");
    h.remote.fail_deleted_listing.store(true, Ordering::SeqCst);

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, KeeperError::Remote { status: 503, .. }));
    assert_eq!(h.checkpoint().await, SyncCheckpoint::beginning_of_time("alice"));
    assert_eq!(h.names().await, vec!["b"]);

    h.remote.fail_deleted_listing.store(false, Ordering::SeqCst);
    let report = h.run().await.unwrap();

    assert_eq!(report.deleted, 1);
    assert!(h.names().await.is_empty());
    let deletion_queries: Vec<_> = h
        .remote
        .queries()
        .into_iter()
        .filter(|(deleted, _)| *deleted)
        .collect();
    assert_eq!(deletion_queries.len(), 2);
    assert!(deletion_queries.iter().all(|(_, since)| since == "1970-01-01"));
}

#[tokio::test]
async fn test_failed_download_keeps_checkpoint_and_retries() {
    let h = Harness::new().await;
    for name in ["a", "b", "c", "d"] {
        h.remote.add_live(name, name.as_bytes());
    }
    h.remote.fail_downloads.lock().unwrap().insert("c".into());

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, KeeperError::Remote { status: 500, .. }));
    assert_eq!(h.checkpoint().await, SyncCheckpoint::beginning_of_time("alice"));
    assert!(!h.repo.exists("c").await);

    h.remote.fail_downloads.lock().unwrap().clear();
    h.run().await.unwrap();
    assert_eq!(h.names().await, vec!["a", "b", "c", "d"]);
}

#[tokio::test]
async fn test_broken_download_stream_leaves_no_partial_blob() {
    let h = Harness::new().await;
    h.remote.add_live("big", &[9u8; 20_000]);
    h.remote.break_stream.lock().unwrap().insert("big".into());

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, KeeperError::Io { .. }));
    assert!(h.names().await.is_empty());
    assert_eq!(
        std::fs::read_dir(h.repo.root()).unwrap().count(),
        0,
        "temp file must be cleaned up"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancelled_download_leaves_no_temp_file() {
    let h = Harness::new().await;
    h.remote.add_live("slow", &[1u8; 1000]);
    h.remote.add_live("bad", b"never arrives");
    h.remote.stall_stream.lock().unwrap().insert("slow".into());
    h.remote.fail_downloads.lock().unwrap().insert("bad".into());
    h.remote.fail_delay_ms.store(100, Ordering::SeqCst);

    let err = h.run().await.unwrap_err();

    assert!(matches!(err, KeeperError::Remote { status: 500, .. }));
    assert_eq!(std::fs::read_dir(h.repo.root()).unwrap().count(), 0);
    assert_eq!(h.checkpoint().await, SyncCheckpoint::beginning_of_time("alice"));
}

#[tokio::test]
async fn test_deleted_then_reuploaded_name_holds_live_copy() {
    let h = Harness::new().await;
    h.remote.add_deleted("report.pdf");
    h.remote.add_live("report.pdf", b"new");

    let report = h.run().await.unwrap();
    assert_eq!(report.deleted, 0);
    assert_eq!(report.downloaded, 1);
    assert_eq!(h.repo.get_content("report.pdf").await.unwrap(), "new");

    // Both rows come back inside the same day; nothing may change.
    let report = h.run().await.unwrap();
    assert_eq!(report.mutations(), 0);
    assert_eq!(h.remote.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(h.repo.get_content("report.pdf").await.unwrap(), "new");
}

#[tokio::test]
async fn test_live_row_keeps_local_copy_when_download_fails() {
    let h = Harness::new().await;
    h.repo.save("report.pdf", &b"local"[..]).await.unwrap();
    h.remote.add_deleted("report.pdf");
    h.remote.add_live("report.pdf", b"server");

    let report = h.run().await.unwrap();
    assert_eq!(report.mutations(), 0);

    h.remote
        .fail_downloads
        .lock()
        .unwrap()
        .insert("report.pdf".into());
    let report = h.run().await.unwrap();

    assert_eq!(report.mutations(), 0);
    assert_eq!(h.remote.downloads.load(Ordering::SeqCst), 0);
    assert_eq!(h.repo.get_content("report.pdf").await.unwrap(), "local");
}

#[tokio::test]
async fn test_failed_live_listing_deletes_nothing() {
    let h = Harness::new().await;
    h.repo.save("b", &b"x"[..]).await.unwrap();
    h.remote.add_deleted("b");
    h.remote.fail_live_listing.store(true, Ordering::SeqCst);

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, KeeperError::Remote { status: 503, .. }));
    assert_eq!(h.names().await, vec!["b"]);
    assert_eq!(h.checkpoint().await, SyncCheckpoint::beginning_of_time("alice"));
}

#[tokio::test]
async fn test_uploaded_then_deleted_never_lands() {
    let h = Harness::new().await;
    h.remote.add_deleted("ephemeral");

    let report = h.run().await.unwrap();
    assert_eq!(report.mutations(), 0);
    assert!(!h.repo.exists("ephemeral").await);
}

#[tokio::test]
async fn test_path_like_remote_name_fails_pass() {
    let h = Harness::new().await;
    h.remote.add_live("../outside", b"evil");

    let err = h.run().await.unwrap_err();
    assert!(matches!(err, KeeperError::InvalidName(_)));
    assert!(!h.repo.root().join("../outside").exists());
    assert_eq!(h.checkpoint().await, SyncCheckpoint::beginning_of_time("alice"));
}

#[tokio::test]
async fn test_cancelled_pass_does_not_commit() {
    let h = Harness::new().await;
    h.remote.add_live("a", b"1");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h.reconciler.run("alice", &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(h.checkpoint().await, SyncCheckpoint::beginning_of_time("alice"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_files_with_small_pool() {
    let h = Harness::new().await;
    for i in 0..40 {
        h.remote.add_live(&format!("f{i:02}"), format!("body {i}").as_bytes());
    }

    let report = h.run().await.unwrap();

    assert_eq!(report.downloaded, 40);
    assert_eq!(h.names().await.len(), 40);
    assert_eq!(h.repo.get_content("f07").await.unwrap(), "body 7");
}

#[tokio::test]
async fn test_encrypted_blob_survives_sync_round_trip() {
    use keeper_crypto::KdfParams;

    let h = Harness::new().await;
    let source = VaultRepository::open(h.layout.root().join("elsewhere"))
        .await
        .unwrap()
        .with_kdf_params(KdfParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        });
    let pw = SecretString::from("pw");
    let plain = h.layout.root().join("plain.txt");
    std::fs::write(&plain, b"synced secret").unwrap();
    source.encrypt_file(&plain, "secret.enc", &pw).await.unwrap();
    let blob = std::fs::read(source.get_path("secret.enc")).unwrap();

    h.remote.add_live("secret.enc", &blob);
    h.run().await.unwrap();

    let out = h.layout.root().join("out.txt");
    let local = VaultRepository::open(h.repo.root())
        .await
        .unwrap()
        .with_kdf_params(KdfParams {
            mem_cost_kib: 256,
            time_cost: 1,
            parallelism: 1,
        });
    local.decrypt_file("secret.enc", &out, &pw).await.unwrap();
    assert_eq!(std::fs::read(out).unwrap(), b"synced secret");
}
