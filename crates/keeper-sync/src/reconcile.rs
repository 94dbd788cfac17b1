//! One reconciliation pass between the remote listing and a local vault.
//!
//! ```text
//! ReadCheckpoint -> FetchDeletions -> FetchAdditions -> apply deletions -> apply additions -> CommitCheckpoint
//! ```
//!
//! Both listings are fetched before anything local changes. A name that has a
//! live row is never deleted locally, even when the same window also carries a
//! deleted row for it: the live upload wins and an existing local copy is held.
//! Both phases fan out over a [`WorkDispatcher`] and fail fast: the first
//! failed job cancels the rest of the phase, and the checkpoint only moves when
//! every job succeeded.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use keeper_core::config::SyncConfig;
use keeper_core::{KeeperError, KeeperResult, RemoteRow, SyncCheckpoint};
use keeper_storage::{validate_name, VaultRepository};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::dispatcher::{Job, WorkDispatcher};
use crate::remote::RemoteVault;

/// Outcome of a successful pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub deleted: usize,
    pub downloaded: usize,
    pub checkpoint: SyncCheckpoint,
}

impl SyncReport {
    pub fn mutations(&self) -> usize {
        self.deleted + self.downloaded
    }
}

pub struct SyncReconciler {
    repo: Arc<VaultRepository>,
    remote: Arc<dyn RemoteVault>,
    checkpoints: CheckpointStore,
    workers: usize,
    queue_capacity: usize,
}

impl SyncReconciler {
    pub fn new(
        repo: Arc<VaultRepository>,
        remote: Arc<dyn RemoteVault>,
        checkpoints: CheckpointStore,
    ) -> Self {
        let defaults = SyncConfig::default();
        Self {
            repo,
            remote,
            checkpoints,
            workers: defaults.workers,
            queue_capacity: defaults.queue_capacity,
        }
    }

    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.workers = config.workers;
        self.queue_capacity = config.queue_capacity;
        self
    }

    /// Run one pass for `owner`.
    pub async fn run(&self, owner: &str, cancel: &CancellationToken) -> KeeperResult<SyncReport> {
        let started = Utc::now();
        let checkpoint = self.checkpoints.load(owner).await?;
        let since = checkpoint.query_date();
        info!(owner, since = %since, "sync pass started");

        let deleted_rows = self.remote.list_uploads(true, &since).await?;
        let live_rows = self.remote.list_uploads(false, &since).await?;
        let live: HashSet<&str> = live_rows.iter().map(|r| r.name.as_str()).collect();

        let to_delete = self.plan_deletions(&deleted_rows, &live).await?;
        let to_download = self.plan_additions(&live_rows).await?;

        let deleted = self.delete_local(owner, to_delete, cancel).await?;
        let downloaded = self.download(owner, to_download, cancel).await?;

        if cancel.is_cancelled() {
            return Err(KeeperError::Cancelled);
        }
        let next = SyncCheckpoint::new(owner, started);
        self.checkpoints.save(&next).await?;

        info!(owner, deleted, downloaded, "sync pass complete");
        Ok(SyncReport {
            deleted,
            downloaded,
            checkpoint: next,
        })
    }

    /// Names from deleted rows that currently exist locally and have no live
    /// row in the same listing.
    async fn plan_deletions(
        &self,
        rows: &[RemoteRow],
        live: &HashSet<&str>,
    ) -> KeeperResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        for row in rows {
            validate_name(&row.name)?;
            if live.contains(row.name.as_str()) {
                debug!(name = %row.name, "deleted row superseded by a live upload");
                continue;
            }
            if seen.insert(row.name.as_str()) && self.repo.exists(&row.name).await {
                plan.push(row.name.clone());
            }
        }
        debug!(remote = rows.len(), local = plan.len(), "planned deletions");
        Ok(plan)
    }

    /// Names from live rows that are absent locally.
    async fn plan_additions(&self, rows: &[RemoteRow]) -> KeeperResult<Vec<String>> {
        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        for row in rows {
            validate_name(&row.name)?;
            if seen.insert(row.name.as_str()) && !self.repo.exists(&row.name).await {
                plan.push(row.name.clone());
            }
        }
        debug!(remote = rows.len(), missing = plan.len(), "planned additions");
        Ok(plan)
    }

    async fn delete_local(
        &self,
        owner: &str,
        names: Vec<String>,
        cancel: &CancellationToken,
    ) -> KeeperResult<usize> {
        let repo = self.repo.clone();
        self.run_phase("delete", owner, names, cancel, move |job: Job| {
            let repo = repo.clone();
            async move {
                match repo.delete(&job.key).await {
                    // Gone since planning; the end state is the same.
                    Err(KeeperError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
        })
        .await
    }

    async fn download(
        &self,
        owner: &str,
        names: Vec<String>,
        cancel: &CancellationToken,
    ) -> KeeperResult<usize> {
        let repo = self.repo.clone();
        let remote = self.remote.clone();
        self.run_phase("download", owner, names, cancel, move |job: Job| {
            let repo = repo.clone();
            let remote = remote.clone();
            async move {
                let body = remote.download(&job.key).await?;
                let bytes = repo.save(&job.key, body).await?;
                debug!(name = %job.key, bytes, "downloaded");
                Ok(())
            }
        })
        .await
    }

    /// Fan `names` out over a dispatcher and collect results, cancelling the
    /// remainder on the first failure. Returns the number of succeeded jobs.
    async fn run_phase<F, Fut>(
        &self,
        phase: &'static str,
        owner: &str,
        names: Vec<String>,
        cancel: &CancellationToken,
        processor: F,
    ) -> KeeperResult<usize>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = KeeperResult<()>> + Send + 'static,
    {
        if names.is_empty() {
            return Ok(0);
        }
        let total = names.len();
        let phase_cancel = cancel.child_token();
        let (dispatcher, mut results) =
            WorkDispatcher::spawn(self.workers, self.queue_capacity, processor);

        let submit = async {
            for name in names {
                if phase_cancel.is_cancelled() {
                    break;
                }
                let job = Job::new(name, owner).with_cancellation(phase_cancel.child_token());
                if dispatcher.add_work(job).await.is_err() {
                    break;
                }
            }
            dispatcher.close().await;
        };

        let collect = async {
            let mut ok = 0;
            let mut first_err: Option<KeeperError> = None;
            while let Some(result) = results.recv().await {
                match result.outcome {
                    Ok(()) => ok += 1,
                    Err(e) => {
                        if first_err.is_none() {
                            warn!(phase, name = %result.key, "sync job failed: {e}");
                            phase_cancel.cancel();
                            first_err = Some(e);
                        } else if !e.is_cancelled() {
                            warn!(phase, name = %result.key, "sync job failed: {e}");
                        }
                    }
                }
            }
            (ok, first_err)
        };

        let ((), (ok, first_err)) = tokio::join!(submit, collect);
        dispatcher.shutdown().await;

        if let Some(e) = first_err {
            // An outer cancellation shows up as per-job Cancelled results.
            if cancel.is_cancelled() {
                return Err(KeeperError::Cancelled);
            }
            return Err(e);
        }
        debug!(phase, owner, ok, total, "phase complete");
        Ok(ok)
    }
}
