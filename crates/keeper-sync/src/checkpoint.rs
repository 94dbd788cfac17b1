//! Per-owner sync checkpoints, one small text file per username.

use keeper_core::{KeeperError, KeeperResult, SyncCheckpoint};
use keeper_storage::VaultRepository;
use tracing::{debug, warn};

pub struct CheckpointStore {
    repo: VaultRepository,
}

impl CheckpointStore {
    pub fn new(repo: VaultRepository) -> Self {
        Self { repo }
    }

    /// Last committed checkpoint for `owner`.
    ///
    /// A missing checkpoint means the owner never synced. An unreadable one is
    /// logged and treated the same way; a full rescan is harmless because
    /// every sync mutation is existence-gated.
    pub async fn load(&self, owner: &str) -> KeeperResult<SyncCheckpoint> {
        match self.repo.get_content(owner).await {
            Ok(stored) => Ok(SyncCheckpoint::parse(owner, &stored).unwrap_or_else(|| {
                warn!(owner, stored = %stored.trim(), "unparsable sync checkpoint, rescanning");
                SyncCheckpoint::beginning_of_time(owner)
            })),
            Err(KeeperError::NotFound(_)) => {
                debug!(owner, "no sync checkpoint yet");
                Ok(SyncCheckpoint::beginning_of_time(owner))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, checkpoint: &SyncCheckpoint) -> KeeperResult<()> {
        let encoded = checkpoint.encode();
        self.repo
            .save(&checkpoint.owner, encoded.as_bytes())
            .await?;
        debug!(owner = %checkpoint.owner, at = %encoded, "sync checkpoint committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    async fn store(dir: &tempfile::TempDir) -> CheckpointStore {
        CheckpointStore::new(VaultRepository::open(dir.path()).await.unwrap())
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_epoch() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cp = store(&tmp).await.load("alice").await.unwrap();
        assert_eq!(cp, SyncCheckpoint::beginning_of_time("alice"));
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = store(&tmp).await;
        let cp = SyncCheckpoint::new("alice", Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap());

        store.save(&cp).await.unwrap();
        assert_eq!(store.load("alice").await.unwrap(), cp);
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("alice")).unwrap(),
            "2025-06-01T08:30:00Z"
        );
    }

    #[tokio::test]
    async fn test_garbage_checkpoint_is_epoch() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("bob"), "not a date").unwrap();

        let cp = store(&tmp).await.load("bob").await.unwrap();
        assert_eq!(cp.query_date(), "1970-01-01");
    }
}
