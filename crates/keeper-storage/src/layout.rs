//! On-disk layout of the client state tree.
//!
//! ```text
//! <root>/
//!   files/<username>/   encrypted blobs, one repository per user
//!   tokens/             bearer tokens, one file per username
//!   sync/               sync checkpoints, one file per username
//! ```

use std::path::{Path, PathBuf};

use keeper_core::KeeperResult;
use keeper_crypto::KdfParams;

use crate::repository::{validate_name, VaultRepository};

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    kdf: KdfParams,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            kdf: KdfParams::default(),
        }
    }

    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf = params;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files_dir(&self, user: &str) -> PathBuf {
        self.root.join("files").join(user)
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.root.join("tokens")
    }

    pub fn sync_dir(&self) -> PathBuf {
        self.root.join("sync")
    }

    /// The blob repository for `user`.
    pub async fn open_files(&self, user: &str) -> KeeperResult<VaultRepository> {
        validate_name(user)?;
        Ok(VaultRepository::open(self.files_dir(user))
            .await?
            .with_kdf_params(self.kdf.clone()))
    }

    pub async fn open_tokens(&self) -> KeeperResult<VaultRepository> {
        VaultRepository::open(self.tokens_dir()).await
    }

    pub async fn open_checkpoints(&self) -> KeeperResult<VaultRepository> {
        VaultRepository::open(self.sync_dir()).await
    }
}
