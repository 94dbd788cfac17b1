//! The remote vault server as seen by the client.

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use keeper_core::{KeeperResult, RemoteRow};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// Streaming body of a downloaded blob.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Free-form metadata sent alongside an upload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadMeta {
    pub description: String,
    pub category: String,
}

/// Operations the client performs against the server.
///
/// Implementations attach whatever authentication they hold; `register` and
/// `login` must work without a token.
#[async_trait]
pub trait RemoteVault: Send + Sync {
    async fn register(
        &self,
        username: &str,
        password: &SecretString,
        email: &str,
    ) -> KeeperResult<()>;

    /// Authenticate and return the bearer token.
    async fn login(&self, username: &str, password: &SecretString) -> KeeperResult<SecretString>;

    /// Upload the file at `path` under `name`. Returns the server-side UUID.
    async fn upload(&self, path: &Path, name: &str, meta: &UploadMeta) -> KeeperResult<String>;

    async fn download(&self, name: &str) -> KeeperResult<BlobReader>;

    async fn delete(&self, name: &str) -> KeeperResult<()>;

    /// Every row with the given deletion flag uploaded on or after `since`
    /// (`YYYY-MM-DD`), across all pages.
    async fn list_uploads(&self, deleted: bool, since: &str) -> KeeperResult<Vec<RemoteRow>>;
}
