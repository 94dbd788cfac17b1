//! Bearer tokens issued by `login`, one file per username.

use keeper_core::{KeeperError, KeeperResult};
use secrecy::{ExposeSecret, SecretString};

use crate::repository::VaultRepository;

pub struct TokenStore {
    repo: VaultRepository,
}

impl TokenStore {
    pub fn new(repo: VaultRepository) -> Self {
        Self { repo }
    }

    pub async fn save(&self, user: &str, token: &SecretString) -> KeeperResult<()> {
        self.repo
            .save(user, token.expose_secret().as_bytes())
            .await?;
        tracing::info!(user, "token saved");
        Ok(())
    }

    /// Load the token for `user`; `TokenNotFound` if they never logged in.
    pub async fn load(&self, user: &str) -> KeeperResult<SecretString> {
        match self.repo.get_content(user).await {
            Ok(token) => Ok(SecretString::from(token.trim().to_owned())),
            Err(KeeperError::NotFound(_)) => Err(KeeperError::TokenNotFound(user.to_string())),
            Err(e) => Err(e),
        }
    }
}
