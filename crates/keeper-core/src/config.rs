use keeper_crypto::KdfParams;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KeeperError, KeeperResult};

/// Top-level client configuration (loaded from keeper.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeeperConfig {
    pub client: ClientConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub crypto: CryptoConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the vault server API
    pub server_address: String,
    /// Per-request timeout in seconds (default: 15)
    pub request_timeout_secs: u64,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the local state tree (files/, tokens/, sync/)
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent network operations during a sync pass
    pub workers: usize,
    /// Pending jobs the dispatcher accepts before `add_work` waits
    pub queue_capacity: usize,
}

/// Argon2id cost parameters used when deriving keys from passwords
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "http://localhost:8080/api/v1".into(),
            request_timeout_secs: 15,
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./_storage"),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 64,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        let params = KdfParams::default();
        Self {
            argon2_mem_cost_kib: params.mem_cost_kib,
            argon2_time_cost: params.time_cost,
            argon2_parallelism: params.parallelism,
        }
    }
}

impl CryptoConfig {
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            mem_cost_kib: self.argon2_mem_cost_kib,
            time_cost: self.argon2_time_cost,
            parallelism: self.argon2_parallelism,
        }
    }
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl KeeperConfig {
    /// Parse a TOML document; missing sections and keys take their defaults.
    pub fn from_toml(content: &str) -> KeeperResult<Self> {
        toml::from_str(content).map_err(|e| KeeperError::Config(e.to_string()))
    }

    /// Reject settings the core cannot run with. Called once, before any
    /// repository or network operation starts.
    pub fn validate(&self) -> KeeperResult<()> {
        let addr = self.client.server_address.trim();
        if addr.is_empty() {
            return Err(KeeperError::Config("client.server_address is empty".into()));
        }
        let url = reqwest::Url::parse(addr).map_err(|e| {
            KeeperError::Config(format!("client.server_address {addr:?} is not a URL: {e}"))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(KeeperError::Config(format!(
                "client.server_address must use http or https, got {}",
                url.scheme()
            )));
        }
        if url.scheme() == "http" && !is_loopback(&url) {
            tracing::warn!(
                server = %addr,
                "server address uses plaintext HTTP; bearer tokens are sent unencrypted"
            );
        }
        if self.client.request_timeout_secs == 0 {
            return Err(KeeperError::Config(
                "client.request_timeout_secs must be positive".into(),
            ));
        }
        if !matches!(self.client.log_format.as_str(), "json" | "text") {
            return Err(KeeperError::Config(format!(
                "client.log_format must be \"json\" or \"text\", got {:?}",
                self.client.log_format
            )));
        }
        if self.storage.root.as_os_str().is_empty() {
            return Err(KeeperError::Config("storage.root is empty".into()));
        }
        if self.sync.workers == 0 {
            return Err(KeeperError::Config("sync.workers must be at least 1".into()));
        }
        if self.sync.queue_capacity == 0 {
            return Err(KeeperError::Config(
                "sync.queue_capacity must be at least 1".into(),
            ));
        }
        self.crypto
            .kdf_params()
            .validate()
            .map_err(|e| KeeperError::Config(format!("crypto: {e}")))?;
        Ok(())
    }
}

fn is_loopback(url: &reqwest::Url) -> bool {
    matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"))
}
