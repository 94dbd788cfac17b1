use std::path::PathBuf;

use keeper_crypto::CryptoError;
use thiserror::Error;

pub type KeeperResult<T> = Result<T, KeeperError>;

#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("token not found for user: {0}")]
    TokenNotFound(String),

    #[error("invalid file name: {0:?}")]
    InvalidName(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("I/O error during {op} on {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote returned HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("work dispatcher is closed")]
    DispatcherClosed,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KeeperError {
    /// Attach the failing operation and path to an I/O error.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        KeeperError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, KeeperError::NotFound(_) | KeeperError::TokenNotFound(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            KeeperError::Cancelled | KeeperError::Crypto(CryptoError::Cancelled)
        )
    }
}
