use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

#[derive(Debug, Error)]
pub enum CryptoError {
    /// Tag verification failed: wrong password, tampered or truncated blob.
    #[error("authentication failed: wrong password or corrupted data")]
    AuthenticationFailed,

    #[error("malformed header: expected {expected} bytes, got {actual}")]
    MalformedHeader { expected: usize, actual: usize },

    #[error("key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
