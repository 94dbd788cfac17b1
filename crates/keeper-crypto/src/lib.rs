//! keeper-crypto: client-side encryption for Keeper vault blobs
//!
//! Architecture: password → Argon2id → 256-bit key → chunked AES-256-GCM stream
//!
//! Blob layout (salt is written by the vault repository, the rest by [`ChunkCipher`]):
//! ```text
//! [16 bytes: Argon2id salt][12 bytes: base nonce][chunk 0][chunk 1]...[chunk N]
//!
//! chunk i  = AES-256-GCM(key, nonce_i, plaintext_i) = ciphertext_i || 16-byte tag
//! nonce_i  = base_nonce XOR (0^7 || BE32(i) || last_flag)
//! ```
//!
//! Every chunk except the last carries exactly [`CHUNK_SIZE`] bytes of
//! plaintext. The final chunk is sealed with `last_flag = 1`, so dropping
//! trailing chunks or appending data fails authentication.

pub mod error;
pub mod kdf;
pub mod stream;

pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_key, generate_salt, KdfParams, VaultKey};
pub use stream::{chunk_nonce, decrypt_stream, encrypt_stream, ChunkCipher, ProgressFn};

/// Size of a vault key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the per-blob Argon2id salt
pub const SALT_SIZE: usize = 16;

/// Size of an AES-GCM nonce (96-bit)
pub const NONCE_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Plaintext bytes sealed per chunk. Bounds peak memory regardless of file size.
pub const CHUNK_SIZE: usize = 4096;

/// Full blob header: salt followed by the base nonce
pub const HEADER_SIZE: usize = SALT_SIZE + NONCE_SIZE;
