//! Key derivation: Argon2id password + per-blob salt → vault key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit key derived from a password via Argon2id.
///
/// Zeroized on drop so key material does not outlive the operation using it.
#[derive(Clone)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl KdfParams {
    /// Check the parameters against Argon2's accepted ranges without hashing.
    pub fn validate(&self) -> CryptoResult<()> {
        self.to_argon2().map(|_| ())
    }

    fn to_argon2(&self) -> CryptoResult<Params> {
        Params::new(
            self.mem_cost_kib,
            self.time_cost,
            self.parallelism,
            Some(KEY_SIZE),
        )
        .map_err(|e| CryptoError::KeyDerivationFailed(format!("invalid Argon2id params: {e}")))
    }
}

/// Generate a fresh random salt. Each blob gets its own.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit vault key from a password and salt using Argon2id.
///
/// Deterministic for a given (password, salt, params) triple. The salt is not
/// secret and travels in the blob header.
pub fn derive_key(
    password: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CryptoResult<VaultKey> {
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(password.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyDerivationFailed(format!("Argon2id KDF failed: {e}")))?;

    let derived = VaultKey::from_bytes(key);
    key.zeroize();
    Ok(derived)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let password = SecretString::from("test-password-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_key(&password, &salt, &fast_params()).unwrap();
        let key2 = derive_key(&password, &salt, &fast_params()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passwords() {
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_key(&SecretString::from("password-a"), &salt, &fast_params()).unwrap();
        let key2 = derive_key(&SecretString::from("password-b"), &salt, &fast_params()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let password = SecretString::from("same-password");

        let key1 = derive_key(&password, &[1u8; SALT_SIZE], &fast_params()).unwrap();
        let key2 = derive_key(&password, &[2u8; SALT_SIZE], &fast_params()).unwrap();

        assert_ne!(
            key1.as_bytes(),
            key2.as_bytes(),
            "different salts must produce different keys"
        );
    }

    #[test]
    fn test_kdf_is_not_zero_padding() {
        let password = SecretString::from("short");
        let key = derive_key(&password, &[0u8; SALT_SIZE], &fast_params()).unwrap();

        let mut padded = [0u8; KEY_SIZE];
        padded[..5].copy_from_slice(b"short");
        assert_ne!(key.as_bytes(), &padded);
    }

    #[test]
    fn test_invalid_params_rejected() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        assert!(params.validate().is_err());

        let err = derive_key(&SecretString::from("pw"), &[0u8; SALT_SIZE], &params).unwrap_err();
        assert!(matches!(err, CryptoError::KeyDerivationFailed(_)));
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = VaultKey::from_bytes([0xAB; KEY_SIZE]);
        let printed = format!("{key:?}");
        assert!(printed.contains("REDACTED"));
        assert!(!printed.contains("171"));
    }
}
