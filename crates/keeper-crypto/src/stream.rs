//! Streaming chunked AES-256-GCM encryption/decryption
//!
//! Stream format (binary, after the salt written by the repository):
//! ```text
//! [12 bytes: random base nonce][ciphertext 0 || tag 0]...[ciphertext N || tag N]
//! ```
//!
//! No length prefixes: the reader advances in frames of `CHUNK_SIZE + TAG_SIZE`
//! bytes and looks one frame ahead to know which chunk is the final one.
//! Chunks are processed strictly in order; the nonce counter depends on it.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::VaultKey;
use crate::{CHUNK_SIZE, NONCE_SIZE, TAG_SIZE};

/// Progress callback, invoked with the cumulative plaintext bytes processed.
pub type ProgressFn = Box<dyn Fn(u64) + Send + Sync>;

/// Bytes of the nonce that carry the chunk counter and final-chunk flag.
const COUNTER_BYTES: usize = 5;

/// Derive the nonce for chunk `counter` from the per-file base nonce.
///
/// The counter (big-endian u32) and a final-chunk flag byte are XORed into
/// the last five bytes of the base nonce. Distinct `(counter, last)` pairs
/// always yield distinct nonces for the same base.
pub fn chunk_nonce(base: &[u8; NONCE_SIZE], counter: u32, last: bool) -> [u8; NONCE_SIZE] {
    let mut tail = [0u8; COUNTER_BYTES];
    tail[..4].copy_from_slice(&counter.to_be_bytes());
    tail[4] = u8::from(last);

    let mut nonce = *base;
    for (n, t) in nonce[NONCE_SIZE - COUNTER_BYTES..].iter_mut().zip(tail) {
        *n ^= t;
    }
    nonce
}

/// Chunked AEAD over async byte streams.
pub struct ChunkCipher {
    cipher: Aes256Gcm,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl ChunkCipher {
    pub fn new(key: &VaultKey) -> Self {
        Self {
            cipher: Aes256Gcm::new(key.as_bytes().into()),
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Abort between chunks once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Encrypt `input` into `output`: base nonce first, then sealed chunks.
    ///
    /// Returns the number of plaintext bytes consumed.
    pub async fn encrypt_stream<R, W>(&self, mut input: R, mut output: W) -> CryptoResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut base = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut base);
        output.write_all(&base).await?;

        let mut current = vec![0u8; CHUNK_SIZE];
        let mut next = vec![0u8; CHUNK_SIZE];
        let mut len = read_full(&mut input, &mut current).await?;
        let mut counter: u32 = 0;
        let mut total = 0u64;

        loop {
            self.check_cancelled()?;

            // A short read means EOF; a full one needs a look-ahead to decide.
            let (next_len, last) = if len < CHUNK_SIZE {
                (0, true)
            } else {
                let n = read_full(&mut input, &mut next).await?;
                (n, n == 0)
            };

            let nonce = chunk_nonce(&base, counter, last);
            let sealed = self
                .cipher
                .encrypt(Nonce::from_slice(&nonce), &current[..len])
                .map_err(|e| CryptoError::Encryption(format!("chunk {counter}: {e}")))?;
            output.write_all(&sealed).await?;

            total += len as u64;
            self.report(total);

            if last {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            len = next_len;
            counter = counter
                .checked_add(1)
                .ok_or_else(|| CryptoError::Encryption("chunk counter exhausted".into()))?;
        }

        output.flush().await?;
        debug!(bytes = total, chunks = counter as u64 + 1, "stream encrypted");
        Ok(total)
    }

    /// Decrypt a stream produced by [`ChunkCipher::encrypt_stream`].
    ///
    /// Each chunk is verified before its plaintext is written. On failure the
    /// chunks already verified stay in `output`; nothing unverified is emitted.
    /// Returns the number of plaintext bytes written.
    pub async fn decrypt_stream<R, W>(&self, mut input: R, mut output: W) -> CryptoResult<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut base = [0u8; NONCE_SIZE];
        let got = read_full(&mut input, &mut base).await?;
        if got < NONCE_SIZE {
            return Err(CryptoError::MalformedHeader {
                expected: NONCE_SIZE,
                actual: got,
            });
        }

        let frame = CHUNK_SIZE + TAG_SIZE;
        let mut current = vec![0u8; frame];
        let mut next = vec![0u8; frame];
        let mut len = read_full(&mut input, &mut current).await?;
        let mut counter: u32 = 0;
        let mut total = 0u64;

        loop {
            self.check_cancelled()?;

            // A stream always ends with a sealed final chunk, so running out
            // of frames or meeting a fragment shorter than a tag is tampering.
            if len < TAG_SIZE {
                return Err(CryptoError::AuthenticationFailed);
            }

            let (next_len, last) = if len < frame {
                (0, true)
            } else {
                let n = read_full(&mut input, &mut next).await?;
                (n, n == 0)
            };

            let nonce = chunk_nonce(&base, counter, last);
            let plaintext = self
                .cipher
                .decrypt(Nonce::from_slice(&nonce), &current[..len])
                .map_err(|_| CryptoError::AuthenticationFailed)?;
            output.write_all(&plaintext).await?;

            total += plaintext.len() as u64;
            self.report(total);

            if last {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            len = next_len;
            counter = counter
                .checked_add(1)
                .ok_or(CryptoError::AuthenticationFailed)?;
        }

        output.flush().await?;
        debug!(bytes = total, chunks = counter as u64 + 1, "stream decrypted");
        Ok(total)
    }

    fn check_cancelled(&self) -> CryptoResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CryptoError::Cancelled);
        }
        Ok(())
    }

    fn report(&self, done: u64) {
        if let Some(cb) = &self.progress {
            cb(done);
        }
    }
}

/// Encrypt `input` into `output` with `key`. See [`ChunkCipher::encrypt_stream`].
pub async fn encrypt_stream<R, W>(input: R, output: W, key: &VaultKey) -> CryptoResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    ChunkCipher::new(key).encrypt_stream(input, output).await
}

/// Decrypt `input` into `output` with `key`. See [`ChunkCipher::decrypt_stream`].
pub async fn decrypt_stream<R, W>(input: R, output: W, key: &VaultKey) -> CryptoResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    ChunkCipher::new(key).decrypt_stream(input, output).await
}

/// Fill `buf` from `reader`, stopping early only at EOF.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
