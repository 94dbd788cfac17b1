//! Local vault namespace: one directory of named blobs behind a single
//! readers-writer lock.
//!
//! Every operation that touches the directory takes the lock: the rename that
//! publishes a `save` and `delete` exclusively, listing/reading/encrypting/
//! decrypting shared.
//! `get_path` is pure and takes no lock. Writes land in a temp file next to
//! the target and are renamed into place, so a failed write never leaves a
//! half-written blob under a valid name.
//!
//! The lock is per repository instance; two processes sharing one root are
//! not coordinated.

use keeper_core::{File, KeeperError, KeeperResult};
use keeper_crypto::{
    derive_key, generate_salt, ChunkCipher, CryptoError, KdfParams, ProgressFn, VaultKey,
    SALT_SIZE,
};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Suffix of in-flight temp files; never a valid blob name.
pub const TMP_SUFFIX: &str = ".keeper-tmp";

/// Cancellation and progress hooks for long-running encrypt/decrypt calls.
#[derive(Default)]
pub struct TransferOptions {
    pub cancel: CancellationToken,
    pub progress: Option<ProgressFn>,
}

impl TransferOptions {
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }
}

/// Check that `name` is a single, plain path component.
pub fn validate_name(name: &str) -> KeeperResult<()> {
    let bad = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
        || name.ends_with(TMP_SUFFIX);
    if bad {
        return Err(KeeperError::InvalidName(name.to_string()));
    }
    Ok(())
}

pub struct VaultRepository {
    root: PathBuf,
    lock: RwLock<()>,
    kdf: KdfParams,
}

impl VaultRepository {
    /// Open (creating if absent) the repository rooted at `root`.
    ///
    /// Leftover `*.keeper-tmp` files from an interrupted writer are removed.
    pub async fn open(root: impl Into<PathBuf>) -> KeeperResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| KeeperError::io("create root", &root, e))?;
        let swept = sweep_temp_files(&root).await?;
        debug!(root = %root.display(), swept, "vault repository opened");
        Ok(Self {
            root,
            lock: RwLock::new(()),
            kdf: KdfParams::default(),
        })
    }

    /// Argon2id cost used by `encrypt_*`/`decrypt_*`.
    pub fn with_kdf_params(mut self, params: KdfParams) -> Self {
        self.kdf = params;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of `name` under the root. No I/O, no lock.
    pub fn get_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Create or fully replace `name` with the bytes of `data`.
    ///
    /// Returns the number of bytes stored.
    pub async fn save<R>(&self, name: &str, mut data: R) -> KeeperResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        validate_name(name)?;

        // Bytes stream into a private temp file; only the rename into the
        // namespace takes the write lock.
        let target = self.get_path(name);
        let tmp = TempFile::new(self.tmp_path(name));
        let result: KeeperResult<u64> = async {
            let file = fs::File::create(tmp.path())
                .await
                .map_err(|e| KeeperError::io("create", tmp.path(), e))?;
            let mut writer = BufWriter::new(file);
            let n = tokio::io::copy(&mut data, &mut writer)
                .await
                .map_err(|e| KeeperError::io("save", &target, e))?;
            finish_file(writer, tmp.path()).await?;
            Ok(n)
        }
        .await;

        let _guard = self.lock.write().await;
        let n = commit(result, tmp, &target).await?;
        debug!(name, bytes = n, "saved");
        Ok(n)
    }

    /// List all blobs. Order follows the directory listing and is unspecified.
    pub async fn find_all(&self) -> KeeperResult<Vec<File>> {
        let _guard = self.lock.read().await;

        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| KeeperError::io("list", &self.root, e))?;

        let mut files = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| KeeperError::io("list", &self.root, e))?
        {
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                warn!(path = %entry.path().display(), "skipping non-UTF-8 file name");
                continue;
            };
            if name.ends_with(TMP_SUFFIX) {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between listing and stat.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(KeeperError::io("stat", entry.path(), e)),
            };
            if meta.is_dir() {
                continue;
            }
            files.push(File::new(name, entry.path(), meta.len()));
        }
        Ok(files)
    }

    /// Remove `name`. Fails with `NotFound` if it does not exist.
    pub async fn delete(&self, name: &str) -> KeeperResult<()> {
        validate_name(name)?;
        let _guard = self.lock.write().await;

        let path = self.get_path(name);
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(e, "delete", name, &path))?;
        debug!(name, "deleted");
        Ok(())
    }

    /// Open `name` for streaming reads.
    pub async fn get(&self, name: &str) -> KeeperResult<fs::File> {
        validate_name(name)?;
        let _guard = self.lock.read().await;

        let path = self.get_path(name);
        fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, "open", name, &path))
    }

    /// Read `name` fully as UTF-8 text.
    pub async fn get_content(&self, name: &str) -> KeeperResult<String> {
        validate_name(name)?;
        let _guard = self.lock.read().await;

        let path = self.get_path(name);
        fs::read_to_string(&path)
            .await
            .map_err(|e| not_found_or_io(e, "read", name, &path))
    }

    pub async fn exists(&self, name: &str) -> bool {
        if validate_name(name).is_err() {
            return false;
        }
        let _guard = self.lock.read().await;
        fs::metadata(self.get_path(name))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Encrypt the external file `input_path` into the vault as `output_name`.
    pub async fn encrypt_file(
        &self,
        input_path: &Path,
        output_name: &str,
        password: &SecretString,
    ) -> KeeperResult<u64> {
        self.encrypt_file_with(input_path, output_name, password, TransferOptions::default())
            .await
    }

    pub async fn encrypt_file_with(
        &self,
        input_path: &Path,
        output_name: &str,
        password: &SecretString,
        opts: TransferOptions,
    ) -> KeeperResult<u64> {
        let input = fs::File::open(input_path)
            .await
            .map_err(|e| KeeperError::io("open input", input_path, e))?;
        self.encrypt_reader(BufReader::new(input), output_name, password, opts)
            .await
    }

    /// Encrypt an arbitrary byte stream into the vault as `output_name`.
    ///
    /// Writes `salt || base nonce || chunks` to a temp file and renames it into
    /// place once the last chunk is sealed. Returns plaintext bytes consumed.
    pub async fn encrypt_reader<R>(
        &self,
        input: R,
        output_name: &str,
        password: &SecretString,
        opts: TransferOptions,
    ) -> KeeperResult<u64>
    where
        R: AsyncRead + Unpin,
    {
        validate_name(output_name)?;
        let _guard = self.lock.read().await;

        let salt = generate_salt();
        let key = self.derive(password, salt).await?;

        let target = self.get_path(output_name);
        let tmp = TempFile::new(self.tmp_path(output_name));
        let result: KeeperResult<u64> = async {
            let file = fs::File::create(tmp.path())
                .await
                .map_err(|e| KeeperError::io("create", tmp.path(), e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(&salt)
                .await
                .map_err(|e| KeeperError::io("write header", tmp.path(), e))?;
            let n = cipher(&key, opts).encrypt_stream(input, &mut writer).await?;
            finish_file(writer, tmp.path()).await?;
            Ok(n)
        }
        .await;

        let n = commit(result, tmp, &target).await?;
        debug!(name = output_name, bytes = n, "encrypted into vault");
        Ok(n)
    }

    /// Decrypt vault blob `input_name` to the external path `output_path`.
    ///
    /// On failure `output_path` may hold the verified prefix of the plaintext;
    /// removing it is up to the caller.
    pub async fn decrypt_file(
        &self,
        input_name: &str,
        output_path: &Path,
        password: &SecretString,
    ) -> KeeperResult<u64> {
        self.decrypt_file_with(input_name, output_path, password, TransferOptions::default())
            .await
    }

    pub async fn decrypt_file_with(
        &self,
        input_name: &str,
        output_path: &Path,
        password: &SecretString,
        opts: TransferOptions,
    ) -> KeeperResult<u64> {
        // Open the blob first so a missing name does not create the output.
        let (blob, salt) = self.open_blob(input_name).await?;
        let output = fs::File::create(output_path)
            .await
            .map_err(|e| KeeperError::io("create output", output_path, e))?;
        let mut writer = BufWriter::new(output);

        let key = self.derive(password, salt).await?;
        let _guard = self.lock.read().await;
        let n = cipher(&key, opts).decrypt_stream(blob, &mut writer).await?;
        writer
            .flush()
            .await
            .map_err(|e| KeeperError::io("flush", output_path, e))?;
        debug!(name = input_name, output = %output_path.display(), bytes = n, "decrypted");
        Ok(n)
    }

    /// Decrypt vault blob `input_name` into any writer.
    pub async fn decrypt_to_writer<W>(
        &self,
        input_name: &str,
        output: W,
        password: &SecretString,
        opts: TransferOptions,
    ) -> KeeperResult<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let (blob, salt) = self.open_blob(input_name).await?;
        let key = self.derive(password, salt).await?;
        let _guard = self.lock.read().await;
        Ok(cipher(&key, opts).decrypt_stream(blob, output).await?)
    }

    /// Open a blob and consume its salt, leaving the reader at the base nonce.
    async fn open_blob(&self, name: &str) -> KeeperResult<(BufReader<fs::File>, [u8; SALT_SIZE])> {
        validate_name(name)?;
        let _guard = self.lock.read().await;

        let path = self.get_path(name);
        let file = fs::File::open(&path)
            .await
            .map_err(|e| not_found_or_io(e, "open", name, &path))?;
        let mut reader = BufReader::new(file);

        let mut salt = [0u8; SALT_SIZE];
        let mut filled = 0;
        while filled < SALT_SIZE {
            let n = reader
                .read(&mut salt[filled..])
                .await
                .map_err(|e| KeeperError::io("read header", &path, e))?;
            if n == 0 {
                return Err(CryptoError::MalformedHeader {
                    expected: SALT_SIZE,
                    actual: filled,
                }
                .into());
            }
            filled += n;
        }
        Ok((reader, salt))
    }

    /// Run Argon2id off the async executor.
    async fn derive(&self, password: &SecretString, salt: [u8; SALT_SIZE]) -> KeeperResult<VaultKey> {
        let password = SecretString::from(password.expose_secret().to_owned());
        let params = self.kdf.clone();
        tokio::task::spawn_blocking(move || derive_key(&password, &salt, &params))
            .await
            .map_err(|e| KeeperError::Other(anyhow::anyhow!("key derivation task failed: {e}")))?
            .map_err(KeeperError::from)
    }

    fn tmp_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{name}.{}{TMP_SUFFIX}", uuid::Uuid::new_v4().simple()))
    }
}

fn cipher(key: &VaultKey, opts: TransferOptions) -> ChunkCipher {
    let cipher = ChunkCipher::new(key).with_cancellation(opts.cancel);
    match opts.progress {
        Some(progress) => cipher.with_progress(progress),
        None => cipher,
    }
}

async fn finish_file(mut writer: BufWriter<fs::File>, path: &Path) -> KeeperResult<()> {
    writer
        .flush()
        .await
        .map_err(|e| KeeperError::io("flush", path, e))?;
    writer
        .into_inner()
        .sync_all()
        .await
        .map_err(|e| KeeperError::io("sync", path, e))
}

/// An in-flight temp file that is removed on drop unless it was persisted.
///
/// Dropping the owning future mid-write (a cancelled `select!` branch, an
/// aborted task) therefore never leaves the file behind.
struct TempFile {
    path: PathBuf,
    persisted: bool,
}

impl TempFile {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, target: &Path) -> KeeperResult<()> {
        fs::rename(&self.path, target)
            .await
            .map_err(|e| KeeperError::io("rename", target, e))?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove temp file: {e}");
            }
        }
    }
}

/// Rename `tmp` over `target` on success; discard `tmp` on failure.
async fn commit(result: KeeperResult<u64>, tmp: TempFile, target: &Path) -> KeeperResult<u64> {
    let n = result?;
    tmp.persist(target).await?;
    Ok(n)
}

/// Remove temp files left by a process that died mid-write.
async fn sweep_temp_files(root: &Path) -> KeeperResult<usize> {
    let mut dir = fs::read_dir(root)
        .await
        .map_err(|e| KeeperError::io("list", root, e))?;
    let mut swept = 0;
    while let Some(entry) = dir
        .next_entry()
        .await
        .map_err(|e| KeeperError::io("list", root, e))?
    {
        let is_tmp = entry
            .file_name()
            .to_str()
            .is_some_and(|n| n.ends_with(TMP_SUFFIX));
        if !is_tmp {
            continue;
        }
        match fs::remove_file(entry.path()).await {
            Ok(()) => swept += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(KeeperError::io("remove temp", entry.path(), e)),
        }
    }
    if swept > 0 {
        info!(root = %root.display(), swept, "removed stale temp files");
    }
    Ok(swept)
}

fn not_found_or_io(e: std::io::Error, op: &'static str, name: &str, path: &Path) -> KeeperError {
    if e.kind() == std::io::ErrorKind::NotFound {
        KeeperError::NotFound(name.to_string())
    } else {
        KeeperError::io(op, path, e)
    }
}
