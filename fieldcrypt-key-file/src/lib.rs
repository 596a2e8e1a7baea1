//! File-based master key source for `fieldcrypt`.
//!
//! The local master key lives in a single file holding the base64 encoding
//! of [`MASTER_KEY_SIZE`] random bytes. The file is created with `0600`
//! permissions on first use and read back on every later start. This is
//! suitable for development and single-host deployments.

#![warn(clippy::pedantic, clippy::nursery)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use fieldcrypt::error::KeyProviderError;
use fieldcrypt::key_provider::{MasterKey, MasterKeySource, MASTER_KEY_SIZE};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use tempfile::NamedTempFile;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Master key stored in a local file.
///
/// ```text
/// local_master_key.txt   (base64 of 96 bytes, 0600 permissions)
/// ```
#[derive(Debug, Clone)]
pub struct FileMasterKeySource {
    path: PathBuf,
}

impl FileMasterKeySource {
    /// Creates a source for the key file at `path`. Nothing is read until
    /// [`load`](MasterKeySource::load) is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the key file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` if the key file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Generates a new key and writes it to the file.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::Io` with kind `AlreadyExists` if the file
    /// is already present; an existing key is never overwritten.
    pub fn generate(&self) -> Result<MasterKey, KeyProviderError> {
        let mut bytes = vec![0u8; MASTER_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        let encoded = Zeroizing::new(BASE64.encode(&bytes));

        write_secret_file(&self.path, encoded.as_bytes())?;
        info!(path = %self.path.display(), "generated local master key");
        MasterKey::from_bytes(bytes)
    }

    fn read(&self) -> Result<MasterKey, KeyProviderError> {
        let contents = read_secret_file(&self.path)?;
        let encoded = contents.expose_secret().trim();
        if encoded.is_empty() {
            return Err(KeyProviderError::MasterKeyUnavailable(format!(
                "key file {} is empty",
                self.path.display()
            )));
        }
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| KeyProviderError::InvalidMasterKey(format!("not valid base64: {e}")))?;
        let key = MasterKey::from_bytes(bytes)?;
        debug!(path = %self.path.display(), "loaded local master key");
        Ok(key)
    }
}

impl MasterKeySource for FileMasterKeySource {
    fn load(&self) -> Result<MasterKey, KeyProviderError> {
        match self.generate() {
            Ok(key) => Ok(key),
            // Another process may have created it between our checks.
            Err(KeyProviderError::Io(e)) if e.kind() == ErrorKind::AlreadyExists => self.read(),
            Err(e) => Err(e),
        }
    }
}

/// Reads a secret file into a zeroizing string.
///
/// # Errors
///
/// Returns `KeyProviderError::Io` on read failure, or
/// `KeyProviderError::InvalidMasterKey` if the content is not UTF-8.
pub fn read_secret_file(path: &Path) -> Result<SecretString, KeyProviderError> {
    let raw = Zeroizing::new(fs::read(path)?);
    let text = std::str::from_utf8(&raw)
        .map_err(|_| KeyProviderError::InvalidMasterKey("key file is not UTF-8".to_string()))?;
    Ok(SecretString::new(text.to_string()))
}

/// Atomically creates `path` with owner-only permissions holding `contents`.
///
/// The contents are written and synced to a temporary file in the same
/// directory, which is then linked into place only if `path` does not exist.
/// Readers never observe a partially written file, and a failed write
/// leaves nothing behind. Parent directories are created as needed.
///
/// # Errors
///
/// Returns `KeyProviderError::Io` with kind `AlreadyExists` if the file
/// exists, or any other I/O error from writing it.
pub fn write_secret_file(path: &Path, contents: &[u8]) -> Result<(), KeyProviderError> {
    let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent)?;
            parent
        }
        None => Path::new("."),
    };

    // NamedTempFile is created 0600 on unix and removed on drop.
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(contents)?;
    file.as_file().sync_all()?;
    file.persist_noclobber(path).map_err(|e| KeyProviderError::Io(e.error))?;
    Ok(())
}
