//! Master key and key provider abstractions.
//!
//! The master key is the root of the key hierarchy: it never encrypts field
//! data directly, it only wraps data encryption keys before they are stored
//! in the key vault.

use crate::error::{Error, KeyProviderError};
use crate::kdf::derive_wrapping_key;
use crate::vault::KeyId;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use std::fmt;

/// Size of the local master key in bytes.
pub const MASTER_KEY_SIZE: usize = 96;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

/// The single root key protecting every data encryption key.
///
/// `Debug` never prints the key material.
pub struct MasterKey(SecretVec<u8>);

impl MasterKey {
    /// Wraps existing key material.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::InvalidMasterKey` unless exactly
    /// [`MASTER_KEY_SIZE`] bytes are supplied.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, KeyProviderError> {
        if bytes.len() != MASTER_KEY_SIZE {
            return Err(KeyProviderError::InvalidMasterKey(format!(
                "expected {MASTER_KEY_SIZE} bytes, found {}",
                bytes.len()
            )));
        }
        Ok(Self(SecretVec::new(bytes)))
    }

    /// Generates a fresh random master key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; MASTER_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(SecretVec::new(bytes))
    }

    /// Returns the secret key material.
    #[must_use]
    pub const fn secret(&self) -> &SecretVec<u8> {
        &self.0
    }
}

impl fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Supplies the master key, generating and persisting it on first use.
///
/// `load` must be deterministic: once a key has been persisted, every call
/// returns that same key.
pub trait MasterKeySource: Send + Sync {
    /// Loads the persisted master key or generates, persists and returns a
    /// new one.
    ///
    /// # Errors
    ///
    /// Any error is fatal to startup: without the master key no data key can
    /// be unwrapped.
    fn load(&self) -> Result<MasterKey, KeyProviderError>;
}

/// Wraps and unwraps data encryption keys.
///
/// Implementations must be thread-safe (`Send + Sync`); the key vault calls
/// them from any thread.
pub trait KeyProvider: Send + Sync {
    /// Name recorded in the key vault document (e.g. `"local"`).
    fn provider_name(&self) -> &str;

    /// Wraps (encrypts) a data encryption key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::WrapFailed` if wrapping fails.
    fn wrap_dek(&self, key_id: &KeyId, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError>;

    /// Unwraps (decrypts) a data encryption key.
    ///
    /// # Errors
    ///
    /// Returns `KeyProviderError::UnwrapFailed` if the material was wrapped
    /// under a different master key or has been corrupted.
    fn unwrap_dek(
        &self,
        key_id: &KeyId,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError>;
}

/// Key provider backed by a locally held master key.
///
/// Wrapped format: `[nonce:12][ChaCha20-Poly1305(dek)]`, authenticated with
/// the key id as associated data so wrapped material cannot be swapped
/// between vault entries.
pub struct LocalKeyProvider {
    wrapping_key: SecretVec<u8>,
}

impl LocalKeyProvider {
    /// Creates a provider from a loaded master key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if the wrapping key cannot be derived.
    pub fn new(master_key: &MasterKey) -> Result<Self, Error> {
        let wrapping_key = derive_wrapping_key(master_key.secret().expose_secret())?;
        Ok(Self { wrapping_key })
    }

    /// Loads the master key from `source` and creates a provider from it.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if the master key cannot be loaded.
    pub fn from_source(source: &dyn MasterKeySource) -> Result<Self, Error> {
        let master_key = source.load()?;
        Self::new(&master_key)
    }

    fn cipher(&self) -> Result<ChaCha20Poly1305, KeyProviderError> {
        ChaCha20Poly1305::new_from_slice(self.wrapping_key.expose_secret())
            .map_err(|e| KeyProviderError::InvalidMasterKey(format!("invalid wrapping key: {e}")))
    }
}

impl KeyProvider for LocalKeyProvider {
    fn provider_name(&self) -> &str {
        "local"
    }

    fn wrap_dek(&self, key_id: &KeyId, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(&Nonce::from(nonce_bytes), Payload { msg: dek, aad: key_id.as_bytes() })
            .map_err(|e| KeyProviderError::WrapFailed(format!("ChaCha20-Poly1305: {e}")))?;

        let mut wrapped = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    fn unwrap_dek(
        &self,
        key_id: &KeyId,
        wrapped_dek: &[u8],
    ) -> Result<SecretVec<u8>, KeyProviderError> {
        if wrapped_dek.len() <= NONCE_SIZE {
            return Err(KeyProviderError::UnwrapFailed("wrapped key truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = wrapped_dek.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        let dek = self
            .cipher()?
            .decrypt(nonce, Payload { msg: ciphertext, aad: key_id.as_bytes() })
            .map_err(|_| {
                KeyProviderError::UnwrapFailed(format!(
                    "authentication failed for data key {key_id}: wrong or corrupted master key"
                ))
            })?;
        Ok(SecretVec::new(dek))
    }
}
