//! Key derivation using HKDF (HMAC-based Key Derivation Function).
//!
//! A data key is a single random secret. The per-purpose keys used by the
//! codec (AES-SIV for equality, HMAC for range edges, AEAD for range
//! payloads) are expanded from it with HKDF-SHA256 so one stored key serves
//! every scheme without reusing key material across primitives.

use crate::error::Error;
use hkdf::Hkdf;
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

/// Data encryption key size in bytes (256 bits).
pub const DEK_SIZE: usize = 32;

/// AES-256-SIV key size in bytes.
pub const SIV_KEY_SIZE: usize = 64;

/// Size of the edge-tag HMAC key and the payload AEAD key.
pub const SUBKEY_SIZE: usize = 32;

const EQUALITY_INFO: &[u8] = b"fieldcrypt|equality|v1";
const RANGE_INFO: &[u8] = b"fieldcrypt|range-edges|v1";
const PAYLOAD_INFO: &[u8] = b"fieldcrypt|range-payload|v1";
const WRAPPING_INFO: &[u8] = b"fieldcrypt|local-kek|v1";

/// Sub-keys expanded from one data encryption key.
pub struct FieldKeys {
    /// 64-byte AES-256-SIV key for deterministic encryption
    pub equality: SecretVec<u8>,
    /// 32-byte HMAC-SHA256 key for range edge tags
    pub range: SecretVec<u8>,
    /// 32-byte ChaCha20-Poly1305 key for randomized range payloads
    pub payload: SecretVec<u8>,
}

fn expand(ikm: &[u8], info: &[u8], len: usize) -> Result<SecretVec<u8>, Error> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = vec![0u8; len];
    hkdf.expand(info, &mut okm)
        .map_err(|_| Error::KeyUnavailable("key derivation failed".to_string()))?;
    Ok(SecretVec::new(okm))
}

/// Expands a data encryption key into its per-scheme sub-keys.
///
/// # Errors
///
/// Returns `Error::KeyUnavailable` if the key material has the wrong size.
pub fn derive_field_keys(dek: &SecretVec<u8>) -> Result<FieldKeys, Error> {
    let material = dek.expose_secret();
    if material.len() != DEK_SIZE {
        return Err(Error::KeyUnavailable(format!(
            "data key material is {} bytes, expected {DEK_SIZE}",
            material.len()
        )));
    }
    Ok(FieldKeys {
        equality: expand(material, EQUALITY_INFO, SIV_KEY_SIZE)?,
        range: expand(material, RANGE_INFO, SUBKEY_SIZE)?,
        payload: expand(material, PAYLOAD_INFO, SUBKEY_SIZE)?,
    })
}

/// Derives the 32-byte key used to wrap data keys from the master key.
///
/// # Errors
///
/// Returns `Error::KeyUnavailable` if the derivation fails.
pub fn derive_wrapping_key(master_key: &[u8]) -> Result<SecretVec<u8>, Error> {
    expand(master_key, WRAPPING_INFO, SUBKEY_SIZE)
}

/// Generates random key material for a new data encryption key.
///
/// The result must be wrapped under the master key before it is persisted.
///
/// # Example
///
/// ```
/// use fieldcrypt::kdf::generate_dek;
/// use secrecy::ExposeSecret;
///
/// let dek = generate_dek();
/// assert_eq!(dek.expose_secret().len(), 32);
/// ```
#[must_use]
pub fn generate_dek() -> SecretVec<u8> {
    use chacha20poly1305::aead::{rand_core::RngCore, OsRng};

    let mut dek = vec![0u8; DEK_SIZE];
    OsRng.fill_bytes(&mut dek);
    SecretVec::new(dek)
}
