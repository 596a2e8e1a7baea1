//! Deterministic encryption using AES-SIV for equality queries.
//!
//! AES-SIV (Synthetic IV) is a misuse-resistant authenticated encryption mode
//! that produces identical output for identical plaintext, key and context.
//! That is what lets the storage engine compare an equality token in a
//! filter against stored tokens without decrypting anything.
//!
//! # Security Properties
//!
//! - **Deterministic**: Same plaintext + key + context → same ciphertext
//! - **Authenticated**: A wrong key or context fails to decrypt
//! - **Context-bound**: The field path and type are associated data
//!
//! Equality tokens reveal which documents share a value. Fields that are
//! never queried use randomized encryption instead.

use aes_siv::{
    aead::{Aead, KeyInit, Payload},
    Aes256SivAead,
};
use secrecy::{ExposeSecret, SecretVec};
use zeroize::Zeroizing;

use crate::{context::EncryptionContext, error::Error, kdf::SIV_KEY_SIZE};

/// AES-256-SIV bound to one data key's equality sub-key.
pub struct DeterministicCipher<'a> {
    key: &'a SecretVec<u8>,
}

impl<'a> DeterministicCipher<'a> {
    /// Wraps a 64-byte AES-256-SIV key.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if the key is not 64 bytes.
    pub fn new(key: &'a SecretVec<u8>) -> Result<Self, Error> {
        let len = key.expose_secret().len();
        if len != SIV_KEY_SIZE {
            return Err(Error::KeyUnavailable(format!(
                "equality key is {len} bytes, expected {SIV_KEY_SIZE}"
            )));
        }
        Ok(Self { key })
    }

    fn cipher(&self) -> Result<Aes256SivAead, Error> {
        Aes256SivAead::new_from_slice(self.key.expose_secret())
            .map_err(|e| Error::KeyUnavailable(format!("AES-SIV key rejected: {e}")))
    }

    /// Encrypts `plaintext` with `context` as associated data.
    ///
    /// # Errors
    ///
    /// Returns an error if the cipher fails.
    pub fn encrypt(&self, plaintext: &[u8], context: &EncryptionContext) -> Result<Vec<u8>, Error> {
        let aad = Zeroizing::new(context.to_string().into_bytes());
        self.cipher()?
            .encrypt(&Default::default(), Payload { msg: plaintext, aad: &aad })
            .map_err(|e| Error::MalformedToken(format!("AES-SIV encryption failed: {e}")))
    }

    /// Decrypts a ciphertext produced under the same key and context.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` if authentication fails, meaning the
    /// ciphertext is corrupt, the context differs, or the key is wrong.
    pub fn decrypt(&self, ciphertext: &[u8], context: &EncryptionContext) -> Result<Vec<u8>, Error> {
        let aad = Zeroizing::new(context.to_string().into_bytes());
        self.cipher()?
            .decrypt(&Default::default(), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| {
                Error::MalformedToken(format!(
                    "equality token for '{}' failed authentication",
                    context.path()
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PlaintextType;

    fn key() -> SecretVec<u8> {
        SecretVec::new(vec![0x42; SIV_KEY_SIZE])
    }

    fn ctx(path: &str) -> EncryptionContext {
        EncryptionContext::new(path, PlaintextType::String)
    }

    #[test]
    fn test_deterministic_encryption() {
        let key = key();
        let cipher = DeterministicCipher::new(&key).unwrap();

        let ct1 = cipher.encrypt(b"Alice Johnson", &ctx("name")).unwrap();
        let ct2 = cipher.encrypt(b"Alice Johnson", &ctx("name")).unwrap();
        assert_eq!(ct1, ct2, "Encryption must be deterministic");

        let decrypted = cipher.decrypt(&ct1, &ctx("name")).unwrap();
        assert_eq!(decrypted, b"Alice Johnson");
    }

    #[test]
    fn test_different_contexts_different_ciphertexts() {
        let key = key();
        let cipher = DeterministicCipher::new(&key).unwrap();

        let ct1 = cipher.encrypt(b"123-45-6789", &ctx("ssn")).unwrap();
        let ct2 = cipher.encrypt(b"123-45-6789", &ctx("name")).unwrap();
        assert_ne!(ct1, ct2);

        assert!(matches!(cipher.decrypt(&ct1, &ctx("name")), Err(Error::MalformedToken(_))));
    }

    #[test]
    fn test_type_is_part_of_context() {
        let key = key();
        let cipher = DeterministicCipher::new(&key).unwrap();
        let as_long = EncryptionContext::new("id", PlaintextType::Long);
        let as_int = EncryptionContext::new("id", PlaintextType::Int);

        let ct = cipher.encrypt(&7i64.to_be_bytes(), &as_long).unwrap();
        assert!(cipher.decrypt(&ct, &as_int).is_err());
    }

    #[test]
    fn test_corrupted_ciphertext_fails() {
        let key = key();
        let cipher = DeterministicCipher::new(&key).unwrap();
        let mut ciphertext = cipher.encrypt(b"alice", &ctx("name")).unwrap();

        if let Some(byte) = ciphertext.last_mut() {
            *byte ^= 0xFF;
        }
        assert!(matches!(cipher.decrypt(&ciphertext, &ctx("name")), Err(Error::MalformedToken(_))));
    }

    #[test]
    fn test_empty_plaintext() {
        let key = key();
        let cipher = DeterministicCipher::new(&key).unwrap();

        let ciphertext = cipher.encrypt(b"", &ctx("name")).unwrap();
        assert!(cipher.decrypt(&ciphertext, &ctx("name")).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key_length() {
        let short_key = SecretVec::new(vec![0x42; 32]);
        let result = DeterministicCipher::new(&short_key);
        assert!(matches!(result, Err(Error::KeyUnavailable(_))));
    }
}
