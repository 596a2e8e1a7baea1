//! Field value encryption and decryption.
//!
//! The scheme follows the field's query capability:
//!
//! | Capability | Token |
//! |---|---|
//! | `Equality` | AES-256-SIV over the plaintext; identical values give identical tokens |
//! | `Range` | ChaCha20-Poly1305 payload plus the blinded trie edges of the value |
//! | `None` | ChaCha20-Poly1305 payload |
//!
//! Numeric plaintexts are normalized to `i64` before encryption (money is
//! scaled to its fixed-point representation), so range edges and payloads
//! never see fractional values. Strings are encrypted as UTF-8.
//!
//! Range payloads are randomized but their edge tags are not: see
//! [`crate::range`] for what the tags reveal to the store.

use crate::blind_index::{generate_edge_tags, EdgeTag};
use crate::context::{EncryptionContext, IndexContext};
use crate::deterministic::DeterministicCipher;
use crate::error::Error;
use crate::range::RangeDomain;
use crate::schema::{FieldSpec, PlaintextType, QueryCapability, RangeSpec};
use crate::token::{EncryptedToken, TokenAlgorithm, TokenHeader};
use crate::vault::DataKey;
use chacha20poly1305::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use secrecy::{ExposeSecret, SecretVec};
use serde_json::Value;
use zeroize::Zeroizing;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
const NONCE_SIZE: usize = 12;

// Accepted rounding error when scaling a float to fixed point.
const MONEY_EPSILON: f64 = 1e-6;

/// Encrypts one plaintext value for `spec`.
///
/// # Errors
///
/// Returns `Error::InvalidPlaintextDomain` if the value does not fit the
/// field's type or declared range, or a key error if the data key is
/// unusable.
pub fn encrypt_field(spec: &FieldSpec, value: &Value, key: &DataKey) -> Result<EncryptedToken, Error> {
    let context = EncryptionContext::for_field(spec);
    let key_id = *key.id();

    match spec.capability() {
        QueryCapability::Equality => {
            let plaintext = Zeroizing::new(encode_plaintext(spec, value)?);
            let ciphertext =
                DeterministicCipher::new(&key.keys().equality)?.encrypt(&plaintext, &context)?;
            let header = TokenHeader::new(TokenAlgorithm::Deterministic, key_id, Vec::new());
            EncryptedToken::new(header, ciphertext, Vec::new())
        }
        QueryCapability::Range(range) => {
            let (domain, normalized) = range_value(spec, &range, value)?;
            let (nonce, ciphertext) =
                seal(&key.keys().payload, &normalized.to_be_bytes(), &context)?;
            let mut edges = generate_edge_tags(
                &key.keys().range,
                &IndexContext::from(&context),
                &domain.edges(normalized),
            )?;
            // Trie order would reveal which tag belongs to which depth.
            edges.sort_unstable();

            let header = TokenHeader::new(TokenAlgorithm::Range, key_id, nonce);
            EncryptedToken::new(header, ciphertext, edges)
        }
        QueryCapability::None => {
            let plaintext = Zeroizing::new(encode_plaintext(spec, value)?);
            let (nonce, ciphertext) = seal(&key.keys().payload, &plaintext, &context)?;
            let header = TokenHeader::new(TokenAlgorithm::Randomized, key_id, nonce);
            EncryptedToken::new(header, ciphertext, Vec::new())
        }
    }
}

/// Checks that `value` is a valid plaintext for `spec` without touching
/// any key: [`encrypt_field`] succeeds on it given a usable data key.
///
/// # Errors
///
/// Returns `Error::InvalidPlaintextDomain` if the value does not fit the
/// field's type or declared range, or `Error::InvalidSchema` for a range
/// declaration that cannot be indexed.
pub fn validate_plaintext(spec: &FieldSpec, value: &Value) -> Result<(), Error> {
    match spec.capability() {
        QueryCapability::Range(range) => range_value(spec, &range, value).map(|_| ()),
        QueryCapability::Equality | QueryCapability::None => {
            encode_plaintext(spec, value).map(Zeroizing::new).map(|_| ())
        }
    }
}

fn range_value(spec: &FieldSpec, range: &RangeSpec, value: &Value) -> Result<(RangeDomain, i64), Error> {
    let domain = RangeDomain::new(spec.path(), spec.plaintext_type(), range)?;
    let normalized = normalize(spec, value)?;
    if !domain.contains(normalized) {
        return Err(Error::domain(
            spec.path(),
            format!("value outside declared range [{}, {}]", range.min(), range.max()),
        ));
    }
    Ok((domain, normalized))
}

/// Decrypts a token produced by [`encrypt_field`] for the same field.
///
/// # Errors
///
/// Returns `Error::MalformedToken` if the token was produced under another
/// data key, for another field or scheme, or fails authentication.
pub fn decrypt_field(spec: &FieldSpec, token: &EncryptedToken, key: &DataKey) -> Result<Value, Error> {
    if token.key_id() != key.id() {
        return Err(Error::MalformedToken(format!(
            "token for '{}' was encrypted under data key {}, not {}",
            spec.path(),
            token.key_id(),
            key.id()
        )));
    }

    let expected = match spec.capability() {
        QueryCapability::Equality => TokenAlgorithm::Deterministic,
        QueryCapability::Range(_) => TokenAlgorithm::Range,
        QueryCapability::None => TokenAlgorithm::Randomized,
    };
    if token.algorithm() != expected {
        return Err(Error::MalformedToken(format!(
            "'{}' expects a {expected:?} token, found {:?}",
            spec.path(),
            token.algorithm()
        )));
    }

    let context = EncryptionContext::for_field(spec);
    let plaintext = Zeroizing::new(match expected {
        TokenAlgorithm::Deterministic => {
            DeterministicCipher::new(&key.keys().equality)?.decrypt(token.ciphertext(), &context)?
        }
        TokenAlgorithm::Range | TokenAlgorithm::Randomized => open(
            &key.keys().payload,
            token.header().nonce(),
            token.ciphertext(),
            &context,
        )?,
    });
    decode_plaintext(spec, &plaintext)
}

/// Parses and decrypts a stored document value.
///
/// # Errors
///
/// See [`EncryptedToken::from_value`] and [`decrypt_field`].
pub fn decrypt_value(spec: &FieldSpec, value: &Value, key: &DataKey) -> Result<Value, Error> {
    decrypt_field(spec, &EncryptedToken::from_value(value)?, key)
}

/// Converts a numeric plaintext into its normalized `i64` form.
///
/// # Errors
///
/// Returns `Error::InvalidPlaintextDomain` for non-numeric values,
/// fractions on integer types, more decimals than a money field keeps,
/// or values that overflow the type.
pub fn normalize(spec: &FieldSpec, value: &Value) -> Result<i64, Error> {
    let path = spec.path();
    let plaintext_type = spec.plaintext_type();
    let Value::Number(number) = value else {
        return Err(Error::domain(path, format!("expected a {plaintext_type} number")));
    };

    match plaintext_type {
        PlaintextType::String => Err(Error::domain(path, "string fields have no numeric form")),
        PlaintextType::Int => {
            let n = number.as_i64().ok_or_else(|| Error::domain(path, "expected an integer"))?;
            i32::try_from(n)
                .map(i64::from)
                .map_err(|_| Error::domain(path, "integer does not fit in 32 bits"))
        }
        PlaintextType::Long => {
            number.as_i64().ok_or_else(|| Error::domain(path, "expected a 64-bit integer"))
        }
        PlaintextType::Money { scale } => {
            let factor = plaintext_type.scale_factor();
            if let Some(n) = number.as_i64() {
                return n
                    .checked_mul(factor)
                    .ok_or_else(|| Error::domain(path, "amount overflows fixed-point range"));
            }
            let amount = number.as_f64().ok_or_else(|| Error::domain(path, "expected an amount"))?;
            #[allow(clippy::cast_precision_loss)]
            let scaled = amount * factor as f64;
            let rounded = scaled.round();
            if (scaled - rounded).abs() > MONEY_EPSILON {
                return Err(Error::domain(path, format!("more than {scale} decimal places")));
            }
            #[allow(clippy::cast_precision_loss)]
            let in_range = rounded.is_finite() && rounded >= i64::MIN as f64 && rounded < i64::MAX as f64;
            if !in_range {
                return Err(Error::domain(path, "amount overflows fixed-point range"));
            }
            #[allow(clippy::cast_possible_truncation)]
            Ok(rounded as i64)
        }
    }
}

/// Inverse of [`normalize`]. Money with no fractional part comes back as
/// an integer.
#[must_use]
pub fn denormalize(plaintext_type: PlaintextType, normalized: i64) -> Value {
    match plaintext_type {
        PlaintextType::Money { .. } => {
            let factor = plaintext_type.scale_factor();
            if normalized % factor == 0 {
                Value::from(normalized / factor)
            } else {
                #[allow(clippy::cast_precision_loss)]
                let amount = normalized as f64 / factor as f64;
                Value::from(amount)
            }
        }
        _ => Value::from(normalized),
    }
}

/// A validated range query over one range field.
///
/// Built without touching any key, so malformed queries fail before a
/// key lookup or storage call happens.
#[derive(Debug, Clone)]
pub struct RangeQuery {
    domain: RangeDomain,
    context: IndexContext,
    lo: i64,
    hi: i64,
}

impl RangeQuery {
    /// Validates inclusive bounds; a missing bound extends to the declared
    /// domain edge.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPredicate` if the field is not range-queryable,
    /// both bounds are missing, or `lo > hi`; `Error::InvalidPlaintextDomain`
    /// if a bound is not a valid value or lies outside the declared range.
    pub fn new(spec: &FieldSpec, lo: Option<&Value>, hi: Option<&Value>) -> Result<Self, Error> {
        let QueryCapability::Range(range) = spec.capability() else {
            return Err(Error::InvalidPredicate(format!(
                "'{}' does not support range queries",
                spec.path()
            )));
        };
        if lo.is_none() && hi.is_none() {
            return Err(Error::InvalidPredicate(format!(
                "range query on '{}' needs at least one bound",
                spec.path()
            )));
        }

        let domain = RangeDomain::new(spec.path(), spec.plaintext_type(), &range)?;
        let lo = lo.map(|v| normalize(spec, v)).transpose()?;
        let hi = hi.map(|v| normalize(spec, v)).transpose()?;
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo > hi {
                return Err(Error::InvalidPredicate(format!(
                    "range query on '{}' has lower bound above upper bound",
                    spec.path()
                )));
            }
        }
        for bound in [lo, hi].into_iter().flatten() {
            if !domain.contains(bound) {
                return Err(Error::domain(
                    spec.path(),
                    format!("query bound outside declared range [{}, {}]", range.min(), range.max()),
                ));
            }
        }

        Ok(Self {
            domain,
            context: IndexContext::new(spec.path(), spec.plaintext_type()),
            lo: lo.unwrap_or(domain.min()),
            hi: hi.unwrap_or(domain.max()),
        })
    }

    /// Normalized inclusive bounds.
    #[must_use]
    pub const fn bounds(&self) -> (i64, i64) {
        (self.lo, self.hi)
    }

    /// Blind tags of the trie nodes covering the interval. A stored value
    /// lies in the interval exactly when one of its edges is in this set.
    ///
    /// # Errors
    ///
    /// Returns error if tag generation fails.
    pub fn edge_tags(&self, key: &DataKey) -> Result<Vec<EdgeTag>, Error> {
        let cover = self.domain.cover(self.lo, self.hi);
        generate_edge_tags(&key.keys().range, &self.context, &cover)
    }
}

fn encode_plaintext(spec: &FieldSpec, value: &Value) -> Result<Vec<u8>, Error> {
    match spec.plaintext_type() {
        PlaintextType::String => value
            .as_str()
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| Error::domain(spec.path(), "expected a string")),
        _ => Ok(normalize(spec, value)?.to_be_bytes().to_vec()),
    }
}

fn decode_plaintext(spec: &FieldSpec, plaintext: &[u8]) -> Result<Value, Error> {
    let malformed = |what: &str| Error::MalformedToken(format!("'{}' decrypted to {what}", spec.path()));
    match spec.plaintext_type() {
        PlaintextType::String => std::str::from_utf8(plaintext)
            .map(|s| Value::String(s.to_string()))
            .map_err(|_| malformed("invalid UTF-8")),
        plaintext_type => {
            let bytes: [u8; 8] = plaintext.try_into().map_err(|_| malformed("a non-numeric payload"))?;
            Ok(denormalize(plaintext_type, i64::from_be_bytes(bytes)))
        }
    }
}

fn seal(
    key: &SecretVec<u8>,
    plaintext: &[u8],
    context: &EncryptionContext,
) -> Result<(Vec<u8>, Vec<u8>), Error> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.expose_secret())
        .map_err(|e| Error::KeyUnavailable(format!("invalid payload key: {e}")))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let aad = context.to_string();
    let ciphertext = cipher
        .encrypt(&Nonce::from(nonce_bytes), Payload { msg: plaintext, aad: aad.as_bytes() })
        .map_err(|e| Error::MalformedToken(format!("ChaCha20-Poly1305 encryption failed: {e}")))?;
    Ok((nonce_bytes.to_vec(), ciphertext))
}

fn open(
    key: &SecretVec<u8>,
    nonce: &[u8],
    ciphertext: &[u8],
    context: &EncryptionContext,
) -> Result<Vec<u8>, Error> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.expose_secret())
        .map_err(|e| Error::KeyUnavailable(format!("invalid payload key: {e}")))?;
    let nonce_bytes: [u8; NONCE_SIZE] = nonce
        .try_into()
        .map_err(|_| Error::MalformedToken(format!("nonce must be {NONCE_SIZE} bytes")))?;

    let aad = context.to_string();
    cipher
        .decrypt(&Nonce::from(nonce_bytes), Payload { msg: ciphertext, aad: aad.as_bytes() })
        .map_err(|_| {
            Error::MalformedToken(format!("token for '{}' failed authentication", context.path()))
        })
}
