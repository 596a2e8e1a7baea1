//! Encrypted token format.
//!
//! A token replaces a plaintext field value inside a stored document:
//!
//! ```text
//! {"$encrypted": base64(header || ciphertext)}                    equality, unindexed
//! {"$encrypted": base64(header || ciphertext), "$edges": [...]}   range
//! ```
//!
//! The binary part is
//! `[version:1][algorithm:1][key_id:16][nonce_len:1][nonce:N][ciphertext]`.

use crate::blind_index::EdgeTag;
use crate::error::Error;
use crate::vault::KeyId;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde_json::{Map, Value};

/// Protocol version for the token format.
pub const PROTOCOL_VERSION: u8 = 1;

/// Document key holding the base64 token.
pub const ENCRYPTED_KEY: &str = "$encrypted";

/// Document key holding a range token's edge tags.
pub const EDGES_KEY: &str = "$edges";

const KEY_ID_LEN: usize = 16;

/// Encryption scheme of a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenAlgorithm {
    /// AES-256-SIV, deterministic
    Deterministic,
    /// ChaCha20-Poly1305 payload plus blinded range edges
    Range,
    /// ChaCha20-Poly1305 payload only
    Randomized,
}

impl TokenAlgorithm {
    /// Wire identifier.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Range => 2,
            Self::Randomized => 3,
        }
    }

    /// Parses a wire identifier.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` for an unknown identifier.
    pub fn from_u8(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(Self::Deterministic),
            2 => Ok(Self::Range),
            3 => Ok(Self::Randomized),
            other => Err(Error::MalformedToken(format!("unknown algorithm {other}"))),
        }
    }
}

/// Metadata preceding a token's ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    version: u8,
    algorithm: TokenAlgorithm,
    key_id: KeyId,
    nonce: Vec<u8>,
}

impl TokenHeader {
    /// Creates a header for the current protocol version.
    #[must_use]
    pub const fn new(algorithm: TokenAlgorithm, key_id: KeyId, nonce: Vec<u8>) -> Self {
        Self { version: PROTOCOL_VERSION, algorithm, key_id, nonce }
    }

    /// Returns the protocol version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the scheme.
    #[must_use]
    pub const fn algorithm(&self) -> TokenAlgorithm {
        self.algorithm
    }

    /// Returns the id of the data key that produced the token.
    #[must_use]
    pub const fn key_id(&self) -> &KeyId {
        &self.key_id
    }

    /// Returns the nonce (empty for deterministic tokens).
    #[must_use]
    pub fn nonce(&self) -> &[u8] {
        &self.nonce
    }

    /// Serializes the header.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` if the nonce exceeds 255 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let nonce_len = u8::try_from(self.nonce.len()).map_err(|_| {
            Error::MalformedToken(format!("nonce too long: {} bytes", self.nonce.len()))
        })?;

        let mut bytes = Vec::with_capacity(3 + KEY_ID_LEN + self.nonce.len());
        bytes.push(self.version);
        bytes.push(self.algorithm.as_u8());
        bytes.extend_from_slice(self.key_id.as_bytes());
        bytes.push(nonce_len);
        bytes.extend_from_slice(&self.nonce);
        Ok(bytes)
    }

    /// Parses a header, returning it with the offset of the ciphertext.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` if the data is truncated, the version
    /// is unsupported, or the algorithm is unknown.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize), Error> {
        let truncated = |what: &str| Error::MalformedToken(format!("{what} truncated"));

        let (&version, rest) = data.split_first().ok_or_else(|| truncated("version"))?;
        if version != PROTOCOL_VERSION {
            return Err(Error::MalformedToken(format!(
                "unsupported version {version}, expected {PROTOCOL_VERSION}"
            )));
        }

        let (&algorithm, rest) = rest.split_first().ok_or_else(|| truncated("algorithm"))?;
        let algorithm = TokenAlgorithm::from_u8(algorithm)?;

        if rest.len() < KEY_ID_LEN {
            return Err(truncated("key id"));
        }
        let (key_id, rest) = rest.split_at(KEY_ID_LEN);
        let mut id = [0u8; KEY_ID_LEN];
        id.copy_from_slice(key_id);

        let (&nonce_len, rest) = rest.split_first().ok_or_else(|| truncated("nonce length"))?;
        let nonce_len = usize::from(nonce_len);
        if rest.len() < nonce_len {
            return Err(truncated("nonce"));
        }
        let nonce = rest[..nonce_len].to_vec();

        let consumed = 3 + KEY_ID_LEN + nonce_len;
        Ok((Self { version, algorithm, key_id: KeyId::from_bytes(id), nonce }, consumed))
    }
}

/// An encrypted field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedToken {
    header: TokenHeader,
    ciphertext: Vec<u8>,
    edges: Vec<EdgeTag>,
}

impl EncryptedToken {
    /// Creates a token. Range tokens carry edges; other schemes must not.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` if the edges do not fit the scheme.
    pub fn new(header: TokenHeader, ciphertext: Vec<u8>, edges: Vec<EdgeTag>) -> Result<Self, Error> {
        match (header.algorithm, edges.is_empty()) {
            (TokenAlgorithm::Range, true) => {
                Err(Error::MalformedToken("range token without edges".to_string()))
            }
            (TokenAlgorithm::Deterministic | TokenAlgorithm::Randomized, false) => {
                Err(Error::MalformedToken("edges on a non-range token".to_string()))
            }
            _ => Ok(Self { header, ciphertext, edges }),
        }
    }

    /// Returns the header.
    #[must_use]
    pub const fn header(&self) -> &TokenHeader {
        &self.header
    }

    /// Returns the id of the producing data key.
    #[must_use]
    pub const fn key_id(&self) -> &KeyId {
        self.header.key_id()
    }

    /// Returns the scheme.
    #[must_use]
    pub const fn algorithm(&self) -> TokenAlgorithm {
        self.header.algorithm
    }

    /// Returns the ciphertext following the header.
    #[must_use]
    pub fn ciphertext(&self) -> &[u8] {
        &self.ciphertext
    }

    /// Returns the range edge tags (empty unless a range token).
    #[must_use]
    pub fn edges(&self) -> &[EdgeTag] {
        &self.edges
    }

    /// Serializes header and ciphertext.
    ///
    /// # Errors
    ///
    /// Returns error if header serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = self.header.to_bytes()?;
        bytes.extend_from_slice(&self.ciphertext);
        Ok(bytes)
    }

    /// Renders the token as the document value stored in place of the
    /// plaintext.
    ///
    /// # Errors
    ///
    /// Returns error if header serialization fails.
    pub fn to_value(&self) -> Result<Value, Error> {
        let mut object = Map::new();
        object.insert(ENCRYPTED_KEY.to_string(), Value::String(BASE64.encode(self.to_bytes()?)));
        if !self.edges.is_empty() {
            let edges = self.edges.iter().map(|tag| Value::String(tag.encode())).collect();
            object.insert(EDGES_KEY.to_string(), Value::Array(edges));
        }
        Ok(Value::Object(object))
    }

    /// Parses a stored document value.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` if the value is not a token, carries
    /// unexpected keys, or fails to decode.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::MalformedToken("expected an encrypted object".to_string()))?;
        if let Some(key) = object.keys().find(|k| *k != ENCRYPTED_KEY && *k != EDGES_KEY) {
            return Err(Error::MalformedToken(format!("unexpected key '{key}'")));
        }

        let encoded = object
            .get(ENCRYPTED_KEY)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedToken(format!("missing '{ENCRYPTED_KEY}'")))?;
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::MalformedToken(format!("token is not base64: {e}")))?;
        let (header, offset) = TokenHeader::from_bytes(&bytes)?;

        let edges = match object.get(EDGES_KEY) {
            None => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| Error::MalformedToken("edge tag must be a string".to_string()))
                        .and_then(EdgeTag::decode)
                })
                .collect::<Result<_, _>>()?,
            Some(_) => return Err(Error::MalformedToken(format!("'{EDGES_KEY}' must be an array"))),
        };

        Self::new(header, bytes[offset..].to_vec(), edges)
    }
}

/// Returns `true` if `value` has the shape of a stored token.
#[must_use]
pub fn is_token(value: &Value) -> bool {
    value.get(ENCRYPTED_KEY).is_some_and(Value::is_string)
}
