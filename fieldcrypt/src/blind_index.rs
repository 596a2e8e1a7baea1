//! Blind tags for range edges.
//!
//! Each trie edge is replaced by a keyed HMAC so the storage engine can test
//! set membership without learning the edge's depth or prefix.

use crate::context::IndexContext;
use crate::error::Error;
use crate::range::Edge;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretVec};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Blind tag output size (16 bytes).
pub const BLIND_INDEX_SIZE: usize = 16;

/// A blinded range edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeTag([u8; BLIND_INDEX_SIZE]);

impl EdgeTag {
    /// Raw tag bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; BLIND_INDEX_SIZE] {
        &self.0
    }

    /// Base64 form used inside documents and filters.
    #[must_use]
    pub fn encode(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Parses the base64 form.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` for invalid base64 or a wrong length.
    pub fn decode(encoded: &str) -> Result<Self, Error> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| Error::MalformedToken(format!("edge tag is not base64: {e}")))?;
        let tag: [u8; BLIND_INDEX_SIZE] = bytes.try_into().map_err(|_| {
            Error::MalformedToken(format!("edge tag must be {BLIND_INDEX_SIZE} bytes"))
        })?;
        Ok(Self(tag))
    }
}

/// Computes the blind tag of one edge:
/// `HMAC-SHA256(key, context || depth || prefix)[..16]`.
///
/// # Errors
///
/// Returns `Error::KeyUnavailable` if the key is rejected by HMAC.
pub fn generate_edge_tag(
    key: &SecretVec<u8>,
    context: &IndexContext,
    edge: Edge,
) -> Result<EdgeTag, Error> {
    let mut mac = HmacSha256::new_from_slice(key.expose_secret())
        .map_err(|e| Error::KeyUnavailable(format!("invalid edge key: {e}")))?;

    mac.update(context.to_string().as_bytes());
    mac.update(&edge.depth.to_be_bytes());
    mac.update(&edge.prefix.to_be_bytes());

    let bytes = mac.finalize().into_bytes();
    let mut tag = [0u8; BLIND_INDEX_SIZE];
    tag.copy_from_slice(&bytes[..BLIND_INDEX_SIZE]);
    Ok(EdgeTag(tag))
}

/// Tags every edge in `edges`.
///
/// # Errors
///
/// Returns error if tag generation fails.
pub fn generate_edge_tags(
    key: &SecretVec<u8>,
    context: &IndexContext,
    edges: &[Edge],
) -> Result<Vec<EdgeTag>, Error> {
    edges.iter().map(|edge| generate_edge_tag(key, context, *edge)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::PlaintextType;

    fn key() -> SecretVec<u8> {
        SecretVec::new(vec![42u8; 32])
    }

    fn ctx(path: &str) -> IndexContext {
        IndexContext::new(path, PlaintextType::Long)
    }

    #[test]
    fn test_edge_tag_deterministic() {
        let edge = Edge { depth: 3, prefix: 5 };
        let a = generate_edge_tag(&key(), &ctx("salary"), edge).unwrap();
        let b = generate_edge_tag(&key(), &ctx("salary"), edge).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_depth_and_prefix_separated() {
        let a = generate_edge_tag(&key(), &ctx("salary"), Edge { depth: 1, prefix: 0 }).unwrap();
        let b = generate_edge_tag(&key(), &ctx("salary"), Edge { depth: 0, prefix: 1 }).unwrap();
        let c = generate_edge_tag(&key(), &ctx("salary"), Edge { depth: 1, prefix: 1 }).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_different_fields_different_tags() {
        let edge = Edge { depth: 2, prefix: 1 };
        let a = generate_edge_tag(&key(), &ctx("salary"), edge).unwrap();
        let b = generate_edge_tag(&key(), &ctx("bonus"), edge).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_keys_different_tags() {
        let edge = Edge { depth: 2, prefix: 1 };
        let a = generate_edge_tag(&key(), &ctx("salary"), edge).unwrap();
        let b = generate_edge_tag(&SecretVec::new(vec![7u8; 32]), &ctx("salary"), edge).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_encode_decode() {
        let tag = generate_edge_tag(&key(), &ctx("salary"), Edge { depth: 0, prefix: 0 }).unwrap();
        assert_eq!(EdgeTag::decode(&tag.encode()).unwrap(), tag);
        assert!(matches!(EdgeTag::decode("AAAA"), Err(Error::MalformedToken(_))));
        assert!(matches!(EdgeTag::decode("***"), Err(Error::MalformedToken(_))));
    }
}
