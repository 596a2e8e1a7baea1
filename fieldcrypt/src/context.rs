//! Context types binding ciphertexts and range edges to their field.

use crate::schema::{FieldSpec, PlaintextType};
use std::fmt;

/// Context for field encryption, used as associated data and for
/// domain separation.
///
/// A token produced for one field cannot be decrypted as another field,
/// nor as the same path declared with a different plaintext type.
///
/// # Example
///
/// ```
/// use fieldcrypt::context::EncryptionContext;
/// use fieldcrypt::schema::PlaintextType;
///
/// let ctx = EncryptionContext::new("salary", PlaintextType::Long);
/// assert_eq!(ctx.to_string(), "salary|long|v1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    path: String,
    plaintext_type: PlaintextType,
    version: u32,
}

impl EncryptionContext {
    /// Creates a new encryption context for a field path.
    #[must_use]
    pub fn new(path: impl Into<String>, plaintext_type: PlaintextType) -> Self {
        Self { path: path.into(), plaintext_type, version: 1 }
    }

    /// Builds the context for a schema field.
    #[must_use]
    pub fn for_field(spec: &FieldSpec) -> Self {
        Self::new(spec.path(), spec.plaintext_type())
    }

    /// Sets the format version.
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Returns the field path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the plaintext type.
    #[must_use]
    pub const fn plaintext_type(&self) -> PlaintextType {
        self.plaintext_type
    }

    /// Returns the version.
    #[must_use]
    pub const fn version(&self) -> u32 {
        self.version
    }
}

impl fmt::Display for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|v{}", self.path, self.plaintext_type, self.version)
    }
}

/// Context for range edge tags.
///
/// Unversioned: edges must stay comparable between documents written
/// and queries issued at different times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexContext {
    path: String,
    plaintext_type: PlaintextType,
}

impl IndexContext {
    /// Creates a new index context.
    #[must_use]
    pub fn new(path: impl Into<String>, plaintext_type: PlaintextType) -> Self {
        Self { path: path.into(), plaintext_type }
    }

    /// Returns the field path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for IndexContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|edges", self.path, self.plaintext_type)
    }
}

impl From<&EncryptionContext> for IndexContext {
    fn from(ctx: &EncryptionContext) -> Self {
        Self { path: ctx.path.clone(), plaintext_type: ctx.plaintext_type }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encryption_context_display() {
        let ctx = EncryptionContext::new("ssn", PlaintextType::String).with_version(2);
        assert_eq!(ctx.to_string(), "ssn|string|v2");
    }

    #[test]
    fn test_money_context_includes_scale() {
        let ctx = EncryptionContext::new("salary", PlaintextType::Money { scale: 2 });
        assert_eq!(ctx.to_string(), "salary|money(2)|v1");
    }

    #[test]
    fn test_index_context_from_encryption_context() {
        let enc = EncryptionContext::new("address.zip", PlaintextType::Int).with_version(3);
        let idx = IndexContext::from(&enc);
        assert_eq!(idx.path(), "address.zip");
        assert_eq!(idx.to_string(), "address.zip|int|edges");
    }
}
