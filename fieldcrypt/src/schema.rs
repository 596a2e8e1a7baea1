//! Declarative description of encrypted fields.
//!
//! A [`FieldEncryptionSchema`] is immutable once built. Changing a field's
//! type or query capability means defining a new schema and provisioning a
//! new collection; there is no in-place migration.

use crate::error::Error;
use crate::range::RangeDomain;
use crate::vault::KeyId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Largest supported fixed-point scale for [`PlaintextType::Money`].
pub const MAX_MONEY_SCALE: u8 = 6;

/// Largest supported range sparsity.
pub const MAX_SPARSITY: u8 = 4;

/// Plaintext type of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum PlaintextType {
    /// UTF-8 string
    String,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// Decimal amount stored as a fixed-point integer with `scale` decimal
    /// places (scale 2: dollars are stored as cents).
    Money {
        /// Number of decimal places kept
        scale: u8,
    },
}

impl PlaintextType {
    /// Returns `true` for types with an integer representation.
    #[must_use]
    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::String)
    }

    /// Storage-level type name.
    #[must_use]
    pub const fn storage_type(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Long | Self::Money { .. } => "long",
        }
    }

    /// Multiplier from plaintext units to the fixed-point representation.
    #[must_use]
    pub fn scale_factor(self) -> i64 {
        match self {
            Self::Money { scale } => 10_i64.pow(u32::from(scale)),
            _ => 1,
        }
    }

    /// Smallest and largest normalized values the type can hold.
    #[must_use]
    pub const fn normalized_bounds(self) -> (i64, i64) {
        match self {
            Self::Int => (i32::MIN as i64, i32::MAX as i64),
            _ => (i64::MIN, i64::MAX),
        }
    }
}

impl fmt::Display for PlaintextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Int => f.write_str("int"),
            Self::Long => f.write_str("long"),
            Self::Money { scale } => write!(f, "money({scale})"),
        }
    }
}

/// Declared bounds and sparsity of a range-queryable field.
///
/// `min` and `max` are in plaintext units (whole dollars for a money field),
/// inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeSpec {
    min: i64,
    max: i64,
    sparsity: u8,
}

impl RangeSpec {
    /// Creates a range declaration.
    #[must_use]
    pub const fn new(min: i64, max: i64, sparsity: u8) -> Self {
        Self { min, max, sparsity }
    }

    /// Inclusive lower bound.
    #[must_use]
    pub const fn min(&self) -> i64 {
        self.min
    }

    /// Inclusive upper bound.
    #[must_use]
    pub const fn max(&self) -> i64 {
        self.max
    }

    /// Edge sparsity: only every `sparsity`-th trie level is indexed.
    #[must_use]
    pub const fn sparsity(&self) -> u8 {
        self.sparsity
    }
}

/// What queries an encrypted field supports.
///
/// The variant decides the encryption scheme: `Equality` is deterministic,
/// `Range` and `None` are randomized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCapability {
    /// Encrypted, not queryable
    None,
    /// Exact-match queries over deterministic tokens
    Equality,
    /// Inclusive range queries within declared bounds
    Range(RangeSpec),
}

/// One encrypted field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    path: String,
    plaintext_type: PlaintextType,
    capability: QueryCapability,
    key_alias: Option<String>,
}

impl FieldSpec {
    /// Creates a field spec.
    #[must_use]
    pub fn new(
        path: impl Into<String>,
        plaintext_type: PlaintextType,
        capability: QueryCapability,
    ) -> Self {
        Self { path: path.into(), plaintext_type, capability, key_alias: None }
    }

    /// Field queryable by exact match.
    #[must_use]
    pub fn equality(path: impl Into<String>, plaintext_type: PlaintextType) -> Self {
        Self::new(path, plaintext_type, QueryCapability::Equality)
    }

    /// Field queryable by inclusive range within `[min, max]`.
    #[must_use]
    pub fn range(
        path: impl Into<String>,
        plaintext_type: PlaintextType,
        min: i64,
        max: i64,
        sparsity: u8,
    ) -> Self {
        Self::new(path, plaintext_type, QueryCapability::Range(RangeSpec::new(min, max, sparsity)))
    }

    /// Encrypted field that cannot be queried.
    #[must_use]
    pub fn unindexed(path: impl Into<String>, plaintext_type: PlaintextType) -> Self {
        Self::new(path, plaintext_type, QueryCapability::None)
    }

    /// Uses the data key registered under `alias` instead of the per-field
    /// default. Fields sharing an alias share a key.
    #[must_use]
    pub fn with_key_alias(mut self, alias: impl Into<String>) -> Self {
        self.key_alias = Some(alias.into());
        self
    }

    /// Dotted field path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Plaintext type.
    #[must_use]
    pub const fn plaintext_type(&self) -> PlaintextType {
        self.plaintext_type
    }

    /// Query capability.
    #[must_use]
    pub const fn capability(&self) -> QueryCapability {
        self.capability
    }

    /// Explicit key alias, if one was set.
    #[must_use]
    pub fn key_alias(&self) -> Option<&str> {
        self.key_alias.as_deref()
    }

    fn validate(&self) -> Result<(), Error> {
        if self.path.is_empty() || self.path.split('.').any(str::is_empty) {
            return Err(Error::InvalidSchema(format!("invalid field path '{}'", self.path)));
        }
        if self.path.starts_with('$') || self.path == "_id" {
            return Err(Error::InvalidSchema(format!("field '{}' cannot be encrypted", self.path)));
        }
        if let PlaintextType::Money { scale } = self.plaintext_type {
            if scale > MAX_MONEY_SCALE {
                return Err(Error::InvalidSchema(format!(
                    "money scale {scale} on '{}' exceeds {MAX_MONEY_SCALE}",
                    self.path
                )));
            }
        }
        if let QueryCapability::Range(range) = self.capability {
            RangeDomain::new(&self.path, self.plaintext_type, &range)?;
        }
        Ok(())
    }
}

/// The set of encrypted fields for one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldEncryptionSchema {
    collection: String,
    fields: Vec<FieldSpec>,
}

impl FieldEncryptionSchema {
    /// Builds and validates a schema.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` for an empty collection name, an
    /// invalid or duplicated path, a path nested under another encrypted
    /// path, a range on a non-numeric type, `min > max`, a sparsity outside
    /// `1..=4`, or bounds that overflow the normalized representation.
    pub fn new(collection: impl Into<String>, fields: Vec<FieldSpec>) -> Result<Self, Error> {
        let collection = collection.into();
        if collection.is_empty() {
            return Err(Error::InvalidSchema("collection name is empty".to_string()));
        }

        let mut seen = HashSet::new();
        for spec in &fields {
            spec.validate()?;
            if !seen.insert(spec.path.as_str()) {
                return Err(Error::InvalidSchema(format!("duplicate field '{}'", spec.path)));
            }
        }
        for spec in &fields {
            let nested = fields.iter().any(|other| {
                other.path != spec.path && spec.path.starts_with(&format!("{}.", other.path))
            });
            if nested {
                return Err(Error::InvalidSchema(format!(
                    "field '{}' is nested under another encrypted field",
                    spec.path
                )));
            }
        }

        Ok(Self { collection, fields })
    }

    /// Collection the schema is bound to.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// All encrypted fields.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Looks up the spec for `path`.
    #[must_use]
    pub fn field(&self, path: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|spec| spec.path == path)
    }

    /// Alias of the data key protecting `spec`: the explicit alias, or
    /// `<collection>.<path>`.
    #[must_use]
    pub fn key_alias_for(&self, spec: &FieldSpec) -> String {
        spec.key_alias
            .clone()
            .unwrap_or_else(|| format!("{}.{}", self.collection, spec.path))
    }

    /// Converts the schema into the descriptor the storage engine's
    /// encrypted-collection creation expects. Key ids are left unset; the
    /// provisioner fills them in.
    #[must_use]
    pub fn provisioning_descriptor(&self) -> EncryptedFieldsDescriptor {
        let fields = self
            .fields
            .iter()
            .map(|spec| EncryptedFieldEntry {
                path: spec.path.clone(),
                bson_type: spec.plaintext_type.storage_type().to_string(),
                key_alt_name: self.key_alias_for(spec),
                key_id: None,
                queries: match spec.capability {
                    QueryCapability::None => Vec::new(),
                    QueryCapability::Equality => vec![QueryDescriptor::Equality],
                    QueryCapability::Range(range) => vec![QueryDescriptor::Range {
                        min: range.min,
                        max: range.max,
                        sparsity: range.sparsity,
                    }],
                },
            })
            .collect();
        EncryptedFieldsDescriptor { fields }
    }
}

/// Storage-engine view of an encrypted collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFieldsDescriptor {
    /// Encrypted fields
    pub fields: Vec<EncryptedFieldEntry>,
}

impl EncryptedFieldsDescriptor {
    /// Paths the engine must only accept tokens for.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|entry| entry.path.as_str())
    }

    /// Renders the descriptor as a document.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` if serialization fails.
    pub fn to_document(&self) -> Result<serde_json::Value, Error> {
        serde_json::to_value(self).map_err(|e| Error::InvalidSchema(e.to_string()))
    }
}

/// One field of an [`EncryptedFieldsDescriptor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedFieldEntry {
    /// Dotted field path
    pub path: String,
    /// Storage type name
    pub bson_type: String,
    /// Alias of the protecting data key
    pub key_alt_name: String,
    /// Resolved data key id
    pub key_id: Option<KeyId>,
    /// Supported queries (empty for unindexed fields)
    pub queries: Vec<QueryDescriptor>,
}

/// Query capability as the storage engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "queryType", rename_all = "camelCase")]
pub enum QueryDescriptor {
    /// Equality queries
    Equality,
    /// Range queries
    Range {
        /// Inclusive lower bound
        min: i64,
        /// Inclusive upper bound
        max: i64,
        /// Edge sparsity
        sparsity: u8,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee_schema() -> FieldEncryptionSchema {
        FieldEncryptionSchema::new(
            "employees",
            vec![
                FieldSpec::equality("name", PlaintextType::String),
                FieldSpec::equality("ssn", PlaintextType::String),
                FieldSpec::range("salary", PlaintextType::Long, 0, 10_000_000, 1),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_field_lookup() {
        let schema = employee_schema();
        assert_eq!(schema.field("ssn").unwrap().capability(), QueryCapability::Equality);
        assert!(schema.field("department").is_none());
    }

    #[test]
    fn test_default_and_explicit_key_alias() {
        let schema = FieldEncryptionSchema::new(
            "employees",
            vec![
                FieldSpec::equality("name", PlaintextType::String),
                FieldSpec::unindexed("notes", PlaintextType::String).with_key_alias("shared"),
            ],
        )
        .unwrap();

        assert_eq!(schema.key_alias_for(&schema.fields()[0]), "employees.name");
        assert_eq!(schema.key_alias_for(&schema.fields()[1]), "shared");
    }

    #[test]
    fn test_provisioning_descriptor_document() {
        let doc = employee_schema().provisioning_descriptor().to_document().unwrap();
        let fields = doc["fields"].as_array().unwrap();

        assert_eq!(fields.len(), 3);
        assert_eq!(fields[0]["path"], "name");
        assert_eq!(fields[0]["bsonType"], "string");
        assert_eq!(fields[0]["keyId"], serde_json::Value::Null);
        assert_eq!(fields[0]["queries"][0]["queryType"], "equality");
        assert_eq!(fields[2]["queries"][0]["queryType"], "range");
        assert_eq!(fields[2]["queries"][0]["max"], 10_000_000);
        assert_eq!(fields[2]["queries"][0]["sparsity"], 1);
    }

    #[test]
    fn test_duplicate_path_rejected() {
        let result = FieldEncryptionSchema::new(
            "employees",
            vec![
                FieldSpec::equality("ssn", PlaintextType::String),
                FieldSpec::unindexed("ssn", PlaintextType::String),
            ],
        );
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_nested_encrypted_paths_rejected() {
        let result = FieldEncryptionSchema::new(
            "employees",
            vec![
                FieldSpec::unindexed("address", PlaintextType::String),
                FieldSpec::equality("address.zip", PlaintextType::String),
            ],
        );
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_range_on_string_rejected() {
        let result = FieldEncryptionSchema::new(
            "employees",
            vec![FieldSpec::range("name", PlaintextType::String, 0, 10, 1)],
        );
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let result = FieldEncryptionSchema::new(
            "employees",
            vec![FieldSpec::range("salary", PlaintextType::Long, 10, 0, 1)],
        );
        assert!(matches!(result, Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_sparsity_bounds() {
        for sparsity in [0, MAX_SPARSITY + 1] {
            let result = FieldEncryptionSchema::new(
                "employees",
                vec![FieldSpec::range("salary", PlaintextType::Long, 0, 100, sparsity)],
            );
            assert!(matches!(result, Err(Error::InvalidSchema(_))), "sparsity {sparsity}");
        }
    }

    #[test]
    fn test_invalid_paths_rejected() {
        for path in ["", "a..b", "$where", "_id"] {
            let result = FieldEncryptionSchema::new(
                "employees",
                vec![FieldSpec::equality(path, PlaintextType::String)],
            );
            assert!(matches!(result, Err(Error::InvalidSchema(_))), "path {path:?}");
        }
    }

    #[test]
    fn test_money_scale_factor() {
        assert_eq!(PlaintextType::Money { scale: 2 }.scale_factor(), 100);
        assert_eq!(PlaintextType::Long.scale_factor(), 1);
        assert_eq!(PlaintextType::Money { scale: 2 }.storage_type(), "long");
    }
}
