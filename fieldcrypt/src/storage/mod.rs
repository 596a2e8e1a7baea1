//! Storage boundary.
//!
//! The core talks to storage only through [`StorageEngine`] and
//! [`DocumentCollection`]. Filters are expressed as a [`StorageQuery`] that
//! may reference encrypted tokens; recognising and indexing those is the
//! engine's job. [`memory::MemoryEngine`] is the in-process reference engine.

pub mod memory;

pub use memory::{MemoryCollection, MemoryEngine};

use crate::document::{get_path, Document};
use crate::error::StorageError;
use crate::schema::EncryptedFieldsDescriptor;
use crate::token::EDGES_KEY;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// A condition on one field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Condition {
    /// Value equals, or is an array containing, `value`
    Equals {
        /// Expected value (plaintext or deterministic token)
        value: Value,
    },
    /// Plaintext comparison; a missing bound is unconstrained
    Between {
        /// Inclusive lower bound
        #[serde(skip_serializing_if = "Option::is_none")]
        gte: Option<Value>,
        /// Inclusive upper bound
        #[serde(skip_serializing_if = "Option::is_none")]
        lte: Option<Value>,
    },
    /// Range token whose edges intersect `tags`
    AnyEdge {
        /// Base64 edge tags
        tags: Vec<String>,
    },
}

impl Condition {
    /// Evaluates the condition against a field value.
    #[must_use]
    pub fn matches(&self, value: Option<&Value>) -> bool {
        let Some(value) = value else {
            return false;
        };
        match self {
            Self::Equals { value: expected } => {
                value == expected
                    || value.as_array().is_some_and(|items| items.contains(expected))
            }
            Self::Between { gte, lte } => {
                let above = gte.as_ref().map_or(true, |lo| {
                    matches!(compare(value, lo), Some(Ordering::Greater | Ordering::Equal))
                });
                let below = lte.as_ref().map_or(true, |hi| {
                    matches!(compare(value, hi), Some(Ordering::Less | Ordering::Equal))
                });
                above && below
            }
            Self::AnyEdge { tags } => {
                let wanted: HashSet<&str> = tags.iter().map(String::as_str).collect();
                value
                    .get(EDGES_KEY)
                    .and_then(Value::as_array)
                    .is_some_and(|edges| {
                        edges.iter().filter_map(Value::as_str).any(|tag| wanted.contains(tag))
                    })
            }
        }
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A condition bound to a field path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldFilter {
    /// Dotted path
    pub path: String,
    /// Condition on the field
    pub condition: Condition,
}

/// A conjunction of field filters. The empty query matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StorageQuery {
    clauses: Vec<FieldFilter>,
}

impl StorageQuery {
    /// Matches every document.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Shorthand for a single equality clause.
    #[must_use]
    pub fn eq(path: impl Into<String>, value: Value) -> Self {
        Self::all().with(path, Condition::Equals { value })
    }

    /// Adds a clause.
    #[must_use]
    pub fn with(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push(FieldFilter { path: path.into(), condition });
        self
    }

    /// The clauses, in insertion order.
    #[must_use]
    pub fn clauses(&self) -> &[FieldFilter] {
        &self.clauses
    }

    /// Returns `true` if every clause matches `doc`.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses.iter().all(|clause| clause.condition.matches(get_path(doc, &clause.path)))
    }
}

/// Secondary index declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    /// Index name
    pub name: String,
    /// Indexed field (array values index each element)
    pub field: String,
    /// Reject two documents sharing a key
    pub unique: bool,
    /// Only index documents where the field exists
    pub partial_on_exists: bool,
}

impl IndexSpec {
    /// Unique index over documents where `field` is present.
    #[must_use]
    pub fn unique_partial(field: impl Into<String>) -> Self {
        let field = field.into();
        Self { name: format!("{field}_1"), field, unique: true, partial_on_exists: true }
    }
}

/// A generic document collection.
pub trait DocumentCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Returns every matching document in insertion order.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the backend fails.
    fn find(&self, query: &StorageQuery) -> Result<Vec<Document>, StorageError>;

    /// Returns the first matching document.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the backend fails.
    fn find_one(&self, query: &StorageQuery) -> Result<Option<Document>, StorageError> {
        Ok(self.find(query)?.into_iter().next())
    }

    /// Inserts a document, assigning `_id` when absent, and returns the id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::DuplicateKey` when a unique index rejects it.
    fn insert_one(&self, doc: Document) -> Result<Value, StorageError>;

    /// Applies `$set` semantics to the first matching document and returns
    /// the number of matched documents (0 or 1).
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the update is rejected.
    fn update_one(&self, query: &StorageQuery, set: Document) -> Result<u64, StorageError>;

    /// Deletes the first matching document and returns the count deleted.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the backend fails.
    fn delete_one(&self, query: &StorageQuery) -> Result<u64, StorageError>;

    /// Counts matching documents.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the backend fails.
    fn count(&self, query: &StorageQuery) -> Result<u64, StorageError> {
        Ok(self.find(query)?.len() as u64)
    }

    /// Creates an index; creating an identical index again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::Rejected` if an index of the same name but a
    /// different definition exists, or existing documents violate it.
    fn create_index(&self, index: IndexSpec) -> Result<(), StorageError>;
}

/// The storage engine hosting collections.
pub trait StorageEngine: Send + Sync {
    /// Returns the named collection, creating a plain one if it is absent.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the backend fails.
    fn collection(&self, name: &str) -> Result<Arc<dyn DocumentCollection>, StorageError>;

    /// Creates a collection. With a descriptor, the engine itself refuses
    /// plaintext in the described paths.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NamespaceExists` if the collection exists.
    fn create_collection(
        &self,
        name: &str,
        encrypted_fields: Option<&EncryptedFieldsDescriptor>,
    ) -> Result<(), StorageError>;

    /// Lists collection names, optionally restricted to an exact name.
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` if the backend fails.
    fn list_collections(&self, name: Option<&str>) -> Result<Vec<String>, StorageError>;

    /// Drops a collection.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NamespaceNotFound` if it does not exist.
    fn drop_collection(&self, name: &str) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_equals_matches_array_element() {
        let d = doc(json!({"keyAltNames": ["employees.name", "legacy"]}));
        assert!(StorageQuery::eq("keyAltNames", json!("legacy")).matches(&d));
        assert!(!StorageQuery::eq("keyAltNames", json!("other")).matches(&d));
    }

    #[test]
    fn test_between_open_bounds() {
        let d = doc(json!({"age": 30}));
        let q = |gte, lte| {
            StorageQuery::all().with("age", Condition::Between { gte, lte })
        };
        assert!(q(Some(json!(30)), None).matches(&d));
        assert!(q(None, Some(json!(30))).matches(&d));
        assert!(!q(Some(json!(31)), None).matches(&d));
        assert!(!q(Some(json!("a")), None).matches(&d), "mixed types never match");
    }

    #[test]
    fn test_any_edge() {
        let d = doc(json!({"salary": {"$encrypted": "AQ==", "$edges": ["x", "y"]}}));
        let hit = StorageQuery::all()
            .with("salary", Condition::AnyEdge { tags: vec!["q".into(), "y".into()] });
        let miss = StorageQuery::all().with("salary", Condition::AnyEdge { tags: vec!["q".into()] });
        assert!(hit.matches(&d));
        assert!(!miss.matches(&d));
    }

    #[test]
    fn test_missing_field_never_matches() {
        let d = doc(json!({"a": 1}));
        assert!(!StorageQuery::eq("b", json!(1)).matches(&d));
        assert!(StorageQuery::all().matches(&d));
    }

    #[test]
    fn test_query_serializes() {
        let q = StorageQuery::eq("name", json!("Alice"));
        let rendered = serde_json::to_value(&q).unwrap();
        assert_eq!(rendered["clauses"][0]["condition"]["op"], "equals");
    }
}
