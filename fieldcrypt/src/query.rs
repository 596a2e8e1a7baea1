//! Plaintext predicates and their translation into storage queries.
//!
//! A [`Predicate`] is written against plaintext values. The
//! [`QueryTranslator`] rewrites every clause on an encrypted field into a
//! condition over tokens, and passes clauses on other fields through
//! unchanged. Clauses are keyed independently, so a conjunction mixing
//! equality and range clauses on different fields needs no extra
//! cryptography.
//!
//! All validation happens before any data key is resolved: a malformed
//! predicate never reaches the key vault or the storage engine.

use crate::codec::{encrypt_field, validate_plaintext, RangeQuery};
use crate::error::Error;
use crate::schema::{FieldEncryptionSchema, FieldSpec, QueryCapability};
use crate::storage::{Condition, StorageQuery};
use crate::vault::KeyVault;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// A predicate over plaintext field values.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field = value`
    Eq {
        /// Dotted field path
        field: String,
        /// Plaintext value
        value: Value,
    },
    /// `min <= field <= max`; either bound may be omitted
    Range {
        /// Dotted field path
        field: String,
        /// Inclusive lower bound
        min: Option<Value>,
        /// Inclusive upper bound
        max: Option<Value>,
    },
    /// Conjunction
    And(Vec<Predicate>),
}

impl Predicate {
    /// `field = value`.
    #[must_use]
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq { field: field.into(), value: value.into() }
    }

    /// `min <= field <= max`.
    #[must_use]
    pub fn between(field: impl Into<String>, min: impl Into<Value>, max: impl Into<Value>) -> Self {
        Self::Range { field: field.into(), min: Some(min.into()), max: Some(max.into()) }
    }

    /// `field >= min`.
    #[must_use]
    pub fn at_least(field: impl Into<String>, min: impl Into<Value>) -> Self {
        Self::Range { field: field.into(), min: Some(min.into()), max: None }
    }

    /// `field <= max`.
    #[must_use]
    pub fn at_most(field: impl Into<String>, max: impl Into<Value>) -> Self {
        Self::Range { field: field.into(), min: None, max: Some(max.into()) }
    }

    /// Matches every document.
    #[must_use]
    pub const fn all() -> Self {
        Self::And(Vec::new())
    }

    /// Conjunction of `self` and `other`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut clauses) => {
                clauses.push(other);
                Self::And(clauses)
            }
            first => Self::And(vec![first, other]),
        }
    }

    fn flatten<'a>(&'a self, out: &mut Vec<&'a Self>) {
        match self {
            Self::And(clauses) => clauses.iter().for_each(|clause| clause.flatten(out)),
            leaf => out.push(leaf),
        }
    }
}

// A validated clause, not yet keyed.
enum Plan<'a> {
    Plain { path: &'a str, condition: Condition },
    Equality { spec: &'a FieldSpec, value: &'a Value },
    Range { spec: &'a FieldSpec, query: RangeQuery },
}

/// Rewrites plaintext predicates into token-level storage queries.
#[derive(Clone)]
pub struct QueryTranslator {
    vault: Arc<KeyVault>,
}

impl QueryTranslator {
    /// Creates a translator resolving data keys through `vault`.
    #[must_use]
    pub const fn new(vault: Arc<KeyVault>) -> Self {
        Self { vault }
    }

    /// Translates `predicate` for the collection described by `schema`.
    ///
    /// An empty conjunction translates to a query matching everything.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPredicate` for `lo > hi`, a range with no
    /// bounds, a clause the field's capability cannot answer, or two clauses
    /// on one field; `Error::InvalidPlaintextDomain` for values outside the
    /// field's type or range. Key and storage errors from resolving data
    /// keys are passed through.
    pub fn translate(
        &self,
        predicate: &Predicate,
        schema: &FieldEncryptionSchema,
    ) -> Result<StorageQuery, Error> {
        let mut leaves = Vec::new();
        predicate.flatten(&mut leaves);

        let mut fields = HashSet::new();
        let mut plans = Vec::with_capacity(leaves.len());
        for leaf in leaves {
            let plan = plan_clause(leaf, schema)?;
            let path = match &plan {
                Plan::Plain { path, .. } => *path,
                Plan::Equality { spec, .. } | Plan::Range { spec, .. } => spec.path(),
            };
            if !fields.insert(path) {
                return Err(Error::InvalidPredicate(format!("more than one clause on '{path}'")));
            }
            plans.push(plan);
        }

        let mut query = StorageQuery::all();
        for plan in plans {
            query = match plan {
                Plan::Plain { path, condition } => {
                    debug!(collection = schema.collection(), path, "plain clause");
                    query.with(path, condition)
                }
                Plan::Equality { spec, value } => {
                    let key = self.vault.data_key(&schema.key_alias_for(spec))?;
                    let token = encrypt_field(spec, value, &key)?.to_value()?;
                    debug!(collection = schema.collection(), path = spec.path(), "equality clause");
                    query.with(spec.path(), Condition::Equals { value: token })
                }
                Plan::Range { spec, query: range } => {
                    let key = self.vault.data_key(&schema.key_alias_for(spec))?;
                    let tags = range.edge_tags(&key)?.iter().map(|tag| tag.encode()).collect::<Vec<_>>();
                    debug!(
                        collection = schema.collection(),
                        path = spec.path(),
                        tags = tags.len(),
                        "range clause"
                    );
                    query.with(spec.path(), Condition::AnyEdge { tags })
                }
            };
        }
        Ok(query)
    }
}

fn plan_clause<'a>(
    predicate: &'a Predicate,
    schema: &'a FieldEncryptionSchema,
) -> Result<Plan<'a>, Error> {
    match predicate {
        Predicate::Eq { field, value } => match schema.field(field) {
            None => {
                check_plain_path(field, schema)?;
                Ok(Plan::Plain { path: field, condition: Condition::Equals { value: value.clone() } })
            }
            Some(spec) => match spec.capability() {
                QueryCapability::Equality => {
                    validate_plaintext(spec, value)?;
                    Ok(Plan::Equality { spec, value })
                }
                QueryCapability::Range(_) => {
                    Ok(Plan::Range { spec, query: RangeQuery::new(spec, Some(value), Some(value))? })
                }
                QueryCapability::None => Err(not_queryable(field)),
            },
        },
        Predicate::Range { field, min, max } => match schema.field(field) {
            None => {
                check_plain_path(field, schema)?;
                plain_range(field, min.as_ref(), max.as_ref())
            }
            Some(spec) => match spec.capability() {
                QueryCapability::Range(_) => {
                    Ok(Plan::Range { spec, query: RangeQuery::new(spec, min.as_ref(), max.as_ref())? })
                }
                QueryCapability::Equality => Err(Error::InvalidPredicate(format!(
                    "'{field}' only supports equality queries"
                ))),
                QueryCapability::None => Err(not_queryable(field)),
            },
        },
        Predicate::And(_) => Err(Error::InvalidPredicate("nested conjunction".to_string())),
    }
}

// A plain clause must not overlap an encrypted path, or the filter would
// carry that field's plaintext to storage.
fn check_plain_path(field: &str, schema: &FieldEncryptionSchema) -> Result<(), Error> {
    let overlapping = schema.fields().iter().find(|spec| {
        let encrypted = spec.path();
        encrypted.strip_prefix(field).is_some_and(|rest| rest.starts_with('.'))
            || field.strip_prefix(encrypted).is_some_and(|rest| rest.starts_with('.'))
    });
    match overlapping {
        Some(spec) => Err(Error::InvalidPredicate(format!(
            "'{field}' overlaps encrypted field '{}'",
            spec.path()
        ))),
        None => Ok(()),
    }
}

fn plain_range<'a>(
    field: &'a str,
    min: Option<&Value>,
    max: Option<&Value>,
) -> Result<Plan<'a>, Error> {
    if min.is_none() && max.is_none() {
        return Err(Error::InvalidPredicate(format!("range query on '{field}' needs at least one bound")));
    }
    if let (Some(lo), Some(hi)) = (min, max) {
        if compare_bounds(lo, hi) == Some(Ordering::Greater) {
            return Err(Error::InvalidPredicate(format!(
                "range query on '{field}' has lower bound above upper bound"
            )));
        }
    }
    Ok(Plan::Plain {
        path: field,
        condition: Condition::Between { gte: min.cloned(), lte: max.cloned() },
    })
}

fn compare_bounds(lo: &Value, hi: &Value) -> Option<Ordering> {
    match (lo, hi) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn not_queryable(field: &str) -> Error {
    Error::InvalidPredicate(format!("'{field}' is encrypted without query support"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key_provider::{KeyProvider, LocalKeyProvider, MasterKey};
    use crate::schema::PlaintextType;
    use crate::storage::{DocumentCollection, MemoryCollection};
    use serde_json::json;

    fn schema() -> FieldEncryptionSchema {
        FieldEncryptionSchema::new(
            "employees",
            vec![
                FieldSpec::equality("name", PlaintextType::String),
                FieldSpec::range("salary", PlaintextType::Long, 0, 10_000_000, 1),
                FieldSpec::unindexed("notes", PlaintextType::String),
            ],
        )
        .unwrap()
    }

    fn setup() -> (Arc<MemoryCollection>, Arc<KeyVault>, QueryTranslator) {
        let keys = Arc::new(MemoryCollection::new("encryption.__keyVault", Vec::new()));
        let provider: Arc<dyn KeyProvider> =
            Arc::new(LocalKeyProvider::new(&MasterKey::generate()).unwrap());
        let vault = Arc::new(KeyVault::open(keys.clone(), provider).unwrap());
        (keys, Arc::clone(&vault), QueryTranslator::new(vault))
    }

    fn key_count(keys: &MemoryCollection) -> u64 {
        keys.count(&StorageQuery::all()).unwrap()
    }

    #[test]
    fn test_equality_clause_uses_token() {
        let (_, vault, translator) = setup();
        let schema = schema();
        let query = translator.translate(&Predicate::eq("name", "Alice Johnson"), &schema).unwrap();

        let spec = schema.field("name").unwrap();
        let key = vault.data_key("employees.name").unwrap();
        let expected = encrypt_field(spec, &json!("Alice Johnson"), &key).unwrap().to_value().unwrap();

        assert_eq!(query.clauses().len(), 1);
        assert_eq!(query.clauses()[0].condition, Condition::Equals { value: expected });
    }

    #[test]
    fn test_range_clause_uses_edges() {
        let (_, _, translator) = setup();
        let query =
            translator.translate(&Predicate::between("salary", 100, 200), &schema()).unwrap();
        assert!(matches!(
            &query.clauses()[0].condition,
            Condition::AnyEdge { tags } if !tags.is_empty()
        ));
    }

    #[test]
    fn test_plain_fields_pass_through() {
        let (keys, _, translator) = setup();
        let predicate = Predicate::eq("department", "Engineering")
            .and(Predicate::at_least("age", 30));
        let query = translator.translate(&predicate, &schema()).unwrap();

        assert_eq!(
            query.clauses()[0].condition,
            Condition::Equals { value: json!("Engineering") }
        );
        assert_eq!(
            query.clauses()[1].condition,
            Condition::Between { gte: Some(json!(30)), lte: None }
        );
        assert_eq!(key_count(&keys), 0, "plain clauses need no key");
    }

    #[test]
    fn test_inverted_range_rejected_before_key_lookup() {
        let (keys, _, translator) = setup();
        for predicate in [Predicate::between("salary", 200, 100), Predicate::between("age", 9, 1)] {
            let result = translator.translate(&predicate, &schema());
            assert!(matches!(result, Err(Error::InvalidPredicate(_))));
        }
        assert_eq!(key_count(&keys), 0);
    }

    #[test]
    fn test_capability_mismatch_rejected() {
        let (keys, _, translator) = setup();
        let cases = [
            Predicate::at_least("name", "A"),
            Predicate::eq("notes", "x"),
            Predicate::between("notes", 1, 2),
            Predicate::Range { field: "salary".into(), min: None, max: None },
        ];
        for predicate in cases {
            let result = translator.translate(&predicate, &schema());
            assert!(matches!(result, Err(Error::InvalidPredicate(_))), "{predicate:?}");
        }
        assert_eq!(key_count(&keys), 0);
    }

    #[test]
    fn test_duplicate_field_rejected() {
        let (_, _, translator) = setup();
        let predicate = Predicate::at_least("salary", 1).and(Predicate::at_most("salary", 5));
        let result = translator.translate(&predicate, &schema());
        assert!(matches!(result, Err(Error::InvalidPredicate(_))));
    }

    #[test]
    fn test_equality_on_range_field_is_point_range() {
        let (_, _, translator) = setup();
        let point = translator.translate(&Predicate::eq("salary", 150), &schema()).unwrap();
        let range = translator.translate(&Predicate::between("salary", 150, 150), &schema()).unwrap();
        assert_eq!(point, range);
    }

    #[test]
    fn test_combined_predicate() {
        let (_, _, translator) = setup();
        let predicate = Predicate::eq("name", "Alice Johnson")
            .and(Predicate::at_least("salary", 40_000))
            .and(Predicate::eq("department", "Engineering"));
        let query = translator.translate(&predicate, &schema()).unwrap();
        let paths: Vec<_> = query.clauses().iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, ["name", "salary", "department"]);
    }

    #[test]
    fn test_empty_conjunction_matches_all() {
        let (_, _, translator) = setup();
        assert_eq!(translator.translate(&Predicate::all(), &schema()).unwrap(), StorageQuery::all());
    }

    #[test]
    fn test_invalid_equality_value_creates_no_key() {
        let (keys, _, translator) = setup();
        let result = translator.translate(&Predicate::eq("name", 42), &schema());

        assert!(matches!(result, Err(Error::InvalidPlaintextDomain { .. })));
        assert_eq!(key_count(&keys), 0);
    }

    #[test]
    fn test_plain_clause_overlapping_encrypted_path_rejected() {
        let (keys, _, translator) = setup();
        let schema = FieldEncryptionSchema::new(
            "employees",
            vec![FieldSpec::equality("address.zip", PlaintextType::String)],
        )
        .unwrap();

        for predicate in [
            Predicate::eq("address", json!({"zip": "10001"})),
            Predicate::eq("address.zip.code", "10001"),
            Predicate::at_least("address", 1),
        ] {
            let result = translator.translate(&predicate, &schema);
            assert!(matches!(result, Err(Error::InvalidPredicate(_))), "{predicate:?}");
        }
        assert_eq!(key_count(&keys), 0);

        let sibling = translator.translate(&Predicate::eq("address.city", "New York"), &schema).unwrap();
        assert_eq!(sibling.clauses()[0].path, "address.city");
        let lookalike = translator.translate(&Predicate::eq("address.zipcode", "10001"), &schema).unwrap();
        assert_eq!(lookalike.clauses()[0].path, "address.zipcode");
    }
}
