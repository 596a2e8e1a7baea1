//! In-process storage engine.
//!
//! Suitable for tests, demos and embedding. Unique indexes are checked and
//! the write applied under one lock, so concurrent inserts racing on a
//! unique key see exactly one winner.

use super::{DocumentCollection, IndexSpec, StorageEngine, StorageQuery};
use crate::document::{get_path, set_path, Document};
use crate::error::StorageError;
use crate::schema::EncryptedFieldsDescriptor;
use crate::token::is_token;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const ID_FIELD: &str = "_id";
const ID_INDEX: &str = "_id_";

#[derive(Default)]
struct CollectionState {
    docs: Vec<Document>,
    indexes: Vec<IndexSpec>,
}

/// A collection held in memory.
pub struct MemoryCollection {
    name: String,
    encrypted_paths: Vec<String>,
    state: Mutex<CollectionState>,
}

impl MemoryCollection {
    /// Creates an empty collection. Writes placing anything but a token in
    /// one of `encrypted_paths` are rejected.
    #[must_use]
    pub fn new(name: impl Into<String>, encrypted_paths: Vec<String>) -> Self {
        Self { name: name.into(), encrypted_paths, state: Mutex::new(CollectionState::default()) }
    }

    fn check_encrypted(&self, doc: &Document) -> Result<(), StorageError> {
        for path in &self.encrypted_paths {
            if let Some(value) = get_path(doc, path) {
                if !is_token(value) {
                    return Err(StorageError::Rejected(format!(
                        "field '{path}' of '{}' must be encrypted",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

fn index_keys(index: &IndexSpec, doc: &Document) -> Vec<Value> {
    match get_path(doc, &index.field) {
        Some(Value::Array(items)) => items.clone(),
        Some(value) => vec![value.clone()],
        None if index.partial_on_exists => Vec::new(),
        None => vec![Value::Null],
    }
}

fn check_unique(
    state: &CollectionState,
    doc: &Document,
    skip: Option<usize>,
) -> Result<(), StorageError> {
    let others = || state.docs.iter().enumerate().filter(move |(i, _)| Some(*i) != skip);

    if let Some(id) = doc.get(ID_FIELD) {
        if others().any(|(_, other)| other.get(ID_FIELD) == Some(id)) {
            return Err(StorageError::DuplicateKey { index: ID_INDEX.to_string() });
        }
    }
    for index in state.indexes.iter().filter(|index| index.unique) {
        let keys = index_keys(index, doc);
        if keys.is_empty() {
            continue;
        }
        let clash = others().any(|(_, other)| {
            index_keys(index, other).iter().any(|key| keys.contains(key))
        });
        if clash {
            return Err(StorageError::DuplicateKey { index: index.name.clone() });
        }
    }
    Ok(())
}

impl DocumentCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn find(&self, query: &StorageQuery) -> Result<Vec<Document>, StorageError> {
        let state = self.state.lock();
        Ok(state.docs.iter().filter(|doc| query.matches(doc)).cloned().collect())
    }

    fn insert_one(&self, mut doc: Document) -> Result<Value, StorageError> {
        self.check_encrypted(&doc)?;
        let id = doc
            .entry(ID_FIELD)
            .or_insert_with(|| Value::String(Uuid::new_v4().to_string()))
            .clone();

        let mut state = self.state.lock();
        check_unique(&state, &doc, None)?;
        state.docs.push(doc);
        Ok(id)
    }

    fn update_one(&self, query: &StorageQuery, set: Document) -> Result<u64, StorageError> {
        let mut state = self.state.lock();
        let Some(position) = state.docs.iter().position(|doc| query.matches(doc)) else {
            return Ok(0);
        };

        let mut updated = state.docs[position].clone();
        for (path, value) in set {
            if path == ID_FIELD && updated.get(ID_FIELD) != Some(&value) {
                return Err(StorageError::Rejected("_id is immutable".to_string()));
            }
            if !set_path(&mut updated, &path, value) {
                return Err(StorageError::Rejected(format!("cannot set '{path}'")));
            }
        }
        self.check_encrypted(&updated)?;
        check_unique(&state, &updated, Some(position))?;
        state.docs[position] = updated;
        Ok(1)
    }

    fn delete_one(&self, query: &StorageQuery) -> Result<u64, StorageError> {
        let mut state = self.state.lock();
        match state.docs.iter().position(|doc| query.matches(doc)) {
            Some(position) => {
                state.docs.remove(position);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    fn create_index(&self, index: IndexSpec) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if let Some(existing) = state.indexes.iter().find(|i| i.name == index.name) {
            if *existing == index {
                return Ok(());
            }
            return Err(StorageError::Rejected(format!(
                "index '{}' exists with a different definition",
                index.name
            )));
        }

        if index.unique {
            let mut seen: Vec<Value> = Vec::new();
            for doc in &state.docs {
                for key in index_keys(&index, doc) {
                    if seen.contains(&key) {
                        return Err(StorageError::Rejected(format!(
                            "existing documents violate unique index '{}'",
                            index.name
                        )));
                    }
                    seen.push(key);
                }
            }
        }

        debug!(collection = %self.name, index = %index.name, "index created");
        state.indexes.push(index);
        Ok(())
    }
}

/// In-memory storage engine.
#[derive(Default)]
pub struct MemoryEngine {
    collections: RwLock<BTreeMap<String, Arc<MemoryCollection>>>,
}

impl MemoryEngine {
    /// Creates an empty engine.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageEngine for MemoryEngine {
    fn collection(&self, name: &str) -> Result<Arc<dyn DocumentCollection>, StorageError> {
        if let Some(existing) = self.collections.read().get(name) {
            return Ok(Arc::clone(existing) as Arc<dyn DocumentCollection>);
        }
        let mut collections = self.collections.write();
        let entry = collections
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new(name, Vec::new())));
        Ok(Arc::clone(entry) as Arc<dyn DocumentCollection>)
    }

    fn create_collection(
        &self,
        name: &str,
        encrypted_fields: Option<&EncryptedFieldsDescriptor>,
    ) -> Result<(), StorageError> {
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(StorageError::NamespaceExists(name.to_string()));
        }
        let paths: Vec<String> = encrypted_fields
            .map(|descriptor| descriptor.paths().map(str::to_string).collect())
            .unwrap_or_default();
        info!(collection = name, encrypted_fields = paths.len(), "collection created");
        collections.insert(name.to_string(), Arc::new(MemoryCollection::new(name, paths)));
        Ok(())
    }

    fn list_collections(&self, name: Option<&str>) -> Result<Vec<String>, StorageError> {
        let collections = self.collections.read();
        Ok(collections.keys().filter(|key| name.map_or(true, |n| n == *key)).cloned().collect())
    }

    fn drop_collection(&self, name: &str) -> Result<(), StorageError> {
        match self.collections.write().remove(name) {
            Some(_) => Ok(()),
            None => Err(StorageError::NamespaceNotFound(name.to_string())),
        }
    }
}
