//! Key vault: wrapped data encryption keys in a document collection.
//!
//! Each data key is stored once, wrapped under the master key by a
//! [`KeyProvider`]:
//!
//! ```text
//! {
//!   "_id": "<uuid>",
//!   "keyAltNames": ["employees.salary"],
//!   "keyMaterial": "<base64 wrapped key>",
//!   "masterKey": {"provider": "local"},
//!   "creationDate": "2024-01-01T00:00:00+00:00",
//!   "status": 0
//! }
//! ```
//!
//! Uniqueness of aliases is enforced by a partial unique index on
//! `keyAltNames` in the backing collection, so processes racing to create
//! the same key converge on one document. Unwrapped keys are cached for the
//! lifetime of the vault and never written anywhere.

use crate::document::Document;
use crate::error::{Error, StorageError};
use crate::kdf::{derive_field_keys, generate_dek, FieldKeys};
use crate::key_provider::KeyProvider;
use crate::storage::{DocumentCollection, IndexSpec, StorageQuery};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Field holding a key's aliases.
pub const KEY_ALT_NAMES: &str = "keyAltNames";

const KEY_MATERIAL: &str = "keyMaterial";

/// Stable identifier of a data encryption key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(Uuid);

#[allow(clippy::new_without_default)]
impl KeyId {
    /// Generates a random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Builds an id from its 16 raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Raw bytes, as embedded in tokens.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for KeyId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::KeyUnavailable(format!("invalid key id '{s}': {e}")))
    }
}

/// An unwrapped data key, expanded into its per-scheme sub-keys.
pub struct DataKey {
    id: KeyId,
    keys: FieldKeys,
}

impl DataKey {
    /// Expands raw key material.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if the material has the wrong size.
    pub fn from_material(id: KeyId, material: &SecretVec<u8>) -> Result<Self, Error> {
        Ok(Self { id, keys: derive_field_keys(material)? })
    }

    /// Key id.
    #[must_use]
    pub const fn id(&self) -> &KeyId {
        &self.id
    }

    /// Derived sub-keys.
    #[must_use]
    pub const fn keys(&self) -> &FieldKeys {
        &self.keys
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey").field("id", &self.id).field("keys", &"[REDACTED]").finish()
    }
}

#[derive(Default)]
struct KeyCache {
    by_id: HashMap<KeyId, Arc<DataKey>>,
    by_alias: HashMap<String, KeyId>,
}

/// Store of wrapped data keys.
///
/// Safe to share between threads; clone the surrounding `Arc`.
pub struct KeyVault {
    collection: Arc<dyn DocumentCollection>,
    provider: Arc<dyn KeyProvider>,
    cache: RwLock<KeyCache>,
}

impl KeyVault {
    /// Opens a vault over `collection`, ensuring the alias index exists.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the index cannot be created.
    pub fn open(
        collection: Arc<dyn DocumentCollection>,
        provider: Arc<dyn KeyProvider>,
    ) -> Result<Self, Error> {
        collection.create_index(IndexSpec::unique_partial(KEY_ALT_NAMES))?;
        debug!(collection = collection.name(), provider = provider.provider_name(), "key vault opened");
        Ok(Self { collection, provider, cache: RwLock::new(KeyCache::default()) })
    }

    /// Returns the id of the key registered under `alias`, creating and
    /// persisting a new key if there is none.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if wrapping fails,
    /// `Error::AliasConflict` if a concurrent creation won the alias but its
    /// document cannot be read back, or `Error::StorageUnavailable`.
    pub fn ensure_data_key(&self, alias: &str) -> Result<KeyId, Error> {
        if let Some(id) = self.lookup(alias)? {
            return Ok(id);
        }

        let id = KeyId::new();
        let material = generate_dek();
        let wrapped = self.provider.wrap_dek(&id, material.expose_secret())?;
        let doc = self.key_document(&id, alias, &wrapped);

        match self.collection.insert_one(doc) {
            Ok(_) => {
                info!(alias, key_id = %id, provider = self.provider.provider_name(), "data key created");
                let key = Arc::new(DataKey::from_material(id, &material)?);
                let mut cache = self.cache.write();
                cache.by_id.insert(id, key);
                cache.by_alias.insert(alias.to_string(), id);
                Ok(id)
            }
            Err(StorageError::DuplicateKey { index }) => {
                warn!(alias, index = %index, "data key created concurrently, re-reading");
                self.lookup(alias)?.ok_or_else(|| {
                    Error::AliasConflict(format!("alias '{alias}' is taken but unreadable"))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Finds the key registered under `alias` without creating one.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` on storage failure, or
    /// `Error::KeyUnavailable` if the stored document is malformed.
    pub fn lookup(&self, alias: &str) -> Result<Option<KeyId>, Error> {
        if let Some(id) = self.cache.read().by_alias.get(alias) {
            return Ok(Some(*id));
        }
        let query = StorageQuery::eq(KEY_ALT_NAMES, Value::String(alias.to_string()));
        let Some(doc) = self.collection.find_one(&query)? else {
            debug!(alias, "no data key for alias");
            return Ok(None);
        };

        let id = stored_key_id(&doc)?;
        self.cache.write().by_alias.insert(alias.to_string(), id);
        debug!(alias, key_id = %id, "data key found");
        Ok(Some(id))
    }

    /// Returns the unwrapped key `id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::KeyUnavailable` if the key does not exist or cannot
    /// be unwrapped under the current master key.
    pub fn get_key(&self, id: &KeyId) -> Result<Arc<DataKey>, Error> {
        if let Some(key) = self.cache.read().by_id.get(id) {
            return Ok(Arc::clone(key));
        }

        let doc = self
            .collection
            .find_one(&StorageQuery::eq("_id", Value::String(id.to_string())))?
            .ok_or_else(|| Error::KeyUnavailable(format!("data key {id} not found")))?;

        let provider = doc.get("masterKey").and_then(|m| m.get("provider")).and_then(Value::as_str);
        if provider != Some(self.provider.provider_name()) {
            return Err(Error::KeyUnavailable(format!(
                "data key {id} is wrapped by provider {provider:?}, vault uses '{}'",
                self.provider.provider_name()
            )));
        }
        let wrapped = doc
            .get(KEY_MATERIAL)
            .and_then(Value::as_str)
            .and_then(|encoded| BASE64.decode(encoded).ok())
            .ok_or_else(|| Error::KeyUnavailable(format!("data key {id} has no key material")))?;

        let material = self.provider.unwrap_dek(id, &wrapped)?;
        let key = Arc::new(DataKey::from_material(*id, &material)?);
        debug!(key_id = %id, "data key unwrapped");

        let mut cache = self.cache.write();
        Ok(Arc::clone(cache.by_id.entry(*id).or_insert(key)))
    }

    /// Resolves `alias` to its unwrapped key, creating it if needed.
    ///
    /// # Errors
    ///
    /// See [`ensure_data_key`](Self::ensure_data_key) and
    /// [`get_key`](Self::get_key).
    pub fn data_key(&self, alias: &str) -> Result<Arc<DataKey>, Error> {
        let id = self.ensure_data_key(alias)?;
        self.get_key(&id)
    }

    /// Deletes a key. Data encrypted under it becomes unreadable.
    ///
    /// Returns `false` if no such key was stored.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` on storage failure.
    pub fn delete_data_key(&self, id: &KeyId) -> Result<bool, Error> {
        let deleted = self.collection.delete_one(&StorageQuery::eq("_id", Value::String(id.to_string())))?;

        let mut cache = self.cache.write();
        cache.by_id.remove(id);
        cache.by_alias.retain(|_, cached| *cached != *id);
        drop(cache);

        if deleted > 0 {
            warn!(key_id = %id, "data key deleted");
        }
        Ok(deleted > 0)
    }

    fn key_document(&self, id: &KeyId, alias: &str, wrapped: &[u8]) -> Document {
        let mut doc = Document::new();
        doc.insert("_id".to_string(), Value::String(id.to_string()));
        doc.insert(KEY_ALT_NAMES.to_string(), json!([alias]));
        doc.insert(KEY_MATERIAL.to_string(), Value::String(BASE64.encode(wrapped)));
        doc.insert("masterKey".to_string(), json!({ "provider": self.provider.provider_name() }));
        doc.insert("creationDate".to_string(), Value::String(chrono::Utc::now().to_rfc3339()));
        doc.insert("status".to_string(), json!(0));
        doc
    }
}

fn stored_key_id(doc: &Document) -> Result<KeyId, Error> {
    doc.get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::KeyUnavailable("key vault document has no string _id".to_string()))?
        .parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyProviderError;
    use crate::key_provider::{LocalKeyProvider, MasterKey};
    use crate::storage::{MemoryCollection, MemoryEngine, StorageEngine};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    // Counts unwraps to observe the cache
    struct CountingProvider {
        inner: LocalKeyProvider,
        unwraps: AtomicUsize,
    }

    impl CountingProvider {
        fn new() -> Self {
            Self {
                inner: LocalKeyProvider::new(&MasterKey::generate()).unwrap(),
                unwraps: AtomicUsize::new(0),
            }
        }
    }

    impl KeyProvider for CountingProvider {
        fn provider_name(&self) -> &str {
            "local"
        }

        fn wrap_dek(&self, key_id: &KeyId, dek: &[u8]) -> Result<Vec<u8>, KeyProviderError> {
            self.inner.wrap_dek(key_id, dek)
        }

        fn unwrap_dek(
            &self,
            key_id: &KeyId,
            wrapped_dek: &[u8],
        ) -> Result<SecretVec<u8>, KeyProviderError> {
            self.unwraps.fetch_add(1, Ordering::SeqCst);
            self.inner.unwrap_dek(key_id, wrapped_dek)
        }
    }

    fn local_provider() -> Arc<dyn KeyProvider> {
        Arc::new(LocalKeyProvider::new(&MasterKey::generate()).unwrap())
    }

    fn key_vault_collection() -> Arc<MemoryCollection> {
        Arc::new(MemoryCollection::new("encryption.__keyVault", Vec::new()))
    }

    fn alias_count(collection: &MemoryCollection, alias: &str) -> u64 {
        collection.count(&StorageQuery::eq(KEY_ALT_NAMES, json!(alias))).unwrap()
    }

    #[test]
    fn test_key_id_display_and_parse() {
        let id = KeyId::new();
        let parsed: KeyId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(KeyId::from_bytes(*id.as_bytes()), id);
        assert!(matches!("nope".parse::<KeyId>(), Err(Error::KeyUnavailable(_))));
    }

    #[test]
    fn test_data_key_debug_is_redacted() {
        let key = DataKey::from_material(KeyId::new(), &generate_dek()).unwrap();
        let rendered = format!("{key:?}");
        assert!(rendered.contains("[REDACTED]"));
        assert!(!rendered.contains("equality"));
    }

    #[test]
    fn test_open_creates_alias_index() {
        let collection = key_vault_collection();
        KeyVault::open(collection.clone(), local_provider()).unwrap();
        // Reopening with the same index definition is a no-op.
        KeyVault::open(collection, local_provider()).unwrap();
    }

    #[test]
    fn test_ensure_data_key_is_idempotent() {
        let collection = key_vault_collection();
        let vault = KeyVault::open(collection.clone(), local_provider()).unwrap();

        let first = vault.ensure_data_key("employees.name").unwrap();
        let second = vault.ensure_data_key("employees.name").unwrap();
        let other = vault.ensure_data_key("employees.salary").unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(alias_count(&collection, "employees.name"), 1);
    }

    #[test]
    fn test_vault_document_shape() {
        let collection = key_vault_collection();
        let vault = KeyVault::open(collection.clone(), local_provider()).unwrap();
        let id = vault.ensure_data_key("employees.ssn").unwrap();

        let doc = collection.find_one(&StorageQuery::eq("_id", json!(id.to_string()))).unwrap().unwrap();
        let fields: Vec<&str> = doc.keys().map(String::as_str).collect();
        assert_eq!(fields, ["_id", KEY_ALT_NAMES, KEY_MATERIAL, "masterKey", "creationDate", "status"]);
        assert_eq!(doc[KEY_ALT_NAMES], json!(["employees.ssn"]));
        assert_eq!(doc["masterKey"]["provider"], "local");
        assert_eq!(doc["status"], 0);
        assert!(chrono::DateTime::parse_from_rfc3339(doc["creationDate"].as_str().unwrap()).is_ok());
        // 12-byte nonce + 32-byte key + 16-byte tag
        let wrapped = BASE64.decode(doc[KEY_MATERIAL].as_str().unwrap()).unwrap();
        assert_eq!(wrapped.len(), 60);
    }

    #[test]
    fn test_ensure_survives_restart() {
        let collection = key_vault_collection();
        let master = MasterKey::generate();
        let provider = || -> Arc<dyn KeyProvider> { Arc::new(LocalKeyProvider::new(&master).unwrap()) };

        let first = KeyVault::open(collection.clone(), provider()).unwrap();
        let id = first.ensure_data_key("employees.name").unwrap();
        let key = first.get_key(&id).unwrap();

        let second = KeyVault::open(collection, provider()).unwrap();
        assert_eq!(second.lookup("employees.name").unwrap(), Some(id));
        let reloaded = second.get_key(&id).unwrap();
        assert_eq!(
            reloaded.keys().equality.expose_secret(),
            key.keys().equality.expose_secret()
        );
    }

    #[test]
    fn test_get_key_is_cached() {
        let collection = key_vault_collection();
        let provider = Arc::new(CountingProvider::new());
        let writer = KeyVault::open(collection.clone(), provider.clone()).unwrap();
        let id = writer.ensure_data_key("employees.salary").unwrap();

        let reader = KeyVault::open(collection, provider.clone()).unwrap();
        reader.get_key(&id).unwrap();
        reader.get_key(&id).unwrap();
        reader.get_key(&id).unwrap();
        assert_eq!(provider.unwraps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wrong_master_key_is_key_unavailable() {
        let collection = key_vault_collection();
        let writer = KeyVault::open(collection.clone(), local_provider()).unwrap();
        let id = writer.ensure_data_key("employees.name").unwrap();

        let reader = KeyVault::open(collection, local_provider()).unwrap();
        let err = reader.get_key(&id).unwrap_err();
        assert!(matches!(err, Error::KeyUnavailable(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_missing_key_is_key_unavailable() {
        let vault = KeyVault::open(key_vault_collection(), local_provider()).unwrap();
        assert!(matches!(vault.get_key(&KeyId::new()), Err(Error::KeyUnavailable(_))));
        assert_eq!(vault.lookup("nothing").unwrap(), None);
    }

    #[test]
    fn test_delete_data_key_evicts_cache() {
        let collection = key_vault_collection();
        let vault = KeyVault::open(collection.clone(), local_provider()).unwrap();
        let id = vault.ensure_data_key("employees.name").unwrap();
        vault.get_key(&id).unwrap();

        assert!(vault.delete_data_key(&id).unwrap());
        assert!(!vault.delete_data_key(&id).unwrap());
        assert!(matches!(vault.get_key(&id), Err(Error::KeyUnavailable(_))));
        assert_eq!(vault.lookup("employees.name").unwrap(), None);

        let replacement = vault.ensure_data_key("employees.name").unwrap();
        assert_ne!(replacement, id);
    }

    #[test]
    fn test_concurrent_ensure_creates_one_key() {
        let engine = MemoryEngine::new();
        let collection = engine.collection("encryption.__keyVault").unwrap();
        let master = MasterKey::generate();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provider: Arc<dyn KeyProvider> = Arc::new(LocalKeyProvider::new(&master).unwrap());
                let vault = KeyVault::open(Arc::clone(&collection), provider).unwrap();
                thread::spawn(move || vault.ensure_data_key("employees.salary").unwrap())
            })
            .collect();

        let ids: Vec<KeyId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(collection.count(&StorageQuery::eq(KEY_ALT_NAMES, json!("employees.salary"))).unwrap(), 1);
    }
}
