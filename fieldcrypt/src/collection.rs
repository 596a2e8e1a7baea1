//! Auto-encrypting collection.
//!
//! [`EncryptedCollection`] wraps a plain [`DocumentCollection`]: documents
//! are encrypted field by field before they are written, predicates are
//! translated before they are sent, and results are decrypted before they
//! are returned. Callers only ever see plaintext.

use crate::codec::{decrypt_field, encrypt_field, validate_plaintext};
use crate::document::{get_path_mut, Document};
use crate::error::Error;
use crate::query::{Predicate, QueryTranslator};
use crate::schema::{FieldEncryptionSchema, FieldSpec};
use crate::storage::{DocumentCollection, StorageEngine};
use crate::token::EncryptedToken;
use crate::vault::KeyVault;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// A collection whose schema fields are transparently encrypted.
pub struct EncryptedCollection {
    schema: Arc<FieldEncryptionSchema>,
    inner: Arc<dyn DocumentCollection>,
    vault: Arc<KeyVault>,
    translator: QueryTranslator,
}

impl EncryptedCollection {
    /// Wraps `inner` with `schema`.
    #[must_use]
    pub fn new(
        schema: Arc<FieldEncryptionSchema>,
        inner: Arc<dyn DocumentCollection>,
        vault: Arc<KeyVault>,
    ) -> Self {
        let translator = QueryTranslator::new(Arc::clone(&vault));
        Self { schema, inner, vault, translator }
    }

    /// Opens the collection named by `schema` on `engine`.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the engine fails.
    pub fn open(
        engine: &dyn StorageEngine,
        schema: Arc<FieldEncryptionSchema>,
        vault: Arc<KeyVault>,
    ) -> Result<Self, Error> {
        let inner = engine.collection(schema.collection())?;
        Ok(Self::new(schema, inner, vault))
    }

    /// The collection's schema.
    #[must_use]
    pub fn schema(&self) -> &FieldEncryptionSchema {
        &self.schema
    }

    fn encrypt_value(&self, spec: &FieldSpec, value: &mut Value) -> Result<(), Error> {
        validate_plaintext(spec, value)?;
        let key = self.vault.data_key(&self.schema.key_alias_for(spec))?;
        *value = encrypt_field(spec, value, &key)?.to_value()?;
        Ok(())
    }

    /// Replaces every schema field present in `doc` with its token.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPlaintextDomain` for values outside a field's
    /// type or range, or key vault errors.
    pub fn encrypt_document(&self, mut doc: Document) -> Result<Document, Error> {
        for spec in self.schema.fields() {
            if let Some(value) = get_path_mut(&mut doc, spec.path()) {
                self.encrypt_value(spec, value)?;
            }
        }
        Ok(doc)
    }

    /// Replaces every token in `doc` with its plaintext.
    ///
    /// # Errors
    ///
    /// Returns `Error::MalformedToken` if a schema field holds something
    /// other than a valid token, or `Error::KeyUnavailable` if its data key
    /// cannot be obtained.
    pub fn decrypt_document(&self, mut doc: Document) -> Result<Document, Error> {
        for spec in self.schema.fields() {
            if let Some(value) = get_path_mut(&mut doc, spec.path()) {
                let token = EncryptedToken::from_value(value)?;
                let key = self.vault.get_key(token.key_id())?;
                *value = decrypt_field(spec, &token, &key)?;
            }
        }
        Ok(doc)
    }

    /// Encrypts and inserts a document, returning its `_id`.
    ///
    /// # Errors
    ///
    /// Returns encryption errors, or `Error::StorageUnavailable`.
    pub fn insert_one(&self, doc: Document) -> Result<Value, Error> {
        let encrypted = self.encrypt_document(doc)?;
        let id = self.inner.insert_one(encrypted)?;
        debug!(collection = self.inner.name(), "document inserted");
        Ok(id)
    }

    /// Finds and decrypts every document matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns translation errors, decryption errors, or
    /// `Error::StorageUnavailable`. No match is `Ok` with an empty vector.
    pub fn find(&self, predicate: &Predicate) -> Result<Vec<Document>, Error> {
        let query = self.translator.translate(predicate, &self.schema)?;
        let docs = self.inner.find(&query)?;
        debug!(collection = self.inner.name(), matched = docs.len(), "find");
        docs.into_iter().map(|doc| self.decrypt_document(doc)).collect()
    }

    /// Finds and decrypts the first document matching `predicate`.
    ///
    /// # Errors
    ///
    /// See [`find`](Self::find).
    pub fn find_one(&self, predicate: &Predicate) -> Result<Option<Document>, Error> {
        let query = self.translator.translate(predicate, &self.schema)?;
        self.inner.find_one(&query)?.map(|doc| self.decrypt_document(doc)).transpose()
    }

    /// Applies `$set` to the first match. Keys of `set` are dotted paths;
    /// values landing on encrypted fields are encrypted first.
    ///
    /// # Errors
    ///
    /// Returns translation or encryption errors, or
    /// `Error::StorageUnavailable`.
    pub fn update_one(&self, predicate: &Predicate, set: Document) -> Result<u64, Error> {
        let query = self.translator.translate(predicate, &self.schema)?;

        let mut encrypted = Document::new();
        for (path, mut value) in set {
            for spec in self.schema.fields() {
                if spec.path() == path {
                    self.encrypt_value(spec, &mut value)?;
                } else if let Some(rest) = spec.path().strip_prefix(&format!("{path}.")) {
                    // Setting a parent object that contains an encrypted field.
                    if let Some(nested) = value.as_object_mut().and_then(|obj| get_path_mut(obj, rest)) {
                        self.encrypt_value(spec, nested)?;
                    }
                }
            }
            encrypted.insert(path, value);
        }

        Ok(self.inner.update_one(&query, encrypted)?)
    }

    /// Deletes the first document matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns translation errors, or `Error::StorageUnavailable`.
    pub fn delete_one(&self, predicate: &Predicate) -> Result<u64, Error> {
        let query = self.translator.translate(predicate, &self.schema)?;
        Ok(self.inner.delete_one(&query)?)
    }

    /// Counts documents matching `predicate`.
    ///
    /// # Errors
    ///
    /// Returns translation errors, or `Error::StorageUnavailable`.
    pub fn count(&self, predicate: &Predicate) -> Result<u64, Error> {
        let query = self.translator.translate(predicate, &self.schema)?;
        Ok(self.inner.count(&query)?)
    }
}
