//! Encrypted collection provisioning.
//!
//! Provisioning binds a [`FieldEncryptionSchema`] to a storage collection:
//! every field's data key is resolved (created on first use) and the
//! resulting descriptor is handed to the engine, which from then on refuses
//! plaintext in the encrypted paths.

use crate::config::EncryptionConfig;
use crate::error::{Error, StorageError};
use crate::schema::{EncryptedFieldsDescriptor, FieldEncryptionSchema};
use crate::storage::StorageEngine;
use crate::vault::KeyVault;
use std::sync::Arc;
use tracing::{info, warn};

/// Result of [`EncryptedCollectionProvisioner::provision`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The collection was created with this descriptor
    Created(EncryptedFieldsDescriptor),
    /// The collection already existed and was left untouched
    AlreadyExists,
}

/// Creates encrypted collections.
pub struct EncryptedCollectionProvisioner {
    engine: Arc<dyn StorageEngine>,
    vault: Arc<KeyVault>,
}

impl EncryptedCollectionProvisioner {
    /// Creates a provisioner.
    #[must_use]
    pub fn new(engine: Arc<dyn StorageEngine>, vault: Arc<KeyVault>) -> Self {
        Self { engine, vault }
    }

    fn exists(&self, name: &str) -> Result<bool, Error> {
        Ok(!self.engine.list_collections(Some(name))?.is_empty())
    }

    /// Creates the collection for `schema` unless it already exists.
    ///
    /// # Errors
    ///
    /// Returns key vault errors from resolving data keys, or
    /// `Error::StorageUnavailable` if the engine fails.
    pub fn provision(&self, schema: &FieldEncryptionSchema) -> Result<ProvisionOutcome, Error> {
        let name = schema.collection();
        if self.exists(name)? {
            info!(collection = name, "encrypted collection already exists");
            return Ok(ProvisionOutcome::AlreadyExists);
        }

        let mut descriptor = schema.provisioning_descriptor();
        for entry in &mut descriptor.fields {
            entry.key_id = Some(self.vault.ensure_data_key(&entry.key_alt_name)?);
        }

        match self.engine.create_collection(name, Some(&descriptor)) {
            Ok(()) => {
                info!(collection = name, fields = descriptor.fields.len(), "encrypted collection created");
                Ok(ProvisionOutcome::Created(descriptor))
            }
            // Lost a race with another provisioner.
            Err(StorageError::NamespaceExists(_)) => Ok(ProvisionOutcome::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    /// Drops `name` if it exists. Returns whether a collection was dropped.
    ///
    /// # Errors
    ///
    /// Returns `Error::StorageUnavailable` if the engine fails.
    pub fn drop_if_exists(&self, name: &str) -> Result<bool, Error> {
        if !self.exists(name)? {
            return Ok(false);
        }
        warn!(collection = name, "dropping collection and all of its documents");
        match self.engine.drop_collection(name) {
            Ok(()) | Err(StorageError::NamespaceNotFound(_)) => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Provisions `schema`, first dropping the collection when
    /// `config.drop_collections` is set.
    ///
    /// # Errors
    ///
    /// See [`drop_if_exists`](Self::drop_if_exists) and
    /// [`provision`](Self::provision).
    pub fn setup(
        &self,
        schema: &FieldEncryptionSchema,
        config: &EncryptionConfig,
    ) -> Result<ProvisionOutcome, Error> {
        if config.drop_collections {
            self.drop_if_exists(schema.collection())?;
        }
        self.provision(schema)
    }
}
