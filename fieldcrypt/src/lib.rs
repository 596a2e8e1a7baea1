//! # `fieldcrypt`
//!
//! Client-side field-level encryption for document stores, with queryable
//! tokens for equality and range predicates.
//!
//! ## Features
//!
//! - Envelope encryption: per-field data keys wrapped by a master key
//! - Deterministic encryption (AES-SIV) for equality queries
//! - Range-searchable tokens built from blinded dyadic edges
//! - Key vault with alias lookup and idempotent key creation
//! - Predicate translation so the store never sees plaintext
//! - Encrypted collection provisioning
//!
//! ## Example
//!
//! ```rust,ignore
//! use fieldcrypt::prelude::*;
//!
//! let engine = Arc::new(MemoryEngine::new());
//! let provider = Arc::new(LocalKeyProvider::new(&MasterKey::generate())?);
//! let vault = Arc::new(KeyVault::open(engine.collection("encryption.__keyVault")?, provider)?);
//!
//! let schema = Arc::new(FieldEncryptionSchema::new("employees", vec![
//!     FieldSpec::equality("name", PlaintextType::String),
//!     FieldSpec::range("salary", PlaintextType::Long, 0, 10_000_000, 1),
//! ])?);
//! EncryptedCollectionProvisioner::new(engine.clone(), vault.clone()).provision(&schema)?;
//!
//! let employees = EncryptedCollection::open(engine.as_ref(), schema, vault)?;
//! let matches = employees.find(&Predicate::between("salary", 60_000, 80_000))?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod blind_index;
pub mod codec;
pub mod collection;
pub mod config;
pub mod context;
pub mod deterministic;
pub mod document;
pub mod error;
pub mod kdf;
pub mod key_provider;
pub mod provision;
pub mod query;
pub mod range;
pub mod schema;
pub mod storage;
pub mod token;
pub mod vault;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::collection::EncryptedCollection;
    pub use crate::config::EncryptionConfig;
    pub use crate::context::EncryptionContext;
    pub use crate::document::Document;
    pub use crate::error::{Error, KeyProviderError, StorageError};
    pub use crate::key_provider::{KeyProvider, LocalKeyProvider, MasterKey, MasterKeySource};
    pub use crate::provision::{EncryptedCollectionProvisioner, ProvisionOutcome};
    pub use crate::query::{Predicate, QueryTranslator};
    pub use crate::schema::{FieldEncryptionSchema, FieldSpec, PlaintextType, QueryCapability};
    pub use crate::storage::{DocumentCollection, MemoryEngine, StorageEngine, StorageQuery};
    pub use crate::token::EncryptedToken;
    pub use crate::vault::{KeyId, KeyVault};
    pub use std::sync::Arc;
}
