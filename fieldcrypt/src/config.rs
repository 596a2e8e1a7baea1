//! Encryption settings.

use crate::error::Error;
use serde::Deserialize;
use std::path::PathBuf;

/// Default key vault namespace.
pub const DEFAULT_KEY_VAULT_NAMESPACE: &str = "encryption.__keyVault";

/// Default location of the local master key file.
pub const DEFAULT_MASTER_KEY_PATH: &str = "./local_master_key.txt";

/// Settings for key storage and provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EncryptionConfig {
    /// `<database>.<collection>` holding the key vault
    pub key_vault_namespace: String,
    /// Path of the local master key file
    pub master_key_path: PathBuf,
    /// Drop and recreate encrypted collections on setup
    pub drop_collections: bool,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_vault_namespace: DEFAULT_KEY_VAULT_NAMESPACE.to_string(),
            master_key_path: PathBuf::from(DEFAULT_MASTER_KEY_PATH),
            drop_collections: false,
        }
    }
}

impl EncryptionConfig {
    /// Splits the key vault namespace into database and collection.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidSchema` unless the namespace has the form
    /// `<database>.<collection>` with both parts non-empty.
    pub fn key_vault_parts(&self) -> Result<(&str, &str), Error> {
        match self.key_vault_namespace.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
            _ => Err(Error::InvalidSchema(format!(
                "key vault namespace '{}' must be <database>.<collection>",
                self.key_vault_namespace
            ))),
        }
    }

    /// Checks the settings.
    ///
    /// # Errors
    ///
    /// See [`key_vault_parts`](Self::key_vault_parts).
    pub fn validate(&self) -> Result<(), Error> {
        self.key_vault_parts().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EncryptionConfig::default();
        assert_eq!(config.key_vault_parts().unwrap(), ("encryption", "__keyVault"));
        assert_eq!(config.master_key_path, PathBuf::from("./local_master_key.txt"));
        assert!(!config.drop_collections);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: EncryptionConfig =
            serde_json::from_str(r#"{"keyVaultNamespace": "hr.keys", "dropCollections": true}"#)
                .unwrap();
        assert_eq!(config.key_vault_parts().unwrap(), ("hr", "keys"));
        assert!(config.drop_collections);
        assert_eq!(config.master_key_path, PathBuf::from(DEFAULT_MASTER_KEY_PATH));
    }

    #[test]
    fn test_invalid_namespace() {
        for namespace in ["keyvault", ".keys", "hr."] {
            let config = EncryptionConfig {
                key_vault_namespace: namespace.to_string(),
                ..EncryptionConfig::default()
            };
            assert!(matches!(config.validate(), Err(Error::InvalidSchema(_))), "{namespace}");
        }
    }
}
