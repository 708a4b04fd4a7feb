use crate::{KeyStoreError, KeyStoreResult, SecureStorage};
use keyring::Entry;
use tracing::debug;

/// Cross-platform keyring-backed storage: macOS Keychain, Windows
/// Credential Manager, or the Linux Secret Service, selected automatically
/// by the `keyring` crate per platform.
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, alias: &str) -> KeyStoreResult<Entry> {
        Entry::new(&self.service, alias).map_err(|e| KeyStoreError::Backend(e.to_string()))
    }
}

impl SecureStorage for KeyringStorage {
    fn open(&self) -> KeyStoreResult<()> {
        Ok(())
    }

    fn close(&self) -> KeyStoreResult<()> {
        Ok(())
    }

    fn contains(&self, alias: &str) -> KeyStoreResult<bool> {
        match self.entry(alias)?.get_secret() {
            Ok(_) => Ok(true),
            Err(keyring::Error::NoEntry) => Ok(false),
            Err(e) => Err(KeyStoreError::Backend(e.to_string())),
        }
    }

    fn save(&self, alias: &str, bytes: &[u8]) -> KeyStoreResult<()> {
        debug!(service = %self.service, alias, "saving key material to keyring");
        self.entry(alias)?
            .set_secret(bytes)
            .map_err(|e| KeyStoreError::Backend(e.to_string()))
    }

    fn load(&self, alias: &str) -> KeyStoreResult<Vec<u8>> {
        self.entry(alias)?.get_secret().map_err(|e| match e {
            keyring::Error::NoEntry => KeyStoreError::NotFound(alias.to_string()),
            other => KeyStoreError::Backend(other.to_string()),
        })
    }

    fn remove(&self, alias: &str) -> KeyStoreResult<()> {
        debug!(service = %self.service, alias, "removing key material from keyring");
        match self.entry(alias)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(KeyStoreError::Backend(e.to_string())),
        }
    }
}
