use crate::KeyStoreResult;

/// A backend-selectable secure storage for per-device key material.
///
/// The crypto core opens a store only for the duration of a `load`/`save`/
/// `remove` of one of the two private-key aliases a device holds, then
/// closes it promptly — `open`/`close` are explicit so a backend that needs
/// a connection (D-Bus Secret Service, a keychain session) can scope its
/// lifetime rather than holding it for the process lifetime.
pub trait SecureStorage: Send + Sync {
    /// Acquire whatever backend resources are needed. Idempotent.
    fn open(&self) -> KeyStoreResult<()>;

    /// Release backend resources. Idempotent.
    fn close(&self) -> KeyStoreResult<()>;

    fn contains(&self, alias: &str) -> KeyStoreResult<bool>;

    fn save(&self, alias: &str, bytes: &[u8]) -> KeyStoreResult<()>;

    fn load(&self, alias: &str) -> KeyStoreResult<Vec<u8>>;

    fn remove(&self, alias: &str) -> KeyStoreResult<()>;
}
