//! The cryptographic state machine: a device's long-term identity key
//! pairs, its indexed table of rotating symmetric account keys, and the
//! message-level primitives (sign/verify, asymmetric and symmetric
//! authenticated encryption, CMAC, key wrap/unwrap) built on top of them.
//!
//! [`CryptoCore`] is the single owned component the rest of the client
//! talks to; it never exposes the raw key material, only operations on it.

mod account_keys;
mod asym;
mod cmac;
mod error;
mod export;
mod identity;
mod persistence;

pub use account_keys::{AccountKeyTable, SYM_SCHEME};
pub use error::{CryptoError, CryptoResult};
pub use export::{derive_export_key, rederive_export_key, EXPORT_SCHEME_PBKDF2, EXPORT_SCHEME_RANDOM};
pub use identity::{fingerprint_of, verify, CRYPT_SCHEME, SIGN_SCHEME};
pub use persistence::{settings_key_for_index, KeyFileStore, SettingsStore, SETTINGS_KEY_CURRENT_INDEX, SETTINGS_KEY_NEXT_INDEX};

use ed25519_dalek::VerifyingKey;
use identity::DeviceIdentity;
use sync_keystore::SecureStorage;
use tracing::{info, warn};
use x25519_dalek::PublicKey as XPublicKey;

const KEYSTORE_ALIAS_SIGN: &str = "device-signing-key";
const KEYSTORE_ALIAS_CRYPT: &str = "device-encryption-key";

/// The crypto core: a device identity plus its indexed account key table,
/// bound to a secure key store for the two private-key aliases and a
/// directory of per-index wrapped-key files.
pub struct CryptoCore {
    identity: DeviceIdentity,
    keys: AccountKeyTable,
    key_store: Box<dyn SecureStorage>,
    key_files: KeyFileStore,
}

impl CryptoCore {
    /// Generate a fresh device identity and persist its private keys.
    pub fn generate(
        sign_scheme: &str,
        crypt_scheme: &str,
        key_store: Box<dyn SecureStorage>,
        key_files: KeyFileStore,
    ) -> CryptoResult<Self> {
        let identity = DeviceIdentity::generate(sign_scheme, crypt_scheme)?;
        key_store.open()?;
        key_store.save(KEYSTORE_ALIAS_SIGN, &identity.signing_key_bytes())?;
        key_store.save(KEYSTORE_ALIAS_CRYPT, &identity.encryption_key_bytes())?;
        key_store.close()?;
        info!(fingerprint = %hex_fingerprint(&identity.fingerprint()), "generated new device identity");
        Ok(Self { identity, keys: AccountKeyTable::empty(), key_store, key_files })
    }

    /// Reconstruct from a key store already holding a device's private
    /// keys, rehydrating the account key table from its wrapped-key files.
    pub fn load(key_store: Box<dyn SecureStorage>, key_files: KeyFileStore, settings: &dyn SettingsStore) -> CryptoResult<Self> {
        key_store.open()?;
        let sign_bytes: [u8; 32] = key_store
            .load(KEYSTORE_ALIAS_SIGN)?
            .try_into()
            .map_err(|_| CryptoError::KeyMaterialCorrupt("signing key is not 32 bytes".to_string()))?;
        let crypt_bytes: [u8; 32] = key_store
            .load(KEYSTORE_ALIAS_CRYPT)?
            .try_into()
            .map_err(|_| CryptoError::KeyMaterialCorrupt("encryption key is not 32 bytes".to_string()))?;
        key_store.close()?;
        let identity = DeviceIdentity::from_bytes(&sign_bytes, &crypt_bytes);

        let indices = key_files.indices()?;
        let mut rows = Vec::with_capacity(indices.len());
        for index in &indices {
            let ciphertext = key_files.load(*index)?;
            let scheme = settings
                .get(&settings_key_for_index(*index))?
                .ok_or_else(|| CryptoError::KeyMaterialCorrupt(format!("no scheme recorded for key index {index}")))?;
            if scheme != SYM_SCHEME {
                return Err(CryptoError::SchemeMismatch { expected: SYM_SCHEME.to_string(), found: scheme });
            }
            let plain = asym::asym_decrypt(identity.static_secret(), &ciphertext)?;
            let key: [u8; 32] =
                plain.try_into().map_err(|_| CryptoError::KeyMaterialCorrupt("stored key is not 32 bytes".to_string()))?;
            rows.push((*index, scheme, key));
        }

        let current_index = settings
            .get(SETTINGS_KEY_CURRENT_INDEX)?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);

        persistence::verify_consistency(&key_files, settings, &indices.iter().copied().collect::<Vec<_>>())?;

        Ok(Self { identity, keys: AccountKeyTable::from_rows(current_index, rows), key_store, key_files })
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.identity.verifying_key()
    }

    pub fn public_encryption_key(&self) -> XPublicKey {
        self.identity.public_encryption_key()
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        self.identity.fingerprint()
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.identity.sign(msg)
    }

    pub fn verify(signing_pub: &[u8; 32], msg: &[u8], signature: &[u8; 64]) -> CryptoResult<()> {
        identity::verify(signing_pub, msg, signature)
    }

    pub fn asym_encrypt(peer_pub: &XPublicKey, plain: &[u8]) -> Vec<u8> {
        asym::asym_encrypt(peer_pub, plain)
    }

    pub fn asym_decrypt(&self, cipher: &[u8]) -> CryptoResult<Vec<u8>> {
        asym::asym_decrypt(self.identity.static_secret(), cipher)
    }

    pub fn sym_encrypt(&self, plain: &[u8]) -> CryptoResult<(u32, [u8; 12], Vec<u8>)> {
        self.keys.sym_encrypt(plain)
    }

    pub fn sym_decrypt(&self, key_index: u32, nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Vec<u8>> {
        self.keys.sym_decrypt(key_index, nonce, ciphertext)
    }

    pub fn cmac(&self, data: &[u8]) -> CryptoResult<[u8; 32]> {
        self.cmac_at(self.keys.current_index(), data)
    }

    pub fn cmac_at(&self, index: u32, data: &[u8]) -> CryptoResult<[u8; 32]> {
        let key = self.keys.key_bytes(index)?;
        Ok(cmac::cmac(&key, data))
    }

    pub fn verify_cmac(&self, index: u32, data: &[u8], mac: &[u8]) -> CryptoResult<bool> {
        let key = self.keys.key_bytes(index)?;
        Ok(cmac::verify(&key, data, mac))
    }

    pub fn wrap_key_for(&self, index: u32, peer_pub: &XPublicKey) -> CryptoResult<(u32, String, Vec<u8>)> {
        self.keys.wrap_key_for(index, peer_pub)
    }

    /// Install a key handed down by the server, persisting it to disk.
    pub fn unwrap_key(
        &mut self,
        index: u32,
        scheme: &str,
        ciphertext: &[u8],
        grant_initial: bool,
        settings: &dyn SettingsStore,
    ) -> CryptoResult<()> {
        self.keys.unwrap_key(self.identity.static_secret(), index, scheme, ciphertext, grant_initial)?;
        self.persist_key(index, settings)?;
        if grant_initial || index > settings.get(SETTINGS_KEY_CURRENT_INDEX)?.and_then(|s| s.parse().ok()).unwrap_or(0) {
            settings.set(SETTINGS_KEY_CURRENT_INDEX, &index.to_string())?;
        }
        Ok(())
    }

    pub fn propose_next_key(&mut self, settings: &dyn SettingsStore) -> CryptoResult<(u32, &'static str)> {
        let (index, scheme) = self.keys.propose_next_key();
        settings.set(SETTINGS_KEY_NEXT_INDEX, &index.to_string())?;
        Ok((index, scheme))
    }

    pub fn activate_next_key(&mut self, next_index: u32, settings: &dyn SettingsStore) -> CryptoResult<()> {
        self.keys.activate_next_key(next_index)?;
        self.persist_key(next_index, settings)?;
        settings.set(SETTINGS_KEY_CURRENT_INDEX, &next_index.to_string())?;
        settings.remove(SETTINGS_KEY_NEXT_INDEX)?;
        self.gc_key_files(settings)
    }

    fn persist_key(&self, index: u32, settings: &dyn SettingsStore) -> CryptoResult<()> {
        let (_, scheme, wrapped) = self.keys.wrap_key_for(index, &self.identity.public_encryption_key())?;
        self.key_files.save(index, &wrapped)?;
        settings.set(&settings_key_for_index(index), &scheme)?;
        Ok(())
    }

    fn gc_key_files(&self, settings: &dyn SettingsStore) -> CryptoResult<()> {
        let known: std::collections::BTreeSet<u32> = self.keys.known_indices().into_iter().collect();
        for on_disk in self.key_files.indices()? {
            if !known.contains(&on_disk) {
                self.key_files.remove(on_disk)?;
                settings.remove(&settings_key_for_index(on_disk))?;
                warn!(index = on_disk, "garbage-collected stale account key");
            }
        }
        Ok(())
    }

    pub fn derive_export_key(password: Option<&str>) -> (&'static str, [u8; 16], [u8; 32]) {
        export::derive_export_key(password)
    }
}

fn hex_fingerprint(fp: &[u8; 32]) -> String {
    fp.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use sync_keystore::FileStorage;

    struct MemorySettings(Mutex<HashMap<String, String>>);
    impl MemorySettings {
        fn new() -> Self {
            Self(Mutex::new(HashMap::new()))
        }
    }
    impl SettingsStore for MemorySettings {
        fn get(&self, key: &str) -> CryptoResult<Option<String>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }
        fn set(&self, key: &str, value: &str) -> CryptoResult<()> {
            self.0.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn remove(&self, key: &str) -> CryptoResult<()> {
            self.0.lock().unwrap().remove(key);
            Ok(())
        }
    }

    fn new_core(tmp: &std::path::Path) -> CryptoCore {
        let key_store = Box::new(FileStorage::new(tmp.join("keystore")).unwrap());
        let key_files = KeyFileStore::new(tmp.join("keys")).unwrap();
        CryptoCore::generate(SIGN_SCHEME, CRYPT_SCHEME, key_store, key_files).unwrap()
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let core = new_core(dir.path());
        let sig = core.sign(b"hello");
        CryptoCore::verify(core.verifying_key().as_bytes(), b"hello", &sig).unwrap();
    }

    #[test]
    fn rotation_then_sym_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = new_core(dir.path());
        let settings = MemorySettings::new();

        let (next, _scheme) = core.propose_next_key(&settings).unwrap();
        let peer_pub = core.public_encryption_key();
        let (_, _, wrapped) = core.wrap_key_for(next, &peer_pub).unwrap();
        core.activate_next_key(next, &settings).unwrap();

        // a sibling (here, ourselves) installs the same wrapped key
        core.unwrap_key(next, SYM_SCHEME, &wrapped, false, &settings).unwrap();

        let (index, nonce, ciphertext) = core.sym_encrypt(b"payload").unwrap();
        assert_eq!(core.sym_decrypt(index, &nonce, &ciphertext).unwrap(), b"payload");
    }

    #[test]
    fn reload_recovers_identity_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MemorySettings::new();
        let fingerprint;
        let key_index;
        let ciphertext_roundtrip;
        {
            let mut core = new_core(dir.path());
            fingerprint = core.fingerprint();
            let (next, _) = core.propose_next_key(&settings).unwrap();
            let peer_pub = core.public_encryption_key();
            core.wrap_key_for(next, &peer_pub).unwrap();
            core.activate_next_key(next, &settings).unwrap();
            key_index = next;
            let (idx, nonce, ct) = core.sym_encrypt(b"data").unwrap();
            ciphertext_roundtrip = (idx, nonce, ct);
        }

        let key_store = Box::new(FileStorage::new(dir.path().join("keystore")).unwrap());
        let key_files = KeyFileStore::new(dir.path().join("keys")).unwrap();
        let reloaded = CryptoCore::load(key_store, key_files, &settings).unwrap();

        assert_eq!(reloaded.fingerprint(), fingerprint);
        assert_eq!(reloaded.keys.current_index(), key_index);
        let (idx, nonce, ct) = ciphertext_roundtrip;
        assert_eq!(reloaded.sym_decrypt(idx, &nonce, &ct).unwrap(), b"data");
    }

    #[test]
    fn cmac_verifies_only_under_correct_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut core = new_core(dir.path());
        let settings = MemorySettings::new();
        let (next, _) = core.propose_next_key(&settings).unwrap();
        let peer_pub = core.public_encryption_key();
        core.wrap_key_for(next, &peer_pub).unwrap();
        core.activate_next_key(next, &settings).unwrap();

        let mac = core.cmac(b"proof").unwrap();
        assert!(core.verify_cmac(next, b"proof", &mac).unwrap());
        assert!(!core.verify_cmac(next, b"tampered", &mac).unwrap());
    }
}
