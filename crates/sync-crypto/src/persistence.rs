use crate::error::{CryptoError, CryptoResult};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// A hierarchical string-keyed settings store, mirroring the
/// `crypto/scheme/key/<n>`-style keys this crate reads and writes.
///
/// Deliberately storage-agnostic: the crypto core is handed an
/// implementation rather than owning a database connection itself, so it
/// can share whatever settings table the rest of the client already uses.
pub trait SettingsStore: Send + Sync {
    fn get(&self, key: &str) -> CryptoResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> CryptoResult<()>;
    fn remove(&self, key: &str) -> CryptoResult<()>;
}

pub const SETTINGS_KEY_CURRENT_INDEX: &str = "crypto/localkey";
pub const SETTINGS_KEY_NEXT_INDEX: &str = "crypto/nextkey";
pub const SETTINGS_KEY_SIGN_SCHEME: &str = "crypto/scheme/signing";
pub const SETTINGS_KEY_ENCRYPTION_SCHEME: &str = "crypto/scheme/encryption";

pub fn settings_key_for_index(index: u32) -> String {
    format!("crypto/scheme/key/{index}")
}

/// On-disk store for the per-index wrapped symmetric account keys: one file
/// per index, named `key_<index>.enc`, holding the ciphertext of that key
/// wrapped under this device's own encryption public key.
pub struct KeyFileStore {
    dir: PathBuf,
}

impl KeyFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> CryptoResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, index: u32) -> PathBuf {
        self.dir.join(format!("key_{index}.enc"))
    }

    pub fn save(&self, index: u32, ciphertext: &[u8]) -> CryptoResult<()> {
        fs::write(self.path_for(index), ciphertext).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))
    }

    pub fn load(&self, index: u32) -> CryptoResult<Vec<u8>> {
        fs::read(self.path_for(index)).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))
    }

    pub fn remove(&self, index: u32) -> CryptoResult<()> {
        match fs::remove_file(self.path_for(index)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CryptoError::KeyMaterialCorrupt(e.to_string())),
        }
    }

    /// Every index with a key file currently on disk.
    pub fn indices(&self) -> CryptoResult<BTreeSet<u32>> {
        let mut found = BTreeSet::new();
        let entries = fs::read_dir(&self.dir).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))?;
            if let Some(index) = parse_index(&entry.path()) {
                found.insert(index);
            }
        }
        Ok(found)
    }
}

fn parse_index(path: &Path) -> Option<u32> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("key_")?.parse().ok()
}

/// Check that the set of on-disk key files and the set of settings-tracked
/// scheme entries agree exactly; any mismatch is a `KeyMaterialCorrupt`
/// invariant violation, never silently reconciled.
pub fn verify_consistency(files: &KeyFileStore, settings: &dyn SettingsStore, known_indices: &[u32]) -> CryptoResult<()> {
    let on_disk = files.indices()?;
    let tracked: BTreeSet<u32> = known_indices.iter().copied().collect();
    if on_disk != tracked {
        return Err(CryptoError::KeyMaterialCorrupt(format!(
            "key file set {on_disk:?} disagrees with settings-tracked index set {tracked:?}"
        )));
    }
    for index in &tracked {
        if settings.get(&settings_key_for_index(*index))?.is_none() {
            return Err(CryptoError::KeyMaterialCorrupt(format!("no scheme recorded for key index {index}")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MemorySettings(Mutex<HashMap<String, String>>);

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

    #[test]
    fn consistent_sets_pass() {
        let dir = tempfile::tempdir().unwrap();
        let files = KeyFileStore::new(dir.path()).unwrap();
        files.save(0, b"ciphertext").unwrap();
        let settings = MemorySettings(Mutex::new(HashMap::new()));
        settings.set(&settings_key_for_index(0), "chacha20poly1305").unwrap();
        assert!(verify_consistency(&files, &settings, &[0]).is_ok());
    }

    #[test]
    fn missing_file_for_tracked_index_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let files = KeyFileStore::new(dir.path()).unwrap();
        let settings = MemorySettings(Mutex::new(HashMap::new()));
        settings.set(&settings_key_for_index(0), "chacha20poly1305").unwrap();
        assert!(verify_consistency(&files, &settings, &[0]).is_err());
    }

    #[test]
    fn orphaned_file_without_settings_entry_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let files = KeyFileStore::new(dir.path()).unwrap();
        files.save(0, b"ciphertext").unwrap();
        let settings = MemorySettings(Mutex::new(HashMap::new()));
        assert!(verify_consistency(&files, &settings, &[0]).is_err());
    }
}
