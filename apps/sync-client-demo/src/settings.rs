//! Tiny JSON-file-backed `SettingsStore`, standing in for whatever settings
//! table a real host app already has — this demo has none of its own, so it
//! keeps one file next to the device's key material.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use sync_crypto::{CryptoError, CryptoResult, SettingsStore};

pub struct FileSettingsStore {
    path: PathBuf,
    cache: Mutex<BTreeMap<String, String>>,
}

impl FileSettingsStore {
    pub fn open(path: PathBuf) -> CryptoResult<Self> {
        let cache = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    fn persist(&self, cache: &BTreeMap<String, String>) -> CryptoResult<()> {
        let raw = serde_json::to_string_pretty(cache).expect("settings map serializes");
        fs::write(&self.path, raw).map_err(|e| CryptoError::KeyMaterialCorrupt(e.to_string()))
    }
}

impl SettingsStore for FileSettingsStore {
    fn get(&self, key: &str) -> CryptoResult<Option<String>> {
        Ok(self.cache.lock().expect("lock poisoned").get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> CryptoResult<()> {
        let mut cache = self.cache.lock().expect("lock poisoned");
        cache.insert(key.to_string(), value.to_string());
        self.persist(&cache)
    }

    fn remove(&self, key: &str) -> CryptoResult<()> {
        let mut cache = self.cache.lock().expect("lock poisoned");
        cache.remove(key);
        self.persist(&cache)
    }
}
