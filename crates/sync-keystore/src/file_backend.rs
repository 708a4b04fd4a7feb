use crate::{KeyStoreError, KeyStoreResult, SecureStorage};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSON-on-disk fallback storage for platforms without a usable keyring
/// (headless servers, CI). Each alias is one file, written with `0600`
/// permissions on unix.
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>) -> KeyStoreResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, alias: &str) -> PathBuf {
        self.dir.join(format!("{alias}.key"))
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &Path) -> KeyStoreResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o600);
        fs::set_permissions(path, perms)?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_path: &Path) -> KeyStoreResult<()> {
        Ok(())
    }
}

impl SecureStorage for FileStorage {
    fn open(&self) -> KeyStoreResult<()> {
        Ok(())
    }

    fn close(&self) -> KeyStoreResult<()> {
        Ok(())
    }

    fn contains(&self, alias: &str) -> KeyStoreResult<bool> {
        Ok(self.path_for(alias).exists())
    }

    fn save(&self, alias: &str, bytes: &[u8]) -> KeyStoreResult<()> {
        let path = self.path_for(alias);
        debug!(path = %path.display(), "saving key material to file store");
        fs::write(&path, bytes)?;
        Self::restrict_permissions(&path)?;
        Ok(())
    }

    fn load(&self, alias: &str) -> KeyStoreResult<Vec<u8>> {
        let path = self.path_for(alias);
        fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KeyStoreError::NotFound(alias.to_string()),
            _ => KeyStoreError::Io(e),
        })
    }

    fn remove(&self, alias: &str) -> KeyStoreResult<()> {
        let path = self.path_for(alias);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KeyStoreError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_saved_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::new(dir.path()).unwrap();
        assert!(!store.contains("device-sign").unwrap());

        store.save("device-sign", b"secret-bytes").unwrap();
        assert!(store.contains("device-sign").unwrap());
        assert_eq!(store.load("device-sign").unwrap(), b"secret-bytes");

        store.remove("device-sign").unwrap();
        assert!(!store.contains("device-sign").unwrap());
    }

    #[test]
    fn loading_missing_alias_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::new(dir.path()).unwrap();
        assert!(matches!(store.load("missing"), Err(KeyStoreError::NotFound(_))));
    }

    #[cfg(unix)]
    #[test]
    fn saved_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileStorage::new(dir.path()).unwrap();
        store.save("device-crypt", b"bytes").unwrap();
        let mode = fs::metadata(store.path_for("device-crypt")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
