//! Secret store collaborator.
//!
//! The supervisor persists the HQ tunnel token and the overlay pre-auth key
//! through this interface so they survive restarts. Each call is atomic on
//! its own; no multi-key transactions.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Key/value secret storage. Implementations must make each call atomic.
pub trait SecretStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn has(&self, key: &str) -> bool;
}

/// TOML-file-backed store. Writes go to a temp file in the same directory
/// and are renamed into place so a crash never leaves a torn file.
pub struct FileSecretStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> anyhow::Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(toml::from_str(&content)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, map: &BTreeMap<String, String>) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, toml::to_string_pretty(map)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600));
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let _guard = self.lock.lock().unwrap();
        Ok(self.read_all()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut map = self.read_all()?;
        map.insert(key.to_string(), value.to_string());
        self.write_all(&map)
    }

    fn has(&self, key: &str) -> bool {
        let _guard = self.lock.lock().unwrap();
        self.read_all()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }
}

/// In-memory store for tests and embedders that manage persistence
/// themselves.
#[derive(Default)]
pub struct MemorySecretStore {
    map: Mutex<BTreeMap<String, String>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.map.lock().unwrap().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.map
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn has(&self, key: &str) -> bool {
        self.map.lock().unwrap().contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips_and_persists() {
        let dir = std::env::temp_dir().join(format!("hq-edge-secrets-{}", std::process::id()));
        let path = dir.join("secrets.toml");
        let _ = std::fs::remove_file(&path);

        let store = FileSecretStore::new(&path);
        assert!(!store.has("tunnel.token"));
        assert_eq!(store.get("tunnel.token").unwrap(), None);

        store.set("tunnel.token", "t0k3n").unwrap();
        assert!(store.has("tunnel.token"));
        assert_eq!(store.get("tunnel.token").unwrap().as_deref(), Some("t0k3n"));

        // A fresh handle reads the same file.
        let reopened = FileSecretStore::new(&path);
        assert_eq!(reopened.get("tunnel.token").unwrap().as_deref(), Some("t0k3n"));

        store.set("tunnel.token", "rotated").unwrap();
        assert_eq!(reopened.get("tunnel.token").unwrap().as_deref(), Some("rotated"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn memory_store_round_trips() {
        let store = MemorySecretStore::new();
        assert!(!store.has("k"));
        store.set("k", "v").unwrap();
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
    }
}
