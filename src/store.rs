//! Persistent tier backends.

use crate::error::StoreError;
use crate::traits::PersistentStore;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use tracing::debug;

/// In-process store. Share one `Arc<MemoryStore>` between several coordinators to model several execution
/// contexts of the same client.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), StoreError> {
        self.entries.write().extend(entries);
        Ok(())
    }

    fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        self.entries.write().retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// A JSON object on disk. Loaded once on open, rewritten as a whole on every change.
#[derive(Debug)]
pub struct JsonFileStore {
    path:    PathBuf,
    entries: RwLock<BTreeMap<String, String>>,
}

impl JsonFileStore {
    /// Open `path`, starting empty if the file doesn't exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = Self::load(&path)?;
        debug!(path = %path.display(), entries = entries.len(), "opened persistent cache file");
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn load(path: &Path) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    /// Pick up changes written by another process.
    pub fn reload(&self) -> Result<(), StoreError> {
        let fresh = Self::load(&self.path)?;
        *self.entries.write() = fresh;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // Write to a sibling file first so that a crash never leaves a truncated cache behind.
    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PersistentStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    // Rewrites the whole file. Batch results reach here from a blocking task, never from an async worker.
    fn set_many(&self, entries: Vec<(String, String)>) -> Result<(), StoreError> {
        let mut guard = self.entries.write();
        guard.extend(entries);
        self.persist(&guard)
    }

    fn remove_prefix(&self, prefix: &str) -> Result<(), StoreError> {
        let mut guard = self.entries.write();
        guard.retain(|k, _| !k.starts_with(prefix));
        self.persist(&guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_prefix_removal() {
        let store = MemoryStore::new();
        store
            .set_many(vec![
                ("a:1".into(), "x".into()),
                ("a:2".into(), "y".into()),
                ("b:1".into(), "z".into()),
            ])
            .unwrap();
        store.remove_prefix("a:").unwrap();
        assert_eq!(store.keys(), vec!["b:1".to_string()]);
        assert_eq!(store.get("b:1").as_deref(), Some("z"));
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let store = JsonFileStore::open(&path).unwrap();
        assert!(store.get("k").is_none());
        store.set("k", "v".into()).unwrap();

        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.get("k").as_deref(), Some("v"));

        reopened.remove_prefix("k").unwrap();
        store.reload().unwrap();
        assert!(store.get("k").is_none());
    }

    #[test]
    fn json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        fs::write(&path, b"{not json").unwrap();
        assert!(matches!(JsonFileStore::open(&path), Err(StoreError::Json(_))));
    }
}
