//! Persistence backends for settings collections.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{ModuleError, Result};
use crate::settings::CollectionSnapshot;

/// Loads and saves settings collections by name.
pub trait SettingsStore: Send + Sync {
    /// Load a collection. `Ok(None)` if it was never saved.
    fn load(&self, collection: &str) -> Result<Option<CollectionSnapshot>>;

    /// Save a collection, replacing any previous state.
    fn save(&self, collection: &str, snapshot: &CollectionSnapshot) -> Result<()>;
}

/// Stores each collection as `<dir>/<collection>.json`.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    dir: PathBuf,
}

impl JsonSettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        let file: String = collection
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", file))
    }
}

impl SettingsStore for JsonSettingsStore {
    fn load(&self, collection: &str) -> Result<Option<CollectionSnapshot>> {
        let path = self.path_for(collection);
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(&path)?;
        match serde_json::from_str(&contents) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                // A corrupt file must not keep the module from loading
                tracing::warn!("Discarding unreadable settings file {:?}: {}", path, e);
                Ok(None)
            }
        }
    }

    fn save(&self, collection: &str, snapshot: &CollectionSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            ModuleError::Store(format!(
                "Failed to create settings directory {:?}: {}",
                self.dir, e
            ))
        })?;

        let contents = serde_json::to_string_pretty(snapshot)?;
        let path = self.path_for(collection);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Keeps collections in memory. Useful for tests and hosts without a disk.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    collections: RwLock<HashMap<String, CollectionSnapshot>>,
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self, collection: &str) -> Result<Option<CollectionSnapshot>> {
        let collections = self
            .collections
            .read()
            .map_err(|_| ModuleError::Store("Lock poisoned".into()))?;
        Ok(collections.get(collection).cloned())
    }

    fn save(&self, collection: &str, snapshot: &CollectionSnapshot) -> Result<()> {
        let mut collections = self
            .collections
            .write()
            .map_err(|_| ModuleError::Store("Lock poisoned".into()))?;
        collections.insert(collection.to_string(), snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{PersistedSetting, SettingMetadata, SettingValue};
    use tempfile::TempDir;

    fn sample() -> CollectionSnapshot {
        let mut snapshot = CollectionSnapshot::default();
        snapshot.entries.insert(
            "bool example".into(),
            PersistedSetting {
                value: SettingValue::Bool(false),
                default: SettingValue::Bool(true),
                metadata: SettingMetadata::new("Flag", "A checkbox"),
            },
        );
        let mut hidden = CollectionSnapshot {
            hidden: true,
            ..Default::default()
        };
        hidden.entries.insert(
            "window x".into(),
            PersistedSetting {
                value: SettingValue::Int(120),
                default: SettingValue::Int(50),
                metadata: SettingMetadata::default(),
            },
        );
        snapshot.subcollections.insert("internal".into(), hidden);
        snapshot
    }

    #[test]
    fn test_json_store_persistence() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("settings");

        {
            let store = JsonSettingsStore::new(&dir);
            assert!(store.load("example").unwrap().is_none());
            store.save("example", &sample()).unwrap();
        }

        let store = JsonSettingsStore::new(&dir);
        assert_eq!(store.load("example").unwrap(), Some(sample()));
        assert!(dir.join("example.json").exists());
    }

    #[test]
    fn test_json_store_sanitizes_names() {
        let temp = TempDir::new().unwrap();
        let store = JsonSettingsStore::new(temp.path());

        store.save("vendor/module name", &sample()).unwrap();
        assert!(temp.path().join("vendor_module_name.json").exists());
        assert!(store.load("vendor/module name").unwrap().is_some());
    }

    #[test]
    fn test_json_store_ignores_corrupt_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("example.json"), "{ not json").unwrap();

        let store = JsonSettingsStore::new(temp.path());
        assert!(store.load("example").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        let store = MemorySettingsStore::new();
        store.save("a", &sample()).unwrap();

        assert_eq!(store.load("a").unwrap(), Some(sample()));
        assert!(store.load("b").unwrap().is_none());
    }
}
