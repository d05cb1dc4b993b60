//! Durable layer providers.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use pacts_core_types::{CacheEntry, CacheKey};
use parking_lot::Mutex;
use tracing::warn;

use crate::CacheError;

/// Storage behind the durable layer. Implementations must be safe to
/// share across concurrently executing runs.
pub trait DurableCacheStore: Send + Sync {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;
    fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError>;
    fn remove(&self, key: &CacheKey) -> Result<(), CacheError>;
    fn all(&self) -> Result<Vec<CacheEntry>, CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
}

/// JSON snapshot on disk; the whole map rewrites on every mutation, which
/// is fine at selector-cache sizes and keeps the file inspectable.
pub struct JsonFileStore {
    path: PathBuf,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl JsonFileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let path = path.into();
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            match serde_json::from_str::<Vec<CacheEntry>>(&raw) {
                Ok(list) => list.into_iter().map(|e| (e.key.clone(), e)).collect(),
                Err(err) => {
                    warn!(target: "pacts::cache", %err, "cache snapshot unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &HashMap<CacheKey, CacheEntry>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut list: Vec<&CacheEntry> = entries.values().collect();
        list.sort_by(|a, b| a.key.0.cmp(&b.key.0));
        let payload = serde_json::to_string_pretty(&list)?;
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

impl DurableCacheStore for JsonFileStore {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut guard = self.entries.lock();
        guard.insert(entry.key.clone(), entry);
        self.persist(&guard)
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut guard = self.entries.lock();
        if guard.remove(key).is_some() {
            self.persist(&guard)?;
        }
        Ok(())
    }

    fn all(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut guard = self.entries.lock();
        guard.clear();
        self.persist(&guard)
    }
}

/// Volatile durable layer for tests and cache-less deployments.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

impl DurableCacheStore for InMemoryStore {
    fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    fn all(&self) -> Result<Vec<CacheEntry>, CacheError> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.entries.lock().clear();
        Ok(())
    }
}
