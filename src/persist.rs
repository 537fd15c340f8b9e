// SPDX-License-Identifier: Apache-2.0
//! Durable local state: last-active session id, last-seen seq per session,
//! UI preferences, and the pending-prompt map (`spec.md` §6, §9 "Global
//! state ... Specify as process-wide state with explicit `init()`/
//! `teardown()` ... persistence is an external effect whose interface is
//! `load/save(key, value)` and nothing more").

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CoreError, Result};

/// The only persistence interface the core requires: opaque key/value
/// load and save, serialized as JSON. Implementations choose the backing
/// store (a file, `localStorage`, a KV table); the core never reaches past
/// this trait.
pub trait LocalStore: Send + Sync {
    fn load_raw(&self, key: &str) -> Result<Option<String>>;
    fn save_raw(&self, key: &str, value: &str) -> Result<()>;
    fn remove_raw(&self, key: &str) -> Result<()>;
}

pub trait LocalStoreExt: LocalStore {
    fn load<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.load_raw(key)? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn save<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.save_raw(key, &raw)
    }
}

impl<T: LocalStore + ?Sized> LocalStoreExt for T {}

/// An in-memory store, useful for tests and for environments without a
/// durable filesystem (the engine degrades gracefully: pending prompts are
/// simply lost across a process restart rather than surviving it).
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, String>>,
}

impl LocalStore for MemoryStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    fn save_raw(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().unwrap().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_raw(&self, key: &str) -> Result<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }
}

/// A single-file, single-writer JSON-map store. Matches the single-writer
/// durability contract in `spec.md` §5 ("Durable pending-prompt store is
/// single-writer (the core) and tolerates read-modify-write under the
/// single-threaded model without locks") — the `Mutex` here only guards
/// against concurrent readers within this process, not genuine multi-writer
/// conflict resolution.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let cache = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };
        Ok(Self { path, cache: Mutex::new(cache) })
    }

    fn flush(&self, cache: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = Path::new(&self.path).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(cache)
            .map_err(|e| CoreError::Persistence(e.to_string()))?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}

impl LocalStore for FileStore {
    fn load_raw(&self, key: &str) -> Result<Option<String>> {
        Ok(self.cache.lock().unwrap().get(key).cloned())
    }

    fn save_raw(&self, key: &str, value: &str) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.insert(key.to_string(), value.to_string());
        self.flush(&cache)
    }

    fn remove_raw(&self, key: &str) -> Result<()> {
        let mut cache = self.cache.lock().unwrap();
        cache.remove(key);
        self.flush(&cache)
    }
}

pub const KEY_LAST_ACTIVE_SESSION: &str = "last_active_session_id";
pub const KEY_LAST_SEEN_SEQ_PREFIX: &str = "last_seen_seq:";
pub const KEY_PENDING_PROMPTS: &str = "pending_prompts";
pub const KEY_UI_PREFS: &str = "ui_prefs";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_round_trips_typed_values() {
        let store = MemoryStore::default();
        store.save("k", &42u64).unwrap();
        let v: Option<u64> = store.load("k").unwrap();
        assert_eq!(v, Some(42));
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.save("a", &"hello".to_string()).unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        let v: Option<String> = store.load("a").unwrap();
        assert_eq!(v, Some("hello".to_string()));
    }

    #[test]
    fn remove_is_idempotent() {
        let store = MemoryStore::default();
        store.remove_raw("missing").unwrap();
        store.save_raw("k", "v").unwrap();
        store.remove_raw("k").unwrap();
        store.remove_raw("k").unwrap();
        assert_eq!(store.load_raw("k").unwrap(), None);
    }
}
