//! Persistent key-value state
//!
//! Two durable stores back the runtime:
//! - [`KvStore`]: a JSON file holding `extension.<id>.disabled` and
//!   `extension.<id>.locked` booleans plus the `lastUpdate` timestamp.
//! - [`Memento`]: an extension-scoped (optionally workspace-scoped) view over
//!   a second store file, for arbitrary extension state surviving restarts.
//!
//! Writes are read-modify-write under an exclusive advisory lock and synced
//! before the lock is released, so concurrent writers in one process cannot
//! interleave partial documents.

use crate::error::Result;
use fs4::fs_std::FileExt;
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;

const LAST_UPDATE_KEY: &str = "lastUpdate";

/// JSON-file key-value store
#[derive(Debug, Clone)]
pub struct KvStore {
    path: PathBuf,
}

impl KvStore {
    /// Create a store backed by the given file; the file is created lazily
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the backing file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_map(&self) -> Result<Map<String, Value>> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Map::new());
        }
        let value: Value = serde_json::from_str(&content)?;
        Ok(value.as_object().cloned().unwrap_or_default())
    }

    /// Fetch a value by key
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_map()?.get(key).cloned())
    }

    /// Fetch a boolean, treating absence as false
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(self
            .get(key)?
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }

    /// Insert or replace a value under an exclusive file lock
    pub fn put(&self, key: &str, value: Value) -> Result<()> {
        self.mutate(|map| {
            map.insert(key.to_string(), value);
        })
    }

    /// Remove a key under an exclusive file lock
    pub fn remove(&self, key: &str) -> Result<()> {
        self.mutate(|map| {
            map.remove(key);
        })
    }

    fn mutate(&self, f: impl FnOnce(&mut Map<String, Value>)) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;
        file.lock_exclusive()?;

        let mut content = String::new();
        file.read_to_string(&mut content)?;
        let mut map: Map<String, Value> = if content.trim().is_empty() {
            Map::new()
        } else {
            serde_json::from_str::<Value>(&content)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default()
        };

        f(&mut map);

        let data = serde_json::to_string_pretty(&Value::Object(map))?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(data.as_bytes())?;
        file.sync_all()?;
        debug!("Persisted {:?}", self.path);
        Ok(())
        // lock released when file drops
    }

    /// Ids flagged with `extension.<id>.disabled = true`
    pub fn disabled_ids(&self) -> Result<Vec<String>> {
        self.flagged_ids("disabled")
    }

    /// Ids flagged with `extension.<id>.locked = true`
    pub fn locked_ids(&self) -> Result<Vec<String>> {
        self.flagged_ids("locked")
    }

    fn flagged_ids(&self, flag: &str) -> Result<Vec<String>> {
        let suffix = format!(".{flag}");
        Ok(self
            .read_map()?
            .iter()
            .filter(|(_, v)| v.as_bool() == Some(true))
            .filter_map(|(k, _)| {
                k.strip_prefix("extension.")
                    .and_then(|rest| rest.strip_suffix(&suffix))
            })
            .map(str::to_string)
            .collect())
    }

    /// Persist the disabled flag for an id
    pub fn set_disabled(&self, id: &str, disabled: bool) -> Result<()> {
        self.set_flag(id, "disabled", disabled)
    }

    /// Persist the locked flag for an id
    pub fn set_locked(&self, id: &str, locked: bool) -> Result<()> {
        self.set_flag(id, "locked", locked)
    }

    fn set_flag(&self, id: &str, flag: &str, value: bool) -> Result<()> {
        let key = format!("extension.{id}.{flag}");
        if value {
            self.put(&key, Value::Bool(true))
        } else {
            self.remove(&key)
        }
    }

    /// Millisecond timestamp of the last batch update, if any
    pub fn last_update(&self) -> Result<Option<i64>> {
        Ok(self.get(LAST_UPDATE_KEY)?.and_then(|v| v.as_i64()))
    }

    /// Record now as the last batch update time
    pub fn touch_last_update(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        self.put(LAST_UPDATE_KEY, Value::from(now))
    }
}

/// Extension-scoped durable state
#[derive(Debug, Clone)]
pub struct Memento {
    store: KvStore,
    prefix: String,
}

impl Memento {
    /// Scope a store to one extension id
    pub fn new(store: KvStore, id: &str) -> Self {
        Self {
            store,
            prefix: format!("{id}."),
        }
    }

    /// Scope a store to one extension id within a workspace
    pub fn workspace_scoped(store: KvStore, id: &str, workspace: &str) -> Self {
        Self {
            store,
            prefix: format!("{id}.{workspace}."),
        }
    }

    /// Read a scoped value
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        self.store.get(&format!("{}{key}", self.prefix))
    }

    /// Write a scoped value; `Value::Null` removes the key
    pub fn update(&self, key: &str, value: Value) -> Result<()> {
        let scoped = format!("{}{key}", self.prefix);
        if value.is_null() {
            self.store.remove(&scoped)
        } else {
            self.store.put(&scoped, value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> KvStore {
        KvStore::new(dir.path().join("store.json"))
    }

    #[test]
    fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.put("alpha", Value::from(1)).unwrap();
        assert_eq!(store.get("alpha").unwrap(), Some(Value::from(1)));
        assert_eq!(store.get("beta").unwrap(), None);
    }

    #[test]
    fn test_disabled_and_locked_ids() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.set_disabled("demo-ext", true).unwrap();
        store.set_locked("pinned-ext", true).unwrap();
        store.set_disabled("other-ext", true).unwrap();
        store.set_disabled("other-ext", false).unwrap();

        assert_eq!(store.disabled_ids().unwrap(), vec!["demo-ext".to_string()]);
        assert_eq!(store.locked_ids().unwrap(), vec!["pinned-ext".to_string()]);
    }

    #[test]
    fn test_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = store(&dir);
            store.set_disabled("demo-ext", true).unwrap();
            store.touch_last_update().unwrap();
        }
        let reopened = store(&dir);
        assert!(reopened.get_bool("extension.demo-ext.disabled").unwrap());
        assert!(reopened.last_update().unwrap().is_some());
    }

    #[test]
    fn test_memento_scoping() {
        let dir = TempDir::new().unwrap();
        let backing = store(&dir);
        let a = Memento::new(backing.clone(), "ext-a");
        let b = Memento::new(backing, "ext-b");

        a.update("cursor", Value::from(10)).unwrap();
        b.update("cursor", Value::from(99)).unwrap();

        assert_eq!(a.get("cursor").unwrap(), Some(Value::from(10)));
        assert_eq!(b.get("cursor").unwrap(), Some(Value::from(99)));

        a.update("cursor", Value::Null).unwrap();
        assert_eq!(a.get("cursor").unwrap(), None);
        assert_eq!(b.get("cursor").unwrap(), Some(Value::from(99)));
    }

    #[test]
    fn test_workspace_scoped_memento() {
        let dir = TempDir::new().unwrap();
        let backing = store(&dir);
        let one = Memento::workspace_scoped(backing.clone(), "ext", "ws1");
        let two = Memento::workspace_scoped(backing, "ext", "ws2");

        one.update("state", Value::from("a")).unwrap();
        assert_eq!(two.get("state").unwrap(), None);
    }
}
