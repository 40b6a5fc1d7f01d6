//! Host key/value persistence contract.
//!
//! The enclosing application provides an opaque store that serializes
//! JSON-like values and survives restarts. The registry mirrors its maps
//! into it under the keys `mcpServers` and `mcpServerStatus`. Two
//! implementations ship with the runtime: a JSON-file store for standalone
//! use and an in-memory store for tests.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{Error, Result};

/// Store key for the server catalog.
pub const KEY_SERVERS: &str = "mcpServers";
/// Store key for volatile status snapshots.
pub const KEY_SERVER_STATUS: &str = "mcpServerStatus";

/// Opaque key/value persistence provided by the host.
///
/// Implementations must make `set` atomic per key; readers may observe any
/// committed state.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;
    fn set(&self, key: &str, value: Value) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JsonFileStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One JSON file per key under a state directory, written atomically
/// (temp file + rename).
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        // Keys come from the runtime, not users, but refuse separators anyway.
        if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
            return Err(Error::registry(format!("invalid store key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

impl KvStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let path = self.path_for(key)?;
        let json = serde_json::to_string_pretty(&value)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        tracing::trace!(key, path = %path.display(), "store flushed");
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// MemoryStore
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory store for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.write().insert(key.to_owned(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        assert!(store.get("missing").unwrap().is_none());
        store.set("k", json!({"a": 1})).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap()["a"], 1);
    }

    #[test]
    fn file_store_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(tmp.path().join("state")).unwrap();
        assert!(store.get(KEY_SERVERS).unwrap().is_none());

        store.set(KEY_SERVERS, json!({"echo": {"id": "echo"}})).unwrap();
        let loaded = store.get(KEY_SERVERS).unwrap().unwrap();
        assert_eq!(loaded["echo"]["id"], "echo");

        // No temp file left behind.
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("state"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn file_store_rejects_path_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(tmp.path()).unwrap();
        assert!(store.set("../escape", json!(1)).is_err());
        assert!(store.get("a/b").is_err());
    }

    #[test]
    fn file_store_overwrites_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(tmp.path()).unwrap();
        store.set("k", json!(1)).unwrap();
        store.set("k", json!(2)).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap(), json!(2));
    }
}
