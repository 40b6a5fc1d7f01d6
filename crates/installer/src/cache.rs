//! Install metadata cache.
//!
//! One JSON file per cache key under `<install_root>/.cache/metadata/`.
//! A hit short-circuits the whole pipeline: same origin + options within
//! the TTL returns the previous record, provided its install path still
//! exists on disk. Writes are atomic (temp file + rename).

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use stevedore_domain::error::Result;
use stevedore_domain::record::ServerRecord;

use crate::origin::Origin;

/// What gets persisted per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub timestamp: DateTime<Utc>,
    pub cache_key: String,
    pub server_config: ServerRecord,
    pub install_path: PathBuf,
}

pub struct MetadataCache {
    dir: PathBuf,
    ttl: chrono::Duration,
}

impl MetadataCache {
    pub fn new(dir: impl Into<PathBuf>, ttl_days: u32) -> Self {
        Self {
            dir: dir.into(),
            ttl: chrono::Duration::days(i64::from(ttl_days)),
        }
    }

    /// Stable 16-hex-char key over the identifying inputs.
    pub fn key(origin: &Origin, options_fingerprint: &str) -> String {
        let identity = serde_json::json!({
            "type": origin.type_name(),
            "fullName": origin.full_name(),
            "version": origin.version(),
            "options": options_fingerprint,
        });
        let mut hasher = Sha256::new();
        hasher.update(identity.to_string().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..16].to_owned()
    }

    /// A usable entry: present, parseable, unexpired, and its install path
    /// still on disk.
    pub fn load(&self, key: &str) -> Option<CacheEntry> {
        let raw = std::fs::read_to_string(self.path_for(key)).ok()?;
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
        if Utc::now() - entry.timestamp > self.ttl {
            tracing::debug!(key, "cache entry expired");
            return None;
        }
        if !entry.install_path.exists() {
            tracing::debug!(key, "cache entry points at a missing install path");
            return None;
        }
        Some(entry)
    }

    pub fn store(&self, entry: &CacheEntry) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&entry.cache_key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(entry)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn invalidate(&self, key: &str) {
        let _ = std::fs::remove_file(self.path_for(key));
    }

    /// Drop every cached entry. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        if self.dir.exists() {
            for entry in std::fs::read_dir(&self.dir)? {
                let entry = entry?;
                if entry.path().extension().map_or(false, |e| e == "json") {
                    std::fs::remove_file(entry.path())?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

/// Stable fingerprint for the option fields that affect install output.
pub fn options_fingerprint(allow_high_risk: bool) -> String {
    format!("allowHighRisk={allow_high_risk}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use stevedore_domain::record::Invocation;

    fn entry(key: &str, install_path: &Path) -> CacheEntry {
        CacheEntry {
            timestamp: Utc::now(),
            cache_key: key.to_owned(),
            server_config: ServerRecord::new("s", "S", Invocation::new("node")),
            install_path: install_path.to_path_buf(),
        }
    }

    #[test]
    fn key_is_stable_and_short() {
        let origin = Origin::parse("https://github.com/a/b");
        let k1 = MetadataCache::key(&origin, "allowHighRisk=false");
        let k2 = MetadataCache::key(&origin, "allowHighRisk=false");
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 16);
        assert!(k1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn key_varies_with_inputs() {
        let a = MetadataCache::key(&Origin::parse("pkg-a"), "allowHighRisk=false");
        let b = MetadataCache::key(&Origin::parse("pkg-b"), "allowHighRisk=false");
        let c = MetadataCache::key(&Origin::parse("pkg-a"), "allowHighRisk=true");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn store_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        std::fs::create_dir_all(&install).unwrap();

        let cache = MetadataCache::new(tmp.path().join("meta"), 7);
        cache.store(&entry("abcd1234abcd1234", &install)).unwrap();
        let loaded = cache.load("abcd1234abcd1234").unwrap();
        assert_eq!(loaded.server_config.id, "s");
    }

    #[test]
    fn missing_install_path_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = MetadataCache::new(tmp.path().join("meta"), 7);
        cache
            .store(&entry("k1", &tmp.path().join("gone")))
            .unwrap();
        assert!(cache.load("k1").is_none());
    }

    #[test]
    fn expired_entry_misses() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        std::fs::create_dir_all(&install).unwrap();

        let cache = MetadataCache::new(tmp.path().join("meta"), 7);
        let mut stale = entry("k2", &install);
        stale.timestamp = Utc::now() - chrono::Duration::days(8);
        cache.store(&stale).unwrap();
        assert!(cache.load("k2").is_none());
    }

    #[test]
    fn clear_removes_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let install = tmp.path().join("install");
        std::fs::create_dir_all(&install).unwrap();

        let cache = MetadataCache::new(tmp.path().join("meta"), 7);
        cache.store(&entry("k3", &install)).unwrap();
        cache.store(&entry("k4", &install)).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.load("k3").is_none());
    }
}
