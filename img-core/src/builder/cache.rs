//! Build cache.
//!
//! Maps node cache keys to the layer the node produced. Layers live in the
//! blob store; the cache only keeps small JSON entries, one per key:
//!
//! ```text
//! cache/
//! ├── <key>.json
//! └── ...
//! ```

use crate::builder::image::LayerRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Default cache size limit: 50GB
pub const DEFAULT_CACHE_SIZE_LIMIT: u64 = 50 * 1024 * 1024 * 1024;

/// Cache key of a node for one platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    /// Derives the key of a node.
    ///
    /// `identity` covers the operation and its ancestry. Platform-dependent
    /// nodes mix in the platform; `inputs` carries the keys of the input
    /// nodes and `extra` anything only known at run time (context digest,
    /// resolved base image).
    pub fn compute(identity: &str, platform: Option<&str>, inputs: &[&CacheKey], extra: Option<&str>) -> Self {
        if platform.is_none() && inputs.is_empty() && extra.is_none() {
            return Self(identity.to_string());
        }

        let mut hasher = Sha256::new();
        hasher.update(identity.as_bytes());
        if let Some(platform) = platform {
            hasher.update(b"\0platform\0");
            hasher.update(platform.as_bytes());
        }
        for input in inputs {
            hasher.update(b"\0input\0");
            hasher.update(input.0.as_bytes());
        }
        if let Some(extra) = extra {
            hasher.update(b"\0extra\0");
            hasher.update(extra.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached node result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Layer produced by the node.
    pub layer: LayerRef,
    /// Build step description (for debugging)
    pub description: String,
    pub platform: String,
    pub created_at: i64,
    /// Last time this entry was hit (for LRU)
    pub last_accessed: i64,
}

/// Result of a cache lookup.
#[derive(Debug)]
pub enum CacheLookupResult {
    Hit(CacheEntry),
    Miss,
}

/// Error type for cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to serialize/deserialize cache entry: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Cache directory not accessible: {0}")]
    CacheDirectoryError(String),
}

/// Manages cache entries on disk. Safe to share between concurrent builds.
#[derive(Debug)]
pub struct CacheManager {
    cache_dir: PathBuf,
    size_limit: u64,
}

impl CacheManager {
    pub fn new(cache_dir: PathBuf, size_limit: u64) -> Result<Self, CacheError> {
        fs::create_dir_all(&cache_dir).map_err(|e| {
            CacheError::CacheDirectoryError(format!("Failed to create {}: {}", cache_dir.display(), e))
        })?;

        Ok(Self { cache_dir, size_limit })
    }

    /// Looks up an entry by key, refreshing its access time on a hit.
    pub fn lookup(&self, key: &CacheKey) -> Result<CacheLookupResult, CacheError> {
        Self::validate(key)?;
        let path = self.entry_path(key);

        let mut entry = match fs::read_to_string(&path) {
            Ok(json) => match serde_json::from_str::<CacheEntry>(&json) {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(key = %key.short(), error = %e, "Ignoring corrupt cache entry");
                    return Ok(CacheLookupResult::Miss);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(key = %key.short(), "Cache miss");
                return Ok(CacheLookupResult::Miss);
            }
            Err(e) => return Err(e.into()),
        };

        entry.last_accessed = chrono::Utc::now().timestamp();
        // Access time is advisory; a failed refresh does not turn a hit into an error.
        if let Err(e) = self.write_entry(&entry, true) {
            debug!(key = %key.short(), error = %e, "Failed to refresh cache entry");
        }

        debug!(key = %key.short(), step = %entry.description, "Cache hit");
        Ok(CacheLookupResult::Hit(entry))
    }

    /// Records the layer produced for `key`.
    ///
    /// Returns false if another writer recorded the key first; the existing
    /// entry is kept.
    pub fn insert(&self, key: &CacheKey, layer: LayerRef, description: String, platform: &str) -> Result<bool, CacheError> {
        Self::validate(key)?;

        let now = chrono::Utc::now().timestamp();
        let entry = CacheEntry {
            key: key.clone(),
            layer,
            description,
            platform: platform.to_string(),
            created_at: now,
            last_accessed: now,
        };

        let inserted = self.write_entry(&entry, false)?;
        if inserted {
            debug!(key = %key.short(), size = entry.layer.size, step = %entry.description, "Cached layer");
            self.evict_if_needed()?;
        } else {
            debug!(key = %key.short(), "Cache entry already written by a concurrent build");
        }
        Ok(inserted)
    }

    /// Writes an entry through a temp file. Without `overwrite`, an existing
    /// entry wins and false is returned.
    fn write_entry(&self, entry: &CacheEntry, overwrite: bool) -> Result<bool, CacheError> {
        let path = self.entry_path(&entry.key);
        let mut file = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        file.write_all(&serde_json::to_vec_pretty(entry)?)?;

        if overwrite {
            file.persist(&path).map_err(|e| e.error)?;
            return Ok(true);
        }

        match file.persist_noclobber(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.error.into()),
        }
    }

    /// Removes one entry.
    pub fn remove(&self, key: &CacheKey) -> Result<(), CacheError> {
        match fs::remove_file(self.entry_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// All readable entries, oldest access first.
    pub fn entries(&self) -> Result<Vec<CacheEntry>, CacheError> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.cache_dir)? {
            let path = dir_entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(json) = fs::read_to_string(&path) {
                    if let Ok(entry) = serde_json::from_str::<CacheEntry>(&json) {
                        entries.push(entry);
                    }
                }
            }
        }
        entries.sort_by_key(|e| e.last_accessed);
        Ok(entries)
    }

    /// Clears all cache entries. Returns the number removed.
    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.cache_dir)? {
            let path = dir_entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
                removed += 1;
            }
        }
        info!(removed, "Cleared build cache");
        Ok(removed)
    }

    /// Evicts least recently used entries while over the size limit.
    fn evict_if_needed(&self) -> Result<(), CacheError> {
        let entries = self.entries()?;
        let mut current: u64 = entries.iter().map(|e| e.layer.size).sum();
        if current <= self.size_limit {
            return Ok(());
        }

        warn!(size = current, limit = self.size_limit, "Cache exceeds size limit, evicting old entries");

        for entry in entries {
            if current <= self.size_limit {
                break;
            }
            debug!(key = %entry.key.short(), size = entry.layer.size, "Evicting cache entry");
            self.remove(&entry.key)?;
            current = current.saturating_sub(entry.layer.size);
        }

        Ok(())
    }

    fn validate(key: &CacheKey) -> Result<(), CacheError> {
        if key.0.len() != 64 || !key.0.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidKey(key.0.clone()));
        }
        Ok(())
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.json", key.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(seed: &str) -> CacheKey {
        CacheKey::compute(&format!("{:x}", Sha256::digest(seed.as_bytes())), None, &[], None)
    }

    fn layer(size: u64) -> LayerRef {
        LayerRef { digest: format!("sha256:{:064x}", size), size }
    }

    fn manager(dir: &TempDir, limit: u64) -> CacheManager {
        CacheManager::new(dir.path().join("cache"), limit).unwrap()
    }

    #[test]
    fn test_miss_then_hit() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, DEFAULT_CACHE_SIZE_LIMIT);
        let k = key("a");

        assert!(matches!(cache.lookup(&k).unwrap(), CacheLookupResult::Miss));
        assert!(cache.insert(&k, layer(10), "RUN a".into(), "linux/amd64").unwrap());

        match cache.lookup(&k).unwrap() {
            CacheLookupResult::Hit(entry) => {
                assert_eq!(entry.layer, layer(10));
                assert_eq!(entry.description, "RUN a");
            }
            CacheLookupResult::Miss => panic!("expected hit"),
        }
    }

    #[test]
    fn test_second_writer_is_discarded() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, DEFAULT_CACHE_SIZE_LIMIT);
        let k = key("same");

        assert!(cache.insert(&k, layer(1), "first".into(), "linux/amd64").unwrap());
        assert!(!cache.insert(&k, layer(2), "second".into(), "linux/amd64").unwrap());

        let CacheLookupResult::Hit(entry) = cache.lookup(&k).unwrap() else {
            panic!("expected hit");
        };
        assert_eq!(entry.description, "first");
    }

    #[test]
    fn test_invalid_key() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, DEFAULT_CACHE_SIZE_LIMIT);
        let bad = CacheKey("../escape".into());
        assert!(matches!(cache.lookup(&bad), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_lru_eviction() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, 150);

        cache.insert(&key("old"), layer(100), "old".into(), "p").unwrap();
        // Make the first entry strictly older.
        let mut old = cache.entries().unwrap().remove(0);
        old.last_accessed -= 100;
        cache.write_entry(&old, true).unwrap();

        cache.insert(&key("new"), layer(100), "new".into(), "p").unwrap();

        let remaining = cache.entries().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].description, "new");
    }

    #[test]
    fn test_key_mixing() {
        let identity = format!("{:x}", Sha256::digest(b"node"));
        let plain = CacheKey::compute(&identity, None, &[], None);
        assert_eq!(plain.as_str(), identity);

        let amd = CacheKey::compute(&identity, Some("linux/amd64"), &[], None);
        let arm = CacheKey::compute(&identity, Some("linux/arm64"), &[], None);
        assert_ne!(amd, arm);
        assert_ne!(amd, plain);

        let ctx1 = CacheKey::compute(&identity, None, &[&plain], Some("ctx1"));
        let ctx2 = CacheKey::compute(&identity, None, &[&plain], Some("ctx2"));
        assert_ne!(ctx1, ctx2);
        assert_eq!(ctx1, CacheKey::compute(&identity, None, &[&plain], Some("ctx1")));
    }

    #[test]
    fn test_clear() {
        let dir = TempDir::new().unwrap();
        let cache = manager(&dir, DEFAULT_CACHE_SIZE_LIMIT);
        cache.insert(&key("a"), layer(1), "a".into(), "p").unwrap();
        cache.insert(&key("b"), layer(1), "b".into(), "p").unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.entries().unwrap().is_empty());
    }
}
