//! Content-addressable blob storage.
//!
//! Layers, image configs, manifests and indexes are stored by their SHA256
//! digest, deduplicating identical content across builds and images.
//!
//! # Layout
//!
//! ```text
//! blobs/
//! └── sha256/
//!     ├── a1/
//!     │   └── a1b2c3...  # content named by hex digest
//!     └── ...
//! ```

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Blob storage seen by the engine and the exporter.
///
/// Digests have the OCI form `sha256:<hex>`.
pub trait BlobStore: Send + Sync {
    /// Returns the blob, or `None` if it is not stored.
    fn get(&self, digest: &str) -> io::Result<Option<Vec<u8>>>;

    /// Stores `data` and returns its digest. Storing existing content is a no-op.
    fn put(&self, data: &[u8]) -> io::Result<String>;

    fn contains(&self, digest: &str) -> bool;
}

/// Computes the `sha256:<hex>` digest of `data`.
pub fn digest_of(data: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(data))
}

/// Returns the hex part of a digest, rejecting anything that is not sha256.
pub fn digest_hex(digest: &str) -> Option<&str> {
    let hex = digest.strip_prefix("sha256:")?;
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

/// Filesystem blob store.
#[derive(Debug, Clone)]
pub struct CasStore {
    /// Root directory for blob storage
    blobs_dir: PathBuf,
}

impl CasStore {
    /// Opens (creating if needed) a store under `base_dir`.
    pub fn new(base_dir: &Path) -> io::Result<Self> {
        let blobs_dir = base_dir.join("blobs").join("sha256");
        fs::create_dir_all(&blobs_dir)?;
        Ok(Self { blobs_dir })
    }

    /// Path of a stored blob, for streaming large content.
    pub fn blob_path(&self, digest: &str) -> io::Result<PathBuf> {
        let hex = digest_hex(digest)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid digest: {}", digest)))?;
        // First 2 chars as subdirectory for better filesystem performance
        Ok(self.blobs_dir.join(&hex[..2]).join(hex))
    }

    /// Digests of every stored blob.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let mut digests = Vec::new();
        for subdir in fs::read_dir(&self.blobs_dir)? {
            let subdir = subdir?;
            if !subdir.path().is_dir() {
                continue;
            }
            for blob in fs::read_dir(subdir.path())? {
                let blob = blob?;
                if let Some(hex) = blob.file_name().to_str() {
                    let digest = format!("sha256:{}", hex);
                    if digest_hex(&digest).is_some() {
                        digests.push(digest);
                    }
                }
            }
        }
        digests.sort();
        Ok(digests)
    }

    /// Removes every blob not in `referenced`. Returns the number removed.
    pub fn gc(&self, referenced: &HashSet<String>) -> io::Result<usize> {
        let mut removed = 0;
        for digest in self.list()? {
            if referenced.contains(&digest) {
                continue;
            }
            fs::remove_file(self.blob_path(&digest)?)?;
            removed += 1;
        }

        if removed > 0 {
            info!(removed, "Garbage collected unreferenced blobs");
        }
        Ok(removed)
    }
}

impl BlobStore for CasStore {
    fn get(&self, digest: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(digest)?) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, data: &[u8]) -> io::Result<String> {
        let digest = digest_of(data);
        let path = self.blob_path(&digest)?;

        if path.exists() {
            debug!(digest = %digest, "Blob already exists");
            return Ok(digest);
        }

        let dir = path.parent().unwrap_or(&self.blobs_dir);
        fs::create_dir_all(dir)?;

        // Write to a sibling temp file and rename; readers never see partial blobs.
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        file.write_all(data)?;
        file.as_file().sync_all()?;
        file.persist(&path).map_err(|e| e.error)?;

        debug!(digest = %digest, size = data.len(), "Stored new blob");
        Ok(digest)
    }

    fn contains(&self, digest: &str) -> bool {
        self.blob_path(digest).map(|p| p.exists()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_retrieve_blob() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::new(temp.path()).unwrap();

        let data = b"Hello, World!";
        let digest = store.put(data).unwrap();
        assert!(digest.starts_with("sha256:"));

        // Same data should return same digest
        assert_eq!(store.put(data).unwrap(), digest);
        assert_eq!(store.get(&digest).unwrap().as_deref(), Some(data.as_slice()));
        assert!(store.contains(&digest));
    }

    #[test]
    fn test_missing_blob_is_absent() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::new(temp.path()).unwrap();
        let missing = digest_of(b"never stored");
        assert_eq!(store.get(&missing).unwrap(), None);
        assert!(!store.contains(&missing));
        assert!(!store.contains("md5:abc"));
    }

    #[test]
    fn test_deduplication() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::new(temp.path()).unwrap();

        for _ in 0..3 {
            store.put(b"Duplicate content").unwrap();
        }
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_gc_keeps_referenced() {
        let temp = TempDir::new().unwrap();
        let store = CasStore::new(temp.path()).unwrap();

        let keep = store.put(b"keep").unwrap();
        let drop = store.put(b"drop").unwrap();

        let referenced: HashSet<String> = [keep.clone()].into_iter().collect();
        assert_eq!(store.gc(&referenced).unwrap(), 1);
        assert!(store.contains(&keep));
        assert!(!store.contains(&drop));
    }
}
