//! Blob store capability and two backends: in-memory (tests, single process)
//! and filesystem (local durable store).

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

use crate::error::{SegrepError, SegrepResult};

/// Key/value blob storage. Paths are `/`-separated keys.
#[async_trait]
pub trait BlobContainer: Send + Sync {
    /// Store `data` at `path`, replacing any existing blob.
    async fn put(&self, path: &str, data: Bytes) -> SegrepResult<()>;
    /// Fetch the blob at `path`; [`SegrepError::BlobNotFound`] if absent.
    async fn get(&self, path: &str) -> SegrepResult<Bytes>;
    /// All keys starting with `prefix`, in ascending lexicographic order.
    async fn list(&self, prefix: &str) -> SegrepResult<Vec<String>>;
    /// Delete the blob at `path`. Deleting a missing blob is not an error.
    async fn delete(&self, path: &str) -> SegrepResult<()>;

    /// True if a blob exists at `path`.
    async fn exists(&self, path: &str) -> SegrepResult<bool> {
        match self.get(path).await {
            Ok(_) => Ok(true),
            Err(SegrepError::BlobNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Operation counters for a blob store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobStoreStats {
    /// Number of put operations.
    pub puts: u64,
    /// Number of get operations.
    pub gets: u64,
    /// Number of list operations.
    pub lists: u64,
    /// Number of delete operations.
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct BlobStoreStatsInner {
    puts: AtomicU64,
    gets: AtomicU64,
    lists: AtomicU64,
    deletes: AtomicU64,
}

impl BlobStoreStatsInner {
    fn snapshot(&self) -> BlobStoreStats {
        BlobStoreStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            lists: self.lists.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }
}

/// Concurrent in-memory blob store.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: DashMap<String, Bytes>,
    stats: BlobStoreStatsInner,
}

impl InMemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn blob_count(&self) -> usize {
        self.blobs.len()
    }

    /// Snapshot of operation counters.
    pub fn stats(&self) -> BlobStoreStats {
        self.stats.snapshot()
    }

    /// Overwrite a blob in place without counting it; used to simulate
    /// corruption in tests.
    pub fn tamper(&self, path: &str, data: Bytes) {
        self.blobs.insert(path.to_string(), data);
    }
}

#[async_trait]
impl BlobContainer for InMemoryBlobStore {
    async fn put(&self, path: &str, data: Bytes) -> SegrepResult<()> {
        self.stats.puts.fetch_add(1, Ordering::Relaxed);
        debug!(path, size = data.len(), "blob put");
        self.blobs.insert(path.to_string(), data);
        Ok(())
    }

    async fn get(&self, path: &str) -> SegrepResult<Bytes> {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        self.blobs
            .get(path)
            .map(|b| b.value().clone())
            .ok_or_else(|| SegrepError::BlobNotFound {
                path: path.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> SegrepResult<Vec<String>> {
        self.stats.lists.fetch_add(1, Ordering::Relaxed);
        let mut keys: Vec<String> = self
            .blobs
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, path: &str) -> SegrepResult<()> {
        self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        debug!(path, "blob delete");
        self.blobs.remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> SegrepResult<bool> {
        Ok(self.blobs.contains_key(path))
    }
}

/// Blob store rooted at a filesystem directory; key segments map to
/// subdirectories.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Create a store rooted at `root` (created lazily on first put).
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> SegrepResult<PathBuf> {
        let mut resolved = self.root.clone();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(SegrepError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("invalid blob path [{}]", path),
                )));
            }
            resolved.push(part);
        }
        Ok(resolved)
    }
}

#[async_trait]
impl BlobContainer for FsBlobStore {
    async fn put(&self, path: &str, data: Bytes) -> SegrepResult<()> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // write-then-rename so readers never observe a partial blob
        let tmp = target.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &target).await?;
        debug!(path, size = data.len(), "fs blob put");
        Ok(())
    }

    async fn get(&self, path: &str) -> SegrepResult<Bytes> {
        let target = self.resolve(path)?;
        match tokio::fs::read(&target).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(SegrepError::BlobNotFound {
                path: path.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> SegrepResult<Vec<String>> {
        let (dir_part, name_prefix) = match prefix.rfind('/') {
            Some(idx) => (&prefix[..idx], &prefix[idx + 1..]),
            None => ("", prefix),
        };
        let dir = self.resolve(dir_part)?;
        let mut keys = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(keys),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(name_prefix) && !name.contains(".tmp-") {
                if dir_part.is_empty() {
                    keys.push(name);
                } else {
                    keys.push(format!("{}/{}", dir_part, name));
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, path: &str) -> SegrepResult<()> {
        let target = self.resolve(path)?;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn BlobContainer) {
        store.put("a/b/meta__2", Bytes::from_static(b"two")).await.unwrap();
        store.put("a/b/meta__1", Bytes::from_static(b"one")).await.unwrap();
        store.put("a/b/data_x", Bytes::from_static(b"x")).await.unwrap();
        store.put("a/c/meta__0", Bytes::from_static(b"zero")).await.unwrap();

        assert_eq!(&store.get("a/b/meta__1").await.unwrap()[..], b"one");
        assert_eq!(
            store.list("a/b/meta__").await.unwrap(),
            vec!["a/b/meta__1".to_string(), "a/b/meta__2".to_string()]
        );
        assert!(store.exists("a/b/data_x").await.unwrap());

        store.delete("a/b/data_x").await.unwrap();
        store.delete("a/b/data_x").await.unwrap();
        assert!(!store.exists("a/b/data_x").await.unwrap());
        assert!(matches!(
            store.get("a/b/data_x").await,
            Err(SegrepError::BlobNotFound { .. })
        ));
        assert!(store.list("missing/dir/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        let store = InMemoryBlobStore::new();
        exercise(&store).await;
        assert_eq!(store.blob_count(), 3);
        let stats = store.stats();
        assert_eq!(stats.puts, 4);
        assert_eq!(stats.deletes, 2);
    }

    #[tokio::test]
    async fn test_fs_store() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(tmp.path());
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_fs_store_rejects_traversal() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(tmp.path());
        assert!(store.put("../x", Bytes::new()).await.is_err());
    }
}
