//! Advisory, shared locks over remote segment generations.
//!
//! A lock is an empty marker blob named after `(generation, owner)`. Any
//! number of owners may hold the same generation; while at least one marker
//! exists, no blob referenced by that generation may be deleted.

use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{SegrepError, SegrepResult};
use crate::remote::blob::BlobContainer;
use crate::remote::path::{file_name, DataCategory, DataType, RemoteShardPath};
use crate::remote::repository::RepositoryRegistry;

const LOCK_PREFIX: &str = "lock__";
const LOCK_SEPARATOR: &str = "___";
const LOCK_SUFFIX: &str = "v2_lock";

/// Marker name for `(generation, owner)`.
pub fn lock_file_name(generation: u64, owner: &str) -> String {
    format!(
        "{LOCK_PREFIX}{:020}{LOCK_SEPARATOR}{}{LOCK_SEPARATOR}{LOCK_SUFFIX}",
        generation, owner
    )
}

/// Parse a marker name back into `(generation, owner)`.
pub fn parse_lock_file_name(name: &str) -> SegrepResult<(u64, String)> {
    let invalid = || SegrepError::corrupt(format!("invalid lock file name [{}]", name));
    let rest = name.strip_prefix(LOCK_PREFIX).ok_or_else(invalid)?;
    let parts: Vec<&str> = rest.split(LOCK_SEPARATOR).collect();
    if parts.len() != 3 || parts[2] != LOCK_SUFFIX || parts[1].is_empty() {
        return Err(invalid());
    }
    let generation = parts[0].parse().map_err(|_| invalid())?;
    Ok((generation, parts[1].to_string()))
}

fn validate_owner(owner: &str) -> SegrepResult<()> {
    if owner.is_empty() || owner.contains(LOCK_SEPARATOR) || owner.contains('/') {
        return Err(SegrepError::Config {
            reason: format!("invalid lock owner id [{}]", owner),
        });
    }
    Ok(())
}

/// Lock store for one shard's remote segments.
pub struct RemoteStoreLockManager {
    container: Arc<dyn BlobContainer>,
    lock_dir: String,
}

impl RemoteStoreLockManager {
    /// Create a lock manager storing markers under `shard_path`.
    pub fn new(container: Arc<dyn BlobContainer>, shard_path: &RemoteShardPath) -> Self {
        Self {
            container,
            lock_dir: shard_path.prefix(DataCategory::Segments, DataType::LockFiles),
        }
    }

    fn lock_path(&self, generation: u64, owner: &str) -> String {
        format!("{}{}", self.lock_dir, lock_file_name(generation, owner))
    }

    /// Record that `owner` holds `generation`. Re-acquiring is a no-op.
    pub async fn acquire(&self, generation: u64, owner: &str) -> SegrepResult<()> {
        validate_owner(owner)?;
        let path = self.lock_path(generation, owner);
        if self.container.exists(&path).await? {
            debug!(generation, owner, "lock already held");
            return Ok(());
        }
        self.container.put(&path, Bytes::new()).await?;
        info!(generation, owner, "acquired remote store lock");
        Ok(())
    }

    /// Remove `owner`'s marker on `generation`.
    ///
    /// Fails with [`SegrepError::LockNotFound`] if the marker does not exist.
    pub async fn release(&self, generation: u64, owner: &str) -> SegrepResult<()> {
        validate_owner(owner)?;
        let path = self.lock_path(generation, owner);
        if !self.container.exists(&path).await? {
            return Err(SegrepError::LockNotFound {
                generation,
                owner: owner.to_string(),
            });
        }
        self.container.delete(&path).await?;
        info!(generation, owner, "released remote store lock");
        Ok(())
    }

    /// True if any owner holds `generation`.
    pub async fn is_acquired(&self, generation: u64) -> SegrepResult<bool> {
        Ok(!self.fetch_lock_owners(generation).await?.is_empty())
    }

    /// Owners holding `generation`, sorted.
    pub async fn fetch_lock_owners(&self, generation: u64) -> SegrepResult<Vec<String>> {
        let prefix = format!("{}{LOCK_PREFIX}{:020}{LOCK_SEPARATOR}", self.lock_dir, generation);
        let mut owners = Vec::new();
        for key in self.container.list(&prefix).await? {
            let (gen, owner) = parse_lock_file_name(file_name(&key))?;
            if gen == generation {
                owners.push(owner);
            }
        }
        Ok(owners)
    }

    /// Every locked generation with its owners.
    pub async fn locked_generations(&self) -> SegrepResult<BTreeMap<u64, BTreeSet<String>>> {
        let mut locked: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
        for key in self.container.list(&self.lock_dir).await? {
            match parse_lock_file_name(file_name(&key)) {
                Ok((generation, owner)) => {
                    locked.entry(generation).or_default().insert(owner);
                }
                Err(_) => warn!(key = %key, "ignoring unrecognised blob in lock directory"),
            }
        }
        Ok(locked)
    }

    /// Acquire and return a guard that releases on [`LockGuard::release`] or drop.
    pub async fn acquire_scoped(self: &Arc<Self>, generation: u64, owner: &str) -> SegrepResult<LockGuard> {
        self.acquire(generation, owner).await?;
        Ok(LockGuard {
            manager: Arc::clone(self),
            generation,
            owner: owner.to_string(),
            released: false,
        })
    }
}

impl std::fmt::Debug for RemoteStoreLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStoreLockManager")
            .field("lock_dir", &self.lock_dir)
            .finish()
    }
}

/// A held lock. Dropping it unreleased schedules the release on the current
/// tokio runtime; a missing marker on that path is only logged.
#[derive(Debug)]
pub struct LockGuard {
    manager: Arc<RemoteStoreLockManager>,
    generation: u64,
    owner: String,
    released: bool,
}

impl LockGuard {
    /// Locked generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lock owner.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Release now, surfacing any error.
    pub async fn release(mut self) -> SegrepResult<()> {
        self.released = true;
        self.manager.release(self.generation, &self.owner).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let manager = Arc::clone(&self.manager);
        let generation = self.generation;
        let owner = std::mem::take(&mut self.owner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match manager.release(generation, &owner).await {
                        Ok(()) => {}
                        Err(SegrepError::LockNotFound { .. }) => {
                            warn!(generation, owner = %owner, "lock already released");
                        }
                        Err(e) => {
                            warn!(generation, owner = %owner, error = %e, "failed to release lock on drop");
                        }
                    }
                });
            }
            Err(_) => {
                warn!(generation, owner = %owner, "no runtime to release lock; marker left behind");
            }
        }
    }
}

/// Builds lock managers for shards whose remote store lives in a named
/// repository.
#[derive(Debug, Clone)]
pub struct LockManagerFactory {
    repositories: Arc<RepositoryRegistry>,
}

impl LockManagerFactory {
    /// Create a factory resolving repositories through `repositories`.
    pub fn new(repositories: Arc<RepositoryRegistry>) -> Self {
        Self { repositories }
    }

    /// Lock manager for shard `shard_num` of `index_uuid` in `repository`.
    ///
    /// Fails with [`SegrepError::RepositoryMissing`] if the repository is not
    /// registered; this is a configuration error and is never retried.
    pub fn new_lock_manager(
        &self,
        repository: &str,
        index_uuid: &str,
        shard_num: u32,
    ) -> SegrepResult<Arc<RemoteStoreLockManager>> {
        let repo = self.repositories.repository(repository)?;
        let path = RemoteShardPath::new(repo.base_path(), index_uuid, shard_num);
        Ok(Arc::new(RemoteStoreLockManager::new(repo.container(), &path)))
    }
}
