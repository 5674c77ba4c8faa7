//! Named repositories backing remote stores.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{SegrepError, SegrepResult};
use crate::remote::blob::BlobContainer;

/// A named blob store with a base path.
pub struct Repository {
    name: String,
    base_path: String,
    container: Arc<dyn BlobContainer>,
}

impl Repository {
    /// Create a repository.
    pub fn new(name: impl Into<String>, base_path: impl Into<String>, container: Arc<dyn BlobContainer>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
            container,
        }
    }

    /// Repository name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base path inside the blob store.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// The blob store.
    pub fn container(&self) -> Arc<dyn BlobContainer> {
        Arc::clone(&self.container)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("name", &self.name)
            .field("base_path", &self.base_path)
            .finish()
    }
}

/// Registry resolving repository names.
#[derive(Debug, Default)]
pub struct RepositoryRegistry {
    repositories: DashMap<String, Arc<Repository>>,
}

impl RepositoryRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a repository.
    pub fn register(&self, repository: Repository) -> Arc<Repository> {
        let repository = Arc::new(repository);
        info!(repository = repository.name(), "registered repository");
        self.repositories
            .insert(repository.name().to_string(), Arc::clone(&repository));
        repository
    }

    /// Resolve a repository by name.
    pub fn repository(&self, name: &str) -> SegrepResult<Arc<Repository>> {
        self.repositories
            .get(name)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| SegrepError::RepositoryMissing {
                repository: name.to_string(),
            })
    }

    /// Number of registered repositories.
    pub fn len(&self) -> usize {
        self.repositories.len()
    }

    /// True if no repository is registered.
    pub fn is_empty(&self) -> bool {
        self.repositories.is_empty()
    }
}
