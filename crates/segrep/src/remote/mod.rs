//! Remote durable store: blob layout, versioned metadata, advisory locks and
//! the per-shard remote segment directory.

pub mod blob;
pub mod gc;
pub mod lock;
pub mod metadata;
pub mod path;
pub mod repository;
pub mod store;

pub use blob::{BlobContainer, FsBlobStore, InMemoryBlobStore};
pub use gc::{GcPlan, GcSweep};
pub use lock::{LockGuard, LockManagerFactory, RemoteStoreLockManager};
pub use metadata::{
    get_handler, MetadataHandler, MetadataHandlerRegistry, RemoteSegmentMetadata,
    UploadedSegmentMetadata,
};
pub use path::{MetadataFileName, RemoteShardPath};
pub use repository::{Repository, RepositoryRegistry};
pub use store::{RemoteSegmentStoreDirectory, UploadResult};
