#![warn(missing_docs)]

//! Segment replication: primaries publish checkpoints of immutable segment
//! sets, replicas copy the files and swap their readers to the new
//! generation, and a remote segment store keeps versioned metadata with
//! advisory locks against garbage collection.

pub mod action;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod directory;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod pressure;
pub mod publisher;
pub mod remote;
pub mod replication;
pub mod shard;
pub mod telemetry;

pub use action::{
    AckPolicy, ActionConfig, ActionState, CheckpointDispatcher, ClusterStateView, InMemoryClusterState,
    LocalShardRegistry, PublishCheckpointAction, ReplicatedOperation, ReplicationAction, ReplicationResponse,
    ShardInfo,
};
pub use checkpoint::{CheckpointKey, MergedSegmentCheckpoint, ReplicationCheckpoint};
pub use config::SegrepConfig;
pub use directory::{Directory, FsDirectory, InMemoryDirectory};
pub use engine::{Document, InMemoryPrimaryEngine, NrtReplicationEngine, PrimaryEngine, ReaderView};
pub use error::{SegrepError, SegrepResult};
pub use manifest::{SegmentManifest, StoreFileMetadata};
pub use pressure::{PressureService, ReplicationTracker};
pub use publisher::{checkpoint_channel, CheckpointAvailable, CheckpointPublisher, MergedSegmentPublisher};
pub use remote::{RemoteSegmentStoreDirectory, RemoteStoreLockManager};
pub use replication::{PrimaryShardSource, RemoteStoreSource, SegmentReplicationTargetService};
pub use shard::{AllocationId, NodeId, ShardId, ShardRouting};
