//! Checkpoint publication through the action framework.
//!
//! The primary phase confirms the local primary still holds the term,
//! uploads its current state to the remote store when one is attached, and
//! hands the checkpoint to the replica phase. Each replica passes the
//! checkpoint to its [`SegmentReplicationTargetService`], which fetches and
//! applies asynchronously.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::action::{ActionConfig, ClusterStateView, ReplicatedOperation, ReplicationAction, ShardInfo};
use crate::checkpoint::{MergedSegmentCheckpoint, ReplicationCheckpoint};
use crate::engine::{PrimaryEngine, ReaderState};
use crate::error::{SegrepError, SegrepResult};
use crate::pressure::ReplicationTracker;
use crate::publisher::{CheckpointAvailable, CheckpointReceiver};
use crate::remote::store::RemoteSegmentStoreDirectory;
use crate::replication::SegmentReplicationTargetService;
use crate::shard::{AllocationId, ShardId, ShardRouting};

/// Shard copies hosted by this process, by allocation id.
#[derive(Default)]
pub struct LocalShardRegistry {
    primaries: DashMap<AllocationId, Arc<dyn PrimaryEngine>>,
    replicas: DashMap<AllocationId, SegmentReplicationTargetService>,
    remote_stores: DashMap<ShardId, Arc<RemoteSegmentStoreDirectory>>,
}

impl LocalShardRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Host a primary copy.
    pub fn register_primary(&self, allocation_id: AllocationId, engine: Arc<dyn PrimaryEngine>) {
        self.primaries.insert(allocation_id, engine);
    }

    /// Host a replica copy.
    pub fn register_replica(&self, service: SegmentReplicationTargetService) {
        self.replicas.insert(service.allocation_id().clone(), service);
    }

    /// Upload every published state of `shard` to `remote`.
    pub fn attach_remote_store(&self, shard: ShardId, remote: Arc<RemoteSegmentStoreDirectory>) {
        self.remote_stores.insert(shard, remote);
    }

    /// Stop hosting a copy. Returns true if anything was removed.
    pub fn remove(&self, allocation_id: &AllocationId) -> bool {
        let primary = self.primaries.remove(allocation_id).is_some();
        let replica = self.replicas.remove(allocation_id).is_some();
        primary || replica
    }

    /// The primary engine for `allocation_id`.
    pub fn primary(&self, allocation_id: &AllocationId) -> Option<Arc<dyn PrimaryEngine>> {
        self.primaries.get(allocation_id).map(|e| Arc::clone(e.value()))
    }

    /// The replica service for `allocation_id`.
    pub fn replica(&self, allocation_id: &AllocationId) -> Option<SegmentReplicationTargetService> {
        self.replicas.get(allocation_id).map(|s| s.value().clone())
    }

    /// Remote store attached to `shard`.
    pub fn remote_store(&self, shard: &ShardId) -> Option<Arc<RemoteSegmentStoreDirectory>> {
        self.remote_stores.get(shard).map(|r| Arc::clone(r.value()))
    }

    fn primary_at(&self, routing: &ShardRouting, term: u64) -> SegrepResult<Arc<dyn PrimaryEngine>> {
        let engine = self.primary(&routing.allocation_id).ok_or_else(|| SegrepError::ShardNotPrimary {
            shard: routing.shard_id.clone(),
            expected_term: term,
            actual_term: 0,
        })?;
        let local = engine.primary_term();
        if local != term {
            return Err(SegrepError::ShardNotPrimary {
                shard: routing.shard_id.clone(),
                expected_term: term,
                actual_term: local,
            });
        }
        Ok(engine)
    }

    fn replica_at(&self, routing: &ShardRouting) -> SegrepResult<SegmentReplicationTargetService> {
        let service = self.replica(&routing.allocation_id).ok_or_else(|| SegrepError::ReplicaFailed {
            allocation_id: routing.allocation_id.to_string(),
            reason: "copy is not hosted here".to_string(),
        })?;
        match service.engine().state() {
            ReaderState::Closed => Err(SegrepError::ShardClosed {
                shard: routing.shard_id.clone(),
            }),
            ReaderState::Failed => Err(SegrepError::ReplicaFailed {
                allocation_id: routing.allocation_id.to_string(),
                reason: format!("copy failed: {}", service.failure().unwrap_or_default()),
            }),
            _ => Ok(service),
        }
    }
}

impl std::fmt::Debug for LocalShardRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalShardRegistry")
            .field("primaries", &self.primaries.len())
            .field("replicas", &self.replicas.len())
            .field("remote_stores", &self.remote_stores.len())
            .finish()
    }
}

/// Publishes the primary's current checkpoint to every replica.
///
/// The request is the checkpoint that triggered the publish. The primary
/// phase answers with the primary's own latest checkpoint, which is what a
/// newly promoted primary must publish after a failover.
#[derive(Debug)]
pub struct PublishCheckpointAction {
    shards: Arc<LocalShardRegistry>,
}

impl PublishCheckpointAction {
    /// Create the operation over locally hosted copies.
    pub fn new(shards: Arc<LocalShardRegistry>) -> Self {
        Self { shards }
    }
}

#[async_trait]
impl ReplicatedOperation for PublishCheckpointAction {
    type Request = ReplicationCheckpoint;
    type PrimaryResponse = ReplicationCheckpoint;
    type ReplicaRequest = ReplicationCheckpoint;

    fn name(&self) -> &'static str {
        "publish_checkpoint"
    }

    async fn execute_on_primary(
        &self,
        primary: &ShardRouting,
        primary_term: u64,
        request: &ReplicationCheckpoint,
    ) -> SegrepResult<(ReplicationCheckpoint, ReplicationCheckpoint)> {
        let engine = self.shards.primary_at(primary, primary_term)?;
        let manifest = engine.current_manifest()?;
        if request.is_ahead_of(&manifest.checkpoint) {
            debug!(
                requested = %request.key(),
                current = %manifest.checkpoint.key(),
                "publish request is ahead of the primary, publishing current state"
            );
        }
        if let Some(remote) = self.shards.remote_store(&primary.shard_id) {
            let directory = engine.directory();
            let uploaded = remote.upload_segments(&manifest, directory.as_ref()).await?;
            debug!(
                shard = %primary.shard_id,
                metadata = %uploaded.metadata_file,
                files = uploaded.files_uploaded,
                "uploaded checkpoint to remote store"
            );
        }
        let checkpoint = manifest.checkpoint;
        Ok((checkpoint.clone(), checkpoint))
    }

    async fn execute_on_replica(
        &self,
        replica: &ShardRouting,
        primary_term: u64,
        checkpoint: &ReplicationCheckpoint,
    ) -> SegrepResult<()> {
        let service = self.shards.replica_at(replica)?;
        if checkpoint.primary_term > primary_term {
            return Err(SegrepError::ReplicaFailed {
                allocation_id: replica.allocation_id.to_string(),
                reason: format!(
                    "checkpoint term {} is newer than operation term {}",
                    checkpoint.primary_term, primary_term
                ),
            });
        }
        let accepted = service.on_new_checkpoint(checkpoint.clone());
        debug!(allocation = %replica.allocation_id, checkpoint = %checkpoint.key(), accepted, "replica notified");
        Ok(())
    }
}

/// Hands merged segments to replicas ahead of the next refresh.
///
/// Replicas copy the merged files without changing what they serve; the
/// merged generation becomes visible through the next published checkpoint,
/// which then finds the files local. With a remote store attached the merged
/// state is uploaded first.
#[derive(Debug)]
pub struct PublishMergedSegmentAction {
    shards: Arc<LocalShardRegistry>,
}

impl PublishMergedSegmentAction {
    /// Create the operation over locally hosted copies.
    pub fn new(shards: Arc<LocalShardRegistry>) -> Self {
        Self { shards }
    }
}

#[async_trait]
impl ReplicatedOperation for PublishMergedSegmentAction {
    type Request = MergedSegmentCheckpoint;
    type PrimaryResponse = MergedSegmentCheckpoint;
    type ReplicaRequest = MergedSegmentCheckpoint;

    fn name(&self) -> &'static str {
        "publish_merged_segment"
    }

    async fn execute_on_primary(
        &self,
        primary: &ShardRouting,
        primary_term: u64,
        request: &MergedSegmentCheckpoint,
    ) -> SegrepResult<(MergedSegmentCheckpoint, MergedSegmentCheckpoint)> {
        let engine = self.shards.primary_at(primary, primary_term)?;
        if request.checkpoint.primary_term != primary_term {
            return Err(SegrepError::ShardNotPrimary {
                shard: primary.shard_id.clone(),
                expected_term: primary_term,
                actual_term: request.checkpoint.primary_term,
            });
        }
        // remote readers must be able to reach the merged generation too
        if let Some(remote) = self.shards.remote_store(&primary.shard_id) {
            let manifest = engine.current_manifest()?;
            let directory = engine.directory();
            remote.upload_segments(&manifest, directory.as_ref()).await?;
        }
        Ok((request.clone(), request.clone()))
    }

    async fn execute_on_replica(
        &self,
        replica: &ShardRouting,
        _primary_term: u64,
        merged: &MergedSegmentCheckpoint,
    ) -> SegrepResult<()> {
        let service = self.shards.replica_at(replica)?;
        let started = service.prewarm_merged(merged);
        debug!(allocation = %replica.allocation_id, segment = %merged.segment_name, started, "merged segment handed to replica");
        Ok(())
    }
}

/// Dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Events taken off the channel.
    pub received: u64,
    /// Events whose action completed.
    pub dispatched: u64,
    /// Events whose action failed.
    pub failed: u64,
    /// Replica copies that did not acknowledge.
    pub replica_failures: u64,
}

#[derive(Debug, Default)]
struct DispatcherStatsInner {
    received: AtomicU64,
    dispatched: AtomicU64,
    failed: AtomicU64,
    replica_failures: AtomicU64,
}

impl DispatcherStatsInner {
    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            received: self.received.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            replica_failures: self.replica_failures.load(Ordering::Relaxed),
        }
    }
}

/// Drains a [`CheckpointReceiver`] and runs the matching publish action for
/// each event.
#[derive(Clone)]
pub struct CheckpointDispatcher {
    segment: ReplicationAction<PublishCheckpointAction>,
    merged: ReplicationAction<PublishMergedSegmentAction>,
    trackers: Arc<DashMap<ShardId, Arc<ReplicationTracker>>>,
    stats: Arc<DispatcherStatsInner>,
}

impl CheckpointDispatcher {
    /// Create a dispatcher publishing to copies in `shards`.
    pub fn new(shards: Arc<LocalShardRegistry>, cluster: Arc<dyn ClusterStateView>, config: ActionConfig) -> Self {
        Self {
            segment: ReplicationAction::new(
                PublishCheckpointAction::new(Arc::clone(&shards)),
                Arc::clone(&cluster),
                config.clone(),
            ),
            merged: ReplicationAction::new(PublishMergedSegmentAction::new(shards), cluster, config),
            trackers: Arc::new(DashMap::new()),
            stats: Arc::new(DispatcherStatsInner::default()),
        }
    }

    /// Record published checkpoints of `tracker`'s shard for lag tracking.
    pub fn track(&self, tracker: Arc<ReplicationTracker>) {
        self.trackers.insert(tracker.shard_id().clone(), tracker);
    }

    /// Publish one event and wait for the action to respond.
    pub async fn dispatch(&self, event: CheckpointAvailable) -> SegrepResult<ShardInfo> {
        self.stats.received.fetch_add(1, Ordering::Relaxed);
        let shard = event.shard_id().clone();
        let result = match event {
            CheckpointAvailable::Segment(checkpoint) => self.segment.execute(&shard, checkpoint).await.map(|resp| {
                if let Some(tracker) = self.trackers.get(&shard) {
                    tracker.set_latest_checkpoint(resp.response.key());
                }
                resp.shard_info
            }),
            CheckpointAvailable::Merged(merged) => self.merged.execute(&shard, merged).await.map(|resp| resp.shard_info),
        };
        match &result {
            Ok(info) => {
                self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .replica_failures
                    .fetch_add(info.failed() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                warn!(shard = %shard, error = %e, "checkpoint publish failed");
            }
        }
        result
    }

    /// Dispatch every event until all publishers are dropped.
    pub async fn run(self, mut receiver: CheckpointReceiver) -> DispatcherStats {
        info!("checkpoint dispatcher started");
        while let Some(event) = receiver.recv().await {
            match self.dispatch(event).await {
                Ok(info) => debug!(total = info.total, successful = info.successful, "checkpoint dispatched"),
                // counted and logged by dispatch; later events may still succeed
                Err(_) => {}
            }
        }
        let stats = self.stats();
        info!(
            received = stats.received,
            dispatched = stats.dispatched,
            failed = stats.failed,
            "checkpoint dispatcher stopped"
        );
        stats
    }

    /// Run on a background task.
    pub fn spawn(self, receiver: CheckpointReceiver) -> JoinHandle<DispatcherStats> {
        tokio::spawn(self.run(receiver))
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> DispatcherStats {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for CheckpointDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointDispatcher")
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
