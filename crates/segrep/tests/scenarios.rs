//! End-to-end replication scenarios across the primary, replicas, the
//! remote store and the action framework.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use segrep::action::{
    AckPolicy, ActionConfig, ActionState, ClusterStateView, InMemoryClusterState, PublishCheckpointAction,
    ReplicationAction,
};
use segrep::checkpoint::ReplicationCheckpoint;
use segrep::directory::{Directory, InMemoryDirectory, TEMP_FILE_PREFIX};
use segrep::engine::{Document, InMemoryPrimaryEngine, PrimaryEngine, ReaderState};
use segrep::error::{SegrepError, SegrepResult};
use segrep::manifest::{SegmentManifest, StoreFileMetadata};
use segrep::remote::{
    get_handler, InMemoryBlobStore, MetadataHandlerRegistry, RemoteShardPath, RemoteStoreLockManager,
};
use segrep::replication::{
    CancellationHandle, CheckpointInfo, PrimaryShardSource, RemoteStoreSource, ReplicationOutcome,
    ReplicationSource, SegmentReplicationTarget,
};
use segrep::shard::{ShardId, ShardRouting};

use common::{copy_files, index_in_batches, new_primary, new_replica_engine, remote_store, shard, ReplicationGroup};

fn fast_config() -> ActionConfig {
    ActionConfig {
        max_primary_retries: 3,
        retry_backoff: Duration::from_millis(5),
        replica_ack_timeout: Duration::from_secs(5),
        ack_policy: AckPolicy::All,
    }
}

#[tokio::test]
async fn test_empty_replica_catches_up_in_one_update() {
    let primary = new_primary(1);
    index_in_batches(&primary, 5, 2);
    let manifest = primary.current_manifest().unwrap();
    let key = manifest.checkpoint.key();
    assert_eq!((key.primary_term, key.segments_generation, key.version), (1, 5, 10));

    let replica = new_replica_engine();
    assert_eq!(replica.state(), ReaderState::Empty);
    copy_files(&manifest, primary.directory().as_ref(), replica.directory().as_ref());
    replica.update_segments(manifest).unwrap();

    let view = replica.acquire().unwrap();
    assert_eq!(view.generation(), 5);
    assert_eq!(replica.state(), ReaderState::Steady);
    let mut ids: Vec<u64> = view
        .documents()
        .unwrap()
        .into_iter()
        .map(|d| d.id.parse().unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..10).collect::<Vec<u64>>());
    assert_eq!(replica.stats().updates_applied, 1);
}

#[tokio::test]
async fn test_replication_round_from_primary() {
    let primary = new_primary(1);
    index_in_batches(&primary, 5, 2);
    let checkpoint = primary.current_manifest().unwrap().checkpoint;

    let replica = new_replica_engine();
    let source: Arc<dyn ReplicationSource> = Arc::new(PrimaryShardSource::new(primary.clone()));
    let outcome = SegmentReplicationTarget::new(replica.clone(), source, checkpoint.clone(), CancellationHandle::new())
        .run()
        .await
        .unwrap();
    match outcome {
        ReplicationOutcome::Applied {
            checkpoint: applied,
            files_fetched,
            ..
        } => {
            assert_eq!(applied, checkpoint.key());
            assert_eq!(files_fetched, 5);
        }
        other => panic!("expected Applied, got {:?}", other),
    }
    assert_eq!(replica.acquire().unwrap().doc_count(), 10);
}

#[tokio::test]
async fn test_out_of_order_checkpoints_keep_newest() {
    let primary = new_primary(1);
    index_in_batches(&primary, 5, 2);
    let gen5 = primary.current_manifest().unwrap();
    index_in_batches(&primary, 1, 1);
    let gen6 = primary.current_manifest().unwrap();
    assert_eq!(gen6.checkpoint.key().segments_generation, 6);
    assert_eq!(gen6.checkpoint.key().version, 11);

    let replica = new_replica_engine();
    copy_files(&gen6, primary.directory().as_ref(), replica.directory().as_ref());
    replica.update_segments(gen6.clone()).unwrap();

    let err = replica.update_segments(gen5.clone()).unwrap_err();
    assert!(err.is_stale());
    assert_eq!(replica.current_checkpoint().key(), gen6.checkpoint.key());
    assert_eq!(replica.acquire().unwrap().doc_count(), 11);
    assert_eq!(replica.stats().stale_rejected, 1);
}

#[tokio::test]
async fn test_service_drops_stale_delivery() {
    let group = ReplicationGroup::new(1);
    index_in_batches(&group.primary, 5, 2);
    let cp5 = group.primary.current_manifest().unwrap().checkpoint;
    index_in_batches(&group.primary, 1, 1);
    let cp6 = group.primary.current_manifest().unwrap().checkpoint;

    let service = &group.replicas[0].1;
    assert!(service.on_new_checkpoint(cp6.clone()));
    assert!(!service.on_new_checkpoint(cp5));
    service.wait_for(cp6.key(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(service.engine().current_checkpoint().key(), cp6.key());
    assert!(service.stats().dropped_stale >= 1);
}

#[tokio::test]
async fn test_unshipped_metadata_version_rejected() {
    let err = get_handler(3).unwrap_err();
    assert!(matches!(
        err,
        SegrepError::UnsupportedVersion { version: 3, ref supported } if supported == &vec![1, 2]
    ));
    assert!(err.is_fatal());

    let registry = MetadataHandlerRegistry::with_versions(&[1, 2]).unwrap();
    assert!(registry.get_handler(3).is_err());
    assert!(Arc::ptr_eq(&registry.get_handler(2).unwrap(), &registry.get_handler(2).unwrap()));
}

#[tokio::test]
async fn test_release_without_acquire_is_lock_not_found() {
    let store = Arc::new(InMemoryBlobStore::new());
    let locks = RemoteStoreLockManager::new(store, &RemoteShardPath::new("cluster-a", "6f1c0e0a", 0));
    let err = locks.release(5, "r1").await.unwrap_err();
    assert!(matches!(err, SegrepError::LockNotFound { generation: 5, ref owner } if owner == "r1"));

    locks.acquire(5, "r1").await.unwrap();
    locks.release(5, "r1").await.unwrap();
    assert!(matches!(
        locks.release(5, "r1").await.unwrap_err(),
        SegrepError::LockNotFound { .. }
    ));
}

/// Runs a callback the first time the primary is resolved, standing in for
/// a master that promotes a replica while an action is in flight.
struct FailoverDuringResolve {
    inner: Arc<InMemoryClusterState>,
    on_resolve: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ClusterStateView for FailoverDuringResolve {
    fn primary_term(&self, shard: &ShardId) -> SegrepResult<u64> {
        self.inner.primary_term(shard)
    }

    fn primary(&self, shard: &ShardId) -> SegrepResult<ShardRouting> {
        let routing = self.inner.primary(shard)?;
        let hook = self.on_resolve.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        Ok(routing)
    }

    fn replica_copies(&self, shard: &ShardId) -> SegrepResult<Vec<ShardRouting>> {
        self.inner.replica_copies(shard)
    }
}

#[tokio::test]
async fn test_primary_failover_retries_against_new_primary() {
    let group = ReplicationGroup::new(2);
    index_in_batches(&group.primary, 3, 2);
    let initial = group.primary.current_manifest().unwrap().checkpoint;
    for (_, service) in &group.replicas {
        service.on_new_checkpoint(initial.clone());
        service.wait_for(initial.key(), Duration::from_secs(5)).await.unwrap();
    }

    let (promoted_routing, promoted_service) = group.replicas[0].clone();
    let (_, other_service) = group.replicas[1].clone();
    let new_primary: Arc<Mutex<Option<Arc<InMemoryPrimaryEngine>>>> = Arc::new(Mutex::new(None));

    let hook = {
        let cluster = Arc::clone(&group.cluster);
        let shards = Arc::clone(&group.shards);
        let new_primary = Arc::clone(&new_primary);
        move || {
            let term = cluster.promote(&shard(), &promoted_routing.allocation_id).unwrap();
            promoted_service.close();
            let engine = promoted_service.engine();
            let primary = Arc::new(
                InMemoryPrimaryEngine::open(shard(), engine.directory(), term, engine.current_manifest()).unwrap(),
            );
            index_in_batches(&primary, 1, 1);
            shards.register_primary(promoted_routing.allocation_id.clone(), primary.clone());
            other_service.set_source(Arc::new(PrimaryShardSource::new(primary.clone())));
            *new_primary.lock() = Some(primary);
        }
    };
    let cluster = Arc::new(FailoverDuringResolve {
        inner: Arc::clone(&group.cluster),
        on_resolve: Mutex::new(Some(Box::new(hook))),
    });

    let action = ReplicationAction::new(PublishCheckpointAction::new(Arc::clone(&group.shards)), cluster, fast_config());
    let resp = action.execute(&shard(), initial.clone()).await.unwrap();

    assert_eq!(resp.attempts, 2);
    assert_eq!(resp.primary_term, 2);
    assert_eq!(
        resp.states.iter().filter(|s| matches!(s, ActionState::PrimaryExecuting { .. })).count(),
        2
    );
    assert_eq!(resp.shard_info.total, 2);
    assert_eq!(action.stats().primary_retries, 1);

    let published = resp.response;
    assert_eq!(published.primary_term, 2);
    assert_eq!(published.segments_generation, initial.segments_generation + 1);

    let new_primary = new_primary.lock().clone().unwrap();
    let survivor = &group.replicas[1].1;
    survivor.wait_for(published.key(), Duration::from_secs(5)).await.unwrap();
    let view = survivor.engine().acquire().unwrap();
    assert_eq!(view.key(), new_primary.current_manifest().unwrap().checkpoint.key());
    assert_eq!(view.doc_count(), 7);
}

#[tokio::test]
async fn test_stale_primary_alone_exhausts_retries() {
    let group = ReplicationGroup::new(1);
    group.cluster.bump_term(&shard()).unwrap();
    let action = ReplicationAction::new(
        PublishCheckpointAction::new(Arc::clone(&group.shards)),
        group.cluster.clone(),
        fast_config(),
    );
    let err = action
        .execute(&shard(), ReplicationCheckpoint::empty(shard()))
        .await
        .unwrap_err();
    assert!(matches!(err, SegrepError::OperationFailed { attempts: 4, .. }));
}

#[tokio::test]
async fn test_remote_store_replication_and_gc_respects_locks() {
    let store = Arc::new(InMemoryBlobStore::new());
    let remote = remote_store(store.clone());
    let primary = new_primary(1);

    for _ in 0..4 {
        index_in_batches(&primary, 1, 3);
        let manifest = primary.current_manifest().unwrap();
        remote.upload_segments(&manifest, primary.directory().as_ref()).await.unwrap();
    }
    assert_eq!(remote.list_metadata_files().await.unwrap().len(), 4);

    // a reader pins generation 2 before the sweep
    let pinned = remote.lock_manager().acquire_scoped(2, "snapshot-1").await.unwrap();
    let plan = remote.delete_stale_segments(1).await.unwrap();
    assert!(!plan.deletable_generations.contains(&2));
    assert!(plan.retained_generations.contains(&2));
    assert!(plan.retained_generations.contains(&4));
    assert_eq!(plan.deletable_generations, vec![3, 1]);
    pinned.release().await.unwrap();

    let replica = new_replica_engine();
    let source: Arc<dyn ReplicationSource> = Arc::new(RemoteStoreSource::new(remote.clone(), "replica-1"));
    let latest = primary.current_manifest().unwrap().checkpoint;
    let outcome = SegmentReplicationTarget::new(replica.clone(), source, latest.clone(), CancellationHandle::new())
        .run()
        .await
        .unwrap();
    assert!(matches!(outcome, ReplicationOutcome::Applied { .. }));
    assert_eq!(replica.current_checkpoint().key(), latest.key());
    assert_eq!(replica.acquire().unwrap().doc_count(), 12);
    assert!(remote.lock_manager().locked_generations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_through_action_reaches_remote_and_replicas() {
    let group = ReplicationGroup::new(2);
    let store = Arc::new(InMemoryBlobStore::new());
    let remote = remote_store(store);
    group.shards.attach_remote_store(shard(), remote.clone());

    let action = ReplicationAction::new(
        PublishCheckpointAction::new(Arc::clone(&group.shards)),
        group.cluster.clone(),
        fast_config(),
    );
    let mut last = ReplicationCheckpoint::empty(shard());
    for _ in 0..3 {
        index_in_batches(&group.primary, 1, 4);
        let cp = group.primary.current_manifest().unwrap().checkpoint;
        let resp = action.execute(&shard(), cp).await.unwrap();
        assert_eq!(resp.shard_info.successful, 3);
        last = resp.response;
    }

    let (_, md) = remote.read_latest_metadata().await.unwrap().unwrap();
    assert_eq!(md.generation(), last.segments_generation);
    assert_eq!(md.checkpoint.as_ref().map(|c| c.key()), Some(last.key()));
    for (_, service) in &group.replicas {
        service.wait_for(last.key(), Duration::from_secs(5)).await.unwrap();
        assert_eq!(service.engine().acquire().unwrap().doc_count(), 12);
    }
}

#[tokio::test]
async fn test_cancelled_round_leaves_generation_untouched() {
    let primary = new_primary(1);
    index_in_batches(&primary, 2, 2);
    let first = primary.current_manifest().unwrap();
    let replica = new_replica_engine();
    copy_files(&first, primary.directory().as_ref(), replica.directory().as_ref());
    replica.update_segments(first.clone()).unwrap();

    index_in_batches(&primary, 2, 2);
    let cancel = CancellationHandle::new();
    cancel.cancel("shard closing");
    let source: Arc<dyn ReplicationSource> = Arc::new(PrimaryShardSource::new(primary.clone()));
    let next = primary.current_manifest().unwrap().checkpoint;
    let err = SegmentReplicationTarget::new(replica.clone(), source, next, cancel)
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SegrepError::Cancelled { .. }));
    assert_eq!(replica.current_checkpoint().key(), first.checkpoint.key());
    let leftovers: Vec<String> = replica
        .directory()
        .list_all()
        .unwrap()
        .into_iter()
        .filter(|n| n.starts_with(TEMP_FILE_PREFIX))
        .collect();
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn test_replica_ahead_of_promoted_primary_fails_then_recovers() {
    let group = ReplicationGroup::new(2);
    index_in_batches(&group.primary, 1, 2);
    let first = group.primary.current_manifest().unwrap().checkpoint;
    for (_, service) in &group.replicas {
        service.on_new_checkpoint(first.clone());
        service.wait_for(first.key(), Duration::from_secs(5)).await.unwrap();
    }

    // only the second copy sees the old primary's next generation
    let (promoted_routing, promoted) = group.replicas[0].clone();
    let (ahead_routing, ahead) = group.replicas[1].clone();
    index_in_batches(&group.primary, 1, 1);
    let lost = group.primary.current_manifest().unwrap().checkpoint;
    ahead.on_new_checkpoint(lost.clone());
    ahead.wait_for(lost.key(), Duration::from_secs(5)).await.unwrap();
    assert_eq!(ahead.engine().current_manifest().file_names(), vec!["_0.seg", "_1.seg"]);

    let term = group.cluster.promote(&shard(), &promoted_routing.allocation_id).unwrap();
    promoted.close();
    let engine = promoted.engine();
    let new_primary = Arc::new(
        InMemoryPrimaryEngine::open(shard(), engine.directory(), term, engine.current_manifest()).unwrap(),
    );
    new_primary.index(Document::new("written-after-promotion", "{}"));
    let diverging = new_primary.refresh().unwrap().unwrap();
    assert!(diverging.metadata_map.contains_key("_1.seg"));
    group
        .shards
        .register_primary(promoted_routing.allocation_id.clone(), new_primary.clone());
    ahead.set_source(Arc::new(PrimaryShardSource::new(new_primary.clone())));

    let action = ReplicationAction::new(
        PublishCheckpointAction::new(Arc::clone(&group.shards)),
        group.cluster.clone(),
        ActionConfig {
            ack_policy: AckPolicy::BestEffort,
            ..fast_config()
        },
    );
    action.execute(&shard(), diverging.clone()).await.unwrap();
    let err = ahead.wait_for(diverging.key(), Duration::from_secs(5)).await.unwrap_err();
    assert!(matches!(err, SegrepError::ShardFailed { .. }), "{err}");
    assert_eq!(ahead.engine().state(), ReaderState::Failed);
    assert!(ahead.failure().unwrap().contains("_1.seg"));
    // still serving the old primary's generation, but refusing anything new
    assert_eq!(ahead.engine().current_checkpoint().key(), lost.key());
    assert!(!ahead.on_new_checkpoint(diverging.clone()));

    new_primary.index(Document::new("after-failure", "{}"));
    let next = new_primary.refresh().unwrap().unwrap();
    let resp = action.execute(&shard(), next.clone()).await.unwrap();
    assert_eq!(resp.shard_info.failed(), 1);
    assert_eq!(resp.shard_info.failures[0].allocation_id, ahead_routing.allocation_id);

    assert!(ahead.recover(next.clone()).unwrap());
    ahead.wait_for(next.key(), Duration::from_secs(5)).await.unwrap();
    let view = ahead.engine().acquire().unwrap();
    assert_eq!(view.key(), new_primary.current_manifest().unwrap().checkpoint.key());
    assert_eq!(view.doc_count(), 4);
    let ids: Vec<String> = view.documents().unwrap().into_iter().map(|d| d.id).collect();
    assert!(ids.contains(&"written-after-promotion".to_string()));
    assert!(!ids.contains(&"2".to_string()));
}

/// Serves a fixed manifest and applies a newer one to the replica before
/// handing out the first file.
struct RacedSource {
    manifest: SegmentManifest,
    files: Arc<dyn Directory>,
    before_fetch: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

#[async_trait]
impl ReplicationSource for RacedSource {
    fn description(&self) -> String {
        "raced".to_string()
    }

    async fn get_checkpoint_info(&self, _checkpoint: &ReplicationCheckpoint) -> SegrepResult<CheckpointInfo> {
        Ok(CheckpointInfo {
            manifest: self.manifest.clone(),
            uploaded: Default::default(),
            lock: None,
        })
    }

    async fn get_file(&self, _info: &CheckpointInfo, file: &StoreFileMetadata) -> SegrepResult<Bytes> {
        let hook = self.before_fetch.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.files.read_file(&file.name)
    }
}

#[tokio::test]
async fn test_round_losing_to_newer_generation_leaves_no_files() {
    let primary = new_primary(1);
    index_in_batches(&primary, 3, 2);
    let older = primary.current_manifest().unwrap();
    let staging: Arc<dyn Directory> = Arc::new(InMemoryDirectory::new());
    copy_files(&older, primary.directory().as_ref(), staging.as_ref());

    primary.merge().unwrap().unwrap();
    let merged = primary.current_manifest().unwrap();
    let merged_key = merged.checkpoint.key();

    let replica = new_replica_engine();
    let racer = Arc::clone(&replica);
    let primary_dir = primary.directory();
    let source = Arc::new(RacedSource {
        manifest: older.clone(),
        files: staging,
        before_fetch: Mutex::new(Some(Box::new(move || {
            copy_files(&merged, primary_dir.as_ref(), racer.directory().as_ref());
            racer.update_segments(merged).unwrap();
        }))),
    });

    let outcome = SegmentReplicationTarget::new(replica.clone(), source, older.checkpoint, CancellationHandle::new())
        .run()
        .await
        .unwrap();
    assert_eq!(outcome, ReplicationOutcome::Skipped { current: merged_key });
    assert_eq!(replica.current_checkpoint().key(), merged_key);
    assert_eq!(replica.directory().list_all().unwrap(), vec!["_3.seg"]);
    assert_eq!(replica.acquire().unwrap().doc_count(), 6);
}
