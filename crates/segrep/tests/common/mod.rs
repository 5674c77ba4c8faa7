//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use segrep::action::{InMemoryClusterState, LocalShardRegistry};
use segrep::directory::{Directory, InMemoryDirectory};
use segrep::engine::{Document, InMemoryPrimaryEngine, NrtReplicationEngine, PrimaryEngine};
use segrep::manifest::SegmentManifest;
use segrep::remote::{InMemoryBlobStore, RemoteSegmentStoreDirectory, RemoteShardPath, RemoteStoreLockManager};
use segrep::replication::{PrimaryShardSource, ReplicationSource, SegmentReplicationTargetService};
use segrep::shard::{NodeId, ShardId, ShardRouting};

pub fn shard() -> ShardId {
    ShardId::new("logs", "6f1c0e0a", 0)
}

/// Index `docs_per_refresh` documents and refresh, `refreshes` times.
pub fn index_in_batches(primary: &InMemoryPrimaryEngine, refreshes: usize, docs_per_refresh: usize) {
    for _ in 0..refreshes {
        for _ in 0..docs_per_refresh {
            let id = primary.doc_count() as usize + primary.buffered_docs();
            primary.index(Document::new(id.to_string(), format!("{{\"n\":{}}}", id)));
        }
        primary.refresh().unwrap();
    }
}

/// Copy every file `manifest` references from `from` into `to`.
pub fn copy_files(manifest: &SegmentManifest, from: &dyn Directory, to: &dyn Directory) {
    for name in manifest.file_names() {
        if !to.contains(&name).unwrap() {
            to.write_file(&name, &from.read_file(&name).unwrap()).unwrap();
        }
    }
}

pub fn new_primary(term: u64) -> Arc<InMemoryPrimaryEngine> {
    Arc::new(InMemoryPrimaryEngine::new(shard(), Arc::new(InMemoryDirectory::new()), term).unwrap())
}

pub fn new_replica_engine() -> Arc<NrtReplicationEngine> {
    Arc::new(NrtReplicationEngine::new(shard(), Arc::new(InMemoryDirectory::new())).unwrap())
}

pub fn remote_store(store: Arc<InMemoryBlobStore>) -> Arc<RemoteSegmentStoreDirectory> {
    let path = RemoteShardPath::new("cluster-a", shard().index_uuid, 0);
    let locks = Arc::new(RemoteStoreLockManager::new(store.clone(), &path));
    Arc::new(RemoteSegmentStoreDirectory::new(store, &path, "node-0", 2, locks).unwrap())
}

/// A primary and its replicas registered in one process.
pub struct ReplicationGroup {
    pub cluster: Arc<InMemoryClusterState>,
    pub shards: Arc<LocalShardRegistry>,
    pub primary: Arc<InMemoryPrimaryEngine>,
    pub primary_routing: ShardRouting,
    pub replicas: Vec<(ShardRouting, SegmentReplicationTargetService)>,
}

impl ReplicationGroup {
    pub fn new(replicas: usize) -> Self {
        let cluster = Arc::new(InMemoryClusterState::new());
        let shards = Arc::new(LocalShardRegistry::new());
        let primary = new_primary(1);
        let primary_routing = ShardRouting::primary(shard(), NodeId("node-0".into()));
        cluster.add_shard(primary_routing.clone(), 1);
        shards.register_primary(primary_routing.allocation_id.clone(), primary.clone());

        let source: Arc<dyn ReplicationSource> = Arc::new(PrimaryShardSource::new(primary.clone()));
        let mut copies = Vec::with_capacity(replicas);
        for i in 0..replicas {
            let routing = ShardRouting::replica(shard(), NodeId(format!("node-{}", i + 1)));
            cluster.add_replica(routing.clone()).unwrap();
            let service =
                SegmentReplicationTargetService::new(routing.allocation_id.clone(), new_replica_engine(), Arc::clone(&source));
            shards.register_replica(service.clone());
            copies.push((routing, service));
        }
        Self {
            cluster,
            shards,
            primary,
            primary_routing,
            replicas: copies,
        }
    }

    pub fn primary_source(&self) -> Arc<dyn ReplicationSource> {
        Arc::new(PrimaryShardSource::new(self.primary.clone()))
    }
}
