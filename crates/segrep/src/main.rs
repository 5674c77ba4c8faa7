#![warn(missing_docs)]

//! `segrep-node`: runs a primary and its replicas in one process, indexes
//! documents across several refreshes, and prints where every copy ended up.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use segrep::action::{CheckpointDispatcher, InMemoryClusterState, LocalShardRegistry};
use segrep::checkpoint::ReplicationCheckpoint;
use segrep::config::SegrepConfig;
use segrep::directory::InMemoryDirectory;
use segrep::engine::{Document, InMemoryPrimaryEngine, NrtReplicationEngine, PrimaryEngine};
use segrep::pressure::{PressureService, PressureStats};
use segrep::publisher::{checkpoint_channel, PublishingShard};
use segrep::remote::{
    BlobContainer, FsBlobStore, InMemoryBlobStore, LockManagerFactory, RemoteSegmentStoreDirectory, RemoteShardPath,
    Repository, RepositoryRegistry,
};
use segrep::replication::{PrimaryShardSource, RemoteStoreSource, ReplicationSource, SegmentReplicationTargetService};
use segrep::shard::{NodeId, ShardId, ShardRouting};
use segrep::telemetry;

/// Command line; flags override the config file.
#[derive(Debug, Parser)]
#[command(name = "segrep-node", about = "Segment replication demo node")]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Replica copies.
    #[arg(long, default_value_t = 2)]
    replicas: usize,
    /// Documents to index in total.
    #[arg(long, default_value_t = 100)]
    docs: usize,
    /// Refreshes to spread the documents over.
    #[arg(long, default_value_t = 5)]
    refreshes: usize,
    /// Directory for a filesystem remote store; enables the remote store.
    #[arg(long)]
    remote_path: Option<PathBuf>,
    /// Seconds to wait for replicas to converge.
    #[arg(long, default_value_t = 30)]
    wait_secs: u64,
    /// Log as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[derive(Debug, Serialize)]
struct PrimarySummary {
    primary_term: u64,
    generation: u64,
    version: u64,
    doc_count: u64,
    checkpoints_published: u64,
}

#[derive(Debug, Serialize)]
struct ReplicaSummary {
    allocation_id: String,
    source: String,
    generation: u64,
    version: u64,
    doc_count: u64,
    rounds_applied: u64,
    files_fetched: u64,
    bytes_fetched: u64,
}

#[derive(Debug, Serialize)]
struct RemoteSummary {
    metadata_files: usize,
    gc_deleted_generations: Vec<u64>,
    gc_deleted_blobs: usize,
}

#[derive(Debug, Serialize)]
struct DispatchSummary {
    received: u64,
    dispatched: u64,
    failed: u64,
    replica_failures: u64,
}

#[derive(Debug, Serialize)]
struct NodeSummary {
    shard: String,
    primary: PrimarySummary,
    replicas: Vec<ReplicaSummary>,
    dispatch: DispatchSummary,
    remote: Option<RemoteSummary>,
    pressure: PressureStats,
}

/// The primary as the publisher sees it.
struct PrimaryShard {
    shard_id: ShardId,
    targets: bool,
    published: AtomicU64,
}

impl PublishingShard for PrimaryShard {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn is_primary(&self) -> bool {
        true
    }

    fn has_replication_targets(&self) -> bool {
        self.targets
    }

    fn on_checkpoint_published(&self, checkpoint: &ReplicationCheckpoint) {
        self.published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(checkpoint = %checkpoint.key(), "checkpoint published");
    }
}

async fn open_remote_store(
    config: &SegrepConfig,
    remote_path: Option<&PathBuf>,
    shard: &ShardId,
) -> Result<Arc<RemoteSegmentStoreDirectory>> {
    let container: Arc<dyn BlobContainer> = match remote_path {
        Some(path) => Arc::new(FsBlobStore::new(path)),
        None => Arc::new(InMemoryBlobStore::new()),
    };
    let repositories = Arc::new(RepositoryRegistry::new());
    let repository = repositories.register(Repository::new(
        config.remote_store.repository.clone(),
        config.remote_store.base_path.clone(),
        container,
    ));
    let locks = LockManagerFactory::new(Arc::clone(&repositories)).new_lock_manager(
        repository.name(),
        &shard.index_uuid,
        shard.shard_num,
    )?;
    let path = RemoteShardPath::new(repository.base_path(), shard.index_uuid.clone(), shard.shard_num);
    let remote = Arc::new(RemoteSegmentStoreDirectory::new(
        repository.container(),
        &path,
        config.node.node_id.clone(),
        config.remote_store.metadata_version,
        locks,
    )?);
    if let Some(md) = remote.init().await? {
        tracing::info!(generation = md.generation(), "remote store has earlier uploads");
    }
    Ok(remote)
}

async fn run(config: SegrepConfig, cli: &Cli) -> Result<NodeSummary> {
    let shard = ShardId::new("demo", uuid::Uuid::new_v4().simple().to_string(), 0);
    let cluster = Arc::new(InMemoryClusterState::new());
    let shards = Arc::new(LocalShardRegistry::new());

    let primary = Arc::new(InMemoryPrimaryEngine::new(
        shard.clone(),
        Arc::new(InMemoryDirectory::new()),
        1,
    )?);
    let primary_routing = ShardRouting::primary(shard.clone(), NodeId(config.node.node_id.clone()));
    cluster.add_shard(primary_routing.clone(), 1);
    shards.register_primary(primary_routing.allocation_id.clone(), primary.clone());

    let remote = if config.remote_store.enabled {
        let remote = open_remote_store(&config, cli.remote_path.as_ref(), &shard).await?;
        shards.attach_remote_store(shard.clone(), Arc::clone(&remote));
        Some(remote)
    } else {
        None
    };

    let pressure = PressureService::new(config.pressure.clone());
    let tracker = pressure.tracker(&shard);
    let peer: Arc<dyn ReplicationSource> = Arc::new(PrimaryShardSource::new(primary.clone()));
    let mut replicas = Vec::with_capacity(cli.replicas);
    for i in 0..cli.replicas {
        let routing = ShardRouting::replica(shard.clone(), NodeId(format!("{}-r{}", config.node.node_id, i)));
        cluster.add_replica(routing.clone())?;
        let engine = Arc::new(NrtReplicationEngine::new(shard.clone(), Arc::new(InMemoryDirectory::new()))?);
        // odd replicas read from the remote store when there is one
        let source: Arc<dyn ReplicationSource> = match &remote {
            Some(remote) if i % 2 == 1 => Arc::new(RemoteStoreSource::new(
                Arc::clone(remote),
                routing.allocation_id.to_string(),
            )),
            _ => Arc::clone(&peer),
        };
        let description = source.description();
        let service = SegmentReplicationTargetService::new(routing.allocation_id.clone(), Arc::clone(&engine), source);
        tracker.track_replica(routing.allocation_id.clone(), engine.subscribe());
        shards.register_replica(service.clone());
        replicas.push((service, description));
    }

    let (publisher, merged_publisher, receiver) = checkpoint_channel(config.replication.checkpoint_channel_capacity);
    let dispatcher = CheckpointDispatcher::new(
        Arc::clone(&shards),
        cluster.clone(),
        config.replication.action_config(),
    );
    dispatcher.track(Arc::clone(&tracker));
    let dispatch_handle = dispatcher.spawn(receiver);

    let publishing = PrimaryShard {
        shard_id: shard.clone(),
        targets: !replicas.is_empty() || remote.is_some(),
        published: AtomicU64::new(0),
    };
    let refreshes = cli.refreshes.max(1);
    let per_refresh = cli.docs.div_ceil(refreshes);
    let mut indexed = 0;
    for round in 0..refreshes {
        if let Err(e) = pressure.check(&shard) {
            tracing::warn!(round, error = %e, "replicas are behind, backing off");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        for _ in 0..per_refresh.min(cli.docs - indexed) {
            primary.index(Document::new(indexed.to_string(), format!("{{\"round\":{}}}", round)));
            indexed += 1;
        }
        if let Some(checkpoint) = primary.refresh()? {
            publisher.publish(&publishing, checkpoint).await?;
        }
    }
    if let Some(merged) = primary.merge()? {
        merged_publisher.publish(&publishing, merged).await?;
        // replicas serve the merged generation once it is published as a refresh
        publisher.publish(&publishing, primary.current_manifest()?.checkpoint).await?;
    }
    drop(publisher);
    drop(merged_publisher);
    let dispatch = dispatch_handle.await.context("dispatcher task")?;

    let manifest = primary.current_manifest()?;
    let target = manifest.checkpoint.key();
    for (service, _) in &replicas {
        service
            .wait_for(target, Duration::from_secs(cli.wait_secs))
            .await
            .with_context(|| format!("replica {} did not converge", service.allocation_id()))?;
    }

    let mut replica_summaries = Vec::with_capacity(replicas.len());
    for (service, source) in &replicas {
        let view = service.engine().acquire()?;
        let stats = service.stats();
        replica_summaries.push(ReplicaSummary {
            allocation_id: service.allocation_id().to_string(),
            source: source.clone(),
            generation: view.generation(),
            version: view.key().version,
            doc_count: view.doc_count(),
            rounds_applied: stats.rounds_applied,
            files_fetched: stats.files_fetched,
            bytes_fetched: stats.bytes_fetched,
        });
    }

    let remote_summary = match &remote {
        Some(remote) => {
            let plan = remote.delete_stale_segments(2).await?;
            Some(RemoteSummary {
                metadata_files: remote.list_metadata_files().await?.len(),
                gc_deleted_generations: plan.deletable_generations,
                gc_deleted_blobs: plan.deletable_blobs.len(),
            })
        }
        None => None,
    };

    for (service, _) in &replicas {
        service.close();
    }

    Ok(NodeSummary {
        shard: shard.to_string(),
        primary: PrimarySummary {
            primary_term: manifest.primary_term(),
            generation: manifest.generation(),
            version: manifest.checkpoint.version,
            doc_count: primary.doc_count(),
            checkpoints_published: publishing.published.load(Ordering::Relaxed),
        },
        replicas: replica_summaries,
        dispatch: DispatchSummary {
            received: dispatch.received,
            dispatched: dispatch.dispatched,
            failed: dispatch.failed,
            replica_failures: dispatch.replica_failures,
        },
        remote: remote_summary,
        pressure: pressure.stats(),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.json_logs {
        telemetry::init_tracing_json();
    } else {
        telemetry::init_tracing();
    }

    let mut config = match &cli.config {
        Some(path) => SegrepConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => SegrepConfig::default(),
    };
    if cli.remote_path.is_some() {
        config.remote_store.enabled = true;
    }
    config.validate()?;

    tracing::info!(node = %config.node.node_id, replicas = cli.replicas, docs = cli.docs, "segrep node starting");
    let summary = run(config, &cli).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
