//! Where replicas fetch segment files from.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::checkpoint::{ReplicationCheckpoint, CURRENT_CODEC_VERSION};
use crate::engine::PrimaryEngine;
use crate::error::{SegrepError, SegrepResult};
use crate::manifest::{SegmentInfos, SegmentManifest, StoreFileMetadata};
use crate::remote::lock::LockGuard;
use crate::remote::metadata::{RemoteSegmentMetadata, UploadedSegmentMetadata};
use crate::remote::store::RemoteSegmentStoreDirectory;

/// What a source offers for one replication round.
#[derive(Debug)]
pub struct CheckpointInfo {
    /// The state to apply; may be newer than the one requested.
    pub manifest: SegmentManifest,
    /// Physical names, for remote sources.
    pub uploaded: BTreeMap<String, UploadedSegmentMetadata>,
    /// Lock pinning the state in the remote store for the round.
    pub lock: Option<LockGuard>,
}

/// A provider of checkpoint manifests and segment files.
#[async_trait]
pub trait ReplicationSource: Send + Sync {
    /// Human-readable description for logs.
    fn description(&self) -> String;

    /// The manifest to replicate towards `checkpoint`.
    async fn get_checkpoint_info(&self, checkpoint: &ReplicationCheckpoint) -> SegrepResult<CheckpointInfo>;

    /// Contents of one file listed in `info`.
    async fn get_file(&self, info: &CheckpointInfo, file: &StoreFileMetadata) -> SegrepResult<Bytes>;
}

/// Peer copy straight from the primary's local directory.
pub struct PrimaryShardSource {
    primary: Arc<dyn PrimaryEngine>,
}

impl PrimaryShardSource {
    /// Create a source reading from `primary`.
    pub fn new(primary: Arc<dyn PrimaryEngine>) -> Self {
        Self { primary }
    }
}

#[async_trait]
impl ReplicationSource for PrimaryShardSource {
    fn description(&self) -> String {
        format!("primary {}", self.primary.shard_id())
    }

    async fn get_checkpoint_info(&self, checkpoint: &ReplicationCheckpoint) -> SegrepResult<CheckpointInfo> {
        let term = self.primary.primary_term();
        if checkpoint.primary_term > term {
            return Err(SegrepError::ShardNotPrimary {
                shard: self.primary.shard_id().clone(),
                expected_term: checkpoint.primary_term,
                actual_term: term,
            });
        }
        let manifest = self.primary.current_manifest()?;
        if manifest.checkpoint.shard_id != checkpoint.shard_id {
            return Err(SegrepError::Config {
                reason: format!(
                    "source serves {} but {} was requested",
                    manifest.checkpoint.shard_id, checkpoint.shard_id
                ),
            });
        }
        debug!(requested = %checkpoint.key(), offered = %manifest.checkpoint.key(), "primary checkpoint info");
        Ok(CheckpointInfo {
            manifest,
            uploaded: BTreeMap::new(),
            lock: None,
        })
    }

    async fn get_file(&self, _info: &CheckpointInfo, file: &StoreFileMetadata) -> SegrepResult<Bytes> {
        self.primary.directory().read_file(&file.name)
    }
}

/// Copy from the remote store's latest metadata.
pub struct RemoteStoreSource {
    remote: Arc<RemoteSegmentStoreDirectory>,
    owner: String,
}

impl RemoteStoreSource {
    /// Create a source; `owner` names this reader's locks.
    pub fn new(remote: Arc<RemoteSegmentStoreDirectory>, owner: impl Into<String>) -> Self {
        Self {
            remote,
            owner: owner.into(),
        }
    }

    fn manifest_of(requested: &ReplicationCheckpoint, md: &RemoteSegmentMetadata) -> SegrepResult<SegmentManifest> {
        let infos = SegmentInfos::from_bytes(&md.segment_infos_bytes)?;
        let checkpoint = match &md.checkpoint {
            Some(cp) => cp.clone(),
            None => {
                let files = md
                    .metadata
                    .iter()
                    .map(|(name, m)| (name.clone(), m.to_store_file_metadata()))
                    .collect();
                ReplicationCheckpoint::new(
                    requested.shard_id.clone(),
                    md.primary_term,
                    md.generation,
                    infos.version,
                    CURRENT_CODEC_VERSION,
                    files,
                )
            }
        };
        SegmentManifest::new(checkpoint, infos)
    }
}

#[async_trait]
impl ReplicationSource for RemoteStoreSource {
    fn description(&self) -> String {
        format!("remote store ({:?})", self.remote)
    }

    async fn get_checkpoint_info(&self, checkpoint: &ReplicationCheckpoint) -> SegrepResult<CheckpointInfo> {
        let Some((name, _)) = self.remote.read_latest_metadata().await? else {
            return Err(SegrepError::BlobNotFound {
                path: "latest segment metadata".to_string(),
            });
        };
        let lock = self
            .remote
            .lock_manager()
            .acquire_scoped(name.generation, &self.owner)
            .await?;
        // re-read under the lock; a sweep may have removed it in between
        let md = match self.remote.read_metadata(&name).await {
            Ok(md) => md,
            Err(e) => {
                lock.release().await?;
                return Err(e);
            }
        };
        let manifest = match Self::manifest_of(checkpoint, &md) {
            Ok(m) => m,
            Err(e) => {
                lock.release().await?;
                return Err(e);
            }
        };
        debug!(metadata = %name, offered = %manifest.checkpoint.key(), "remote checkpoint info");
        Ok(CheckpointInfo {
            manifest,
            uploaded: md.metadata,
            lock: Some(lock),
        })
    }

    async fn get_file(&self, info: &CheckpointInfo, file: &StoreFileMetadata) -> SegrepResult<Bytes> {
        let uploaded = info.uploaded.get(&file.name).ok_or_else(|| SegrepError::FileNotFound {
            name: file.name.clone(),
        })?;
        self.remote.download_file(uploaded).await
    }
}
