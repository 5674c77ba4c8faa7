//! Remote segment store directory: one shard's segment files and metadata in
//! a blob store.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info};

use crate::directory::Directory;
use crate::error::{SegrepError, SegrepResult};
use crate::manifest::SegmentManifest;
use crate::remote::blob::BlobContainer;
use crate::remote::gc::{GcPlan, GcSweep};
use crate::remote::lock::RemoteStoreLockManager;
use crate::remote::metadata::{MetadataHandlerRegistry, RemoteSegmentMetadata, UploadedSegmentMetadata};
use crate::remote::path::{file_name, DataCategory, DataType, MetadataFileName, RemoteShardPath, METADATA_PREFIX};

/// Result of one upload.
#[derive(Debug, Clone)]
pub struct UploadResult {
    /// Name of the metadata blob written.
    pub metadata_file: MetadataFileName,
    /// The metadata written.
    pub metadata: RemoteSegmentMetadata,
    /// Data blobs actually transferred; files already uploaded are reused.
    pub files_uploaded: usize,
}

/// Remote store for one shard.
pub struct RemoteSegmentStoreDirectory {
    container: Arc<dyn BlobContainer>,
    data_dir: String,
    metadata_dir: String,
    node_id: String,
    metadata_version: u32,
    handlers: &'static MetadataHandlerRegistry,
    lock_manager: Arc<RemoteStoreLockManager>,
    uploaded: RwLock<BTreeMap<String, UploadedSegmentMetadata>>,
}

impl RemoteSegmentStoreDirectory {
    /// Create a store writing metadata at `metadata_version`.
    pub fn new(
        container: Arc<dyn BlobContainer>,
        shard_path: &RemoteShardPath,
        node_id: impl Into<String>,
        metadata_version: u32,
        lock_manager: Arc<RemoteStoreLockManager>,
    ) -> SegrepResult<Self> {
        let handlers = MetadataHandlerRegistry::shipped();
        handlers.get_handler(metadata_version)?;
        Ok(Self {
            container,
            data_dir: shard_path.prefix(DataCategory::Segments, DataType::Data),
            metadata_dir: shard_path.prefix(DataCategory::Segments, DataType::Metadata),
            node_id: node_id.into(),
            metadata_version,
            handlers,
            lock_manager,
            uploaded: RwLock::new(BTreeMap::new()),
        })
    }

    /// Seed the uploaded-file cache from the latest metadata, so a restarted
    /// primary reuses blobs it already uploaded.
    pub async fn init(&self) -> SegrepResult<Option<RemoteSegmentMetadata>> {
        let latest = self.read_latest_metadata().await?;
        if let Some((name, md)) = &latest {
            *self.uploaded.write() = md.metadata.clone();
            info!(metadata = %name, files = md.metadata.len(), "initialised remote segment store");
        }
        Ok(latest.map(|(_, md)| md))
    }

    /// The lock manager for this shard.
    pub fn lock_manager(&self) -> &Arc<RemoteStoreLockManager> {
        &self.lock_manager
    }

    /// Upload every file of `manifest` not yet in the store, then its metadata.
    pub async fn upload_segments(
        &self,
        manifest: &SegmentManifest,
        directory: &dyn Directory,
    ) -> SegrepResult<UploadResult> {
        let checkpoint = &manifest.checkpoint;
        let mut files = BTreeMap::new();
        let mut files_uploaded = 0;

        for (name, meta) in &checkpoint.metadata_map {
            let cached = self.uploaded.read().get(name).cloned();
            if let Some(existing) = cached {
                if existing.checksum == meta.checksum && existing.length == meta.length {
                    files.insert(name.clone(), existing);
                    continue;
                }
            }
            let data = directory.read_file(name)?;
            meta.verify(&data)?;
            let uploaded = UploadedSegmentMetadata::for_upload(meta);
            self.container
                .put(&format!("{}{}", self.data_dir, uploaded.uploaded_name), data)
                .await?;
            debug!(file = %name, blob = %uploaded.uploaded_name, "uploaded segment file");
            files_uploaded += 1;
            files.insert(name.clone(), uploaded);
        }

        let infos = manifest.infos.to_bytes()?;
        let metadata = if self.metadata_version >= 2 {
            RemoteSegmentMetadata::new(files.clone(), infos, checkpoint.clone())
        } else {
            RemoteSegmentMetadata::without_checkpoint(
                files.clone(),
                infos,
                checkpoint.segments_generation,
                checkpoint.primary_term,
            )
        };
        let metadata_file = MetadataFileName::new(
            checkpoint.primary_term,
            checkpoint.segments_generation,
            now_millis(),
            &self.node_id,
            self.metadata_version,
        )?;
        let encoded = self.handlers.encode(&metadata, self.metadata_version)?;
        self.container
            .put(&format!("{}{}", self.metadata_dir, metadata_file), encoded)
            .await?;
        *self.uploaded.write() = files;

        info!(
            metadata = %metadata_file,
            generation = checkpoint.segments_generation,
            term = checkpoint.primary_term,
            files_uploaded,
            "uploaded segment metadata"
        );
        Ok(UploadResult {
            metadata_file,
            metadata,
            files_uploaded,
        })
    }

    /// Metadata file names, newest first.
    pub async fn list_metadata_files(&self) -> SegrepResult<Vec<MetadataFileName>> {
        let prefix = format!("{}{}", self.metadata_dir, METADATA_PREFIX);
        let mut names = Vec::new();
        for key in self.container.list(&prefix).await? {
            names.push(MetadataFileName::parse(file_name(&key))?);
        }
        Ok(names)
    }

    /// Download and decode one metadata file.
    pub async fn read_metadata(&self, name: &MetadataFileName) -> SegrepResult<RemoteSegmentMetadata> {
        let path = format!("{}{}", self.metadata_dir, name);
        let framed = self.container.get(&path).await?;
        let metadata = self.handlers.decode(&framed).map_err(|e| {
            if e.is_fatal() {
                error!(metadata = %name, error = %e, "unreadable remote segment metadata");
            }
            e
        })?;
        if metadata.generation() != name.generation || metadata.primary_term() != name.primary_term {
            return Err(SegrepError::corrupt(format!(
                "metadata [{}] contents describe term {} generation {}",
                name,
                metadata.primary_term(),
                metadata.generation()
            )));
        }
        Ok(metadata)
    }

    /// The newest metadata file and its contents, if any.
    pub async fn read_latest_metadata(&self) -> SegrepResult<Option<(MetadataFileName, RemoteSegmentMetadata)>> {
        let Some(latest) = self.list_metadata_files().await?.into_iter().next() else {
            return Ok(None);
        };
        let metadata = self.read_metadata(&latest).await?;
        Ok(Some((latest, metadata)))
    }

    /// Download one data blob, verifying length and checksum.
    pub async fn download_file(&self, file: &UploadedSegmentMetadata) -> SegrepResult<Bytes> {
        let data = self
            .container
            .get(&format!("{}{}", self.data_dir, file.uploaded_name))
            .await?;
        file.to_store_file_metadata().verify(&data)?;
        Ok(data)
    }

    /// Delete metadata and blobs outside the newest `keep_last` generations
    /// that no reader holds a lock on.
    pub async fn delete_stale_segments(&self, keep_last: usize) -> SegrepResult<GcPlan> {
        let mut locked = self.lock_manager.locked_generations().await?;
        let mut all = Vec::new();
        for name in self.list_metadata_files().await? {
            let metadata = self.read_metadata(&name).await?;
            all.push((name, metadata));
        }
        let sweep = GcSweep::new(keep_last);
        let mut plan = sweep.plan(&all, &locked);

        // readers may have locked a generation while metadata was read
        let late = self.lock_manager.locked_generations().await?;
        if plan.deletable_generations.iter().any(|g| late.contains_key(g)) {
            debug!(locked = ?late.keys().collect::<Vec<_>>(), "generation locked during sweep, replanning");
            for (generation, owners) in late {
                locked.entry(generation).or_default().extend(owners);
            }
            plan = sweep.plan(&all, &locked);
        }

        for blob in &plan.deletable_blobs {
            self.container.delete(&format!("{}{}", self.data_dir, blob)).await?;
        }
        for name in &plan.deletable_metadata {
            self.container.delete(&format!("{}{}", self.metadata_dir, name)).await?;
        }
        if !plan.is_empty() {
            info!(
                generations = ?plan.deletable_generations,
                blobs = plan.deletable_blobs.len(),
                "deleted stale remote segments"
            );
        }
        Ok(plan)
    }
}

impl std::fmt::Debug for RemoteSegmentStoreDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSegmentStoreDirectory")
            .field("metadata_dir", &self.metadata_dir)
            .field("metadata_version", &self.metadata_version)
            .finish()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
