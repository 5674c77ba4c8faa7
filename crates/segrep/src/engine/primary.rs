//! Primary-side engine collaborator.
//!
//! Segment production (flush, merge) belongs to the primary's indexing engine;
//! replication only needs `refresh()` and `current_manifest()`. The in-memory
//! engine here writes each refresh as one immutable segment file.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::checkpoint::{MergedSegmentCheckpoint, ReplicationCheckpoint, CURRENT_CODEC_VERSION};
use crate::directory::Directory;
use crate::engine::{decode_segment, encode_segment, Document};
use crate::error::{SegrepError, SegrepResult};
use crate::manifest::{SegmentInfo, SegmentInfos, SegmentManifest, StoreFileMetadata};
use crate::shard::ShardId;

/// What replication needs from a primary's engine.
pub trait PrimaryEngine: Send + Sync {
    /// The shard.
    fn shard_id(&self) -> &ShardId;
    /// Term this engine writes under.
    fn primary_term(&self) -> u64;
    /// Make buffered operations durable as a new generation. Returns the new
    /// checkpoint, or `None` if there was nothing to refresh.
    fn refresh(&self) -> SegrepResult<Option<ReplicationCheckpoint>>;
    /// The latest durable state.
    fn current_manifest(&self) -> SegrepResult<SegmentManifest>;
    /// Directory holding the engine's segment files.
    fn directory(&self) -> Arc<dyn Directory>;
}

struct PrimaryState {
    primary_term: u64,
    buffer: Vec<Document>,
    infos: SegmentInfos,
    files: BTreeMap<String, StoreFileMetadata>,
    next_segment: u64,
    manifest: SegmentManifest,
}

impl PrimaryState {
    fn commit(&mut self, shard_id: &ShardId) -> SegrepResult<ReplicationCheckpoint> {
        let checkpoint = ReplicationCheckpoint::new(
            shard_id.clone(),
            self.primary_term,
            self.infos.generation,
            self.infos.version,
            CURRENT_CODEC_VERSION,
            self.files.clone(),
        );
        self.manifest = SegmentManifest::new(checkpoint.clone(), self.infos.clone())?;
        Ok(checkpoint)
    }
}

/// Reference engine writing bincode segment files into a [`Directory`].
pub struct InMemoryPrimaryEngine {
    shard_id: ShardId,
    directory: Arc<dyn Directory>,
    state: Mutex<PrimaryState>,
}

impl InMemoryPrimaryEngine {
    /// Start an empty primary at `primary_term`.
    pub fn new(shard_id: ShardId, directory: Arc<dyn Directory>, primary_term: u64) -> SegrepResult<Self> {
        let mut checkpoint = ReplicationCheckpoint::empty(shard_id.clone());
        checkpoint.primary_term = primary_term;
        let manifest = SegmentManifest::new(checkpoint, SegmentInfos::default())?;
        Self::open(shard_id, directory, primary_term, manifest)
    }

    /// Open a primary over an existing manifest, e.g. a promoted replica's
    /// last applied state. The manifest's files must be in `directory`.
    pub fn open(
        shard_id: ShardId,
        directory: Arc<dyn Directory>,
        primary_term: u64,
        manifest: SegmentManifest,
    ) -> SegrepResult<Self> {
        if primary_term < manifest.primary_term() {
            return Err(SegrepError::Config {
                reason: format!(
                    "cannot open primary at term {} over state from term {}",
                    primary_term,
                    manifest.primary_term()
                ),
            });
        }
        for (name, meta) in &manifest.checkpoint.metadata_map {
            meta.verify(&directory.read_file(name)?)?;
        }
        let next_segment = manifest
            .infos
            .segments
            .iter()
            .filter_map(|s| s.name.trim_start_matches('_').parse::<u64>().ok())
            .max()
            .map_or(0, |n| n + 1);
        info!(shard = %shard_id, primary_term, generation = manifest.generation(), "opened primary engine");
        Ok(Self {
            shard_id,
            directory,
            state: Mutex::new(PrimaryState {
                primary_term,
                buffer: Vec::new(),
                infos: manifest.infos.clone(),
                files: manifest.checkpoint.metadata_map.clone(),
                next_segment,
                manifest,
            }),
        })
    }

    /// Buffer a document until the next refresh.
    pub fn index(&self, doc: Document) {
        self.state.lock().buffer.push(doc);
    }

    /// Documents buffered but not yet refreshed.
    pub fn buffered_docs(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Raise the term this engine writes under.
    pub fn set_primary_term(&self, primary_term: u64) -> SegrepResult<()> {
        let mut state = self.state.lock();
        if primary_term < state.primary_term {
            return Err(SegrepError::Config {
                reason: format!(
                    "primary term cannot move backwards from {} to {}",
                    state.primary_term, primary_term
                ),
            });
        }
        state.primary_term = primary_term;
        Ok(())
    }

    /// Compact every live segment into one. Returns the merged segment's
    /// checkpoint; the merge is itself committed as a new generation.
    pub fn merge(&self) -> SegrepResult<Option<MergedSegmentCheckpoint>> {
        let mut state = self.state.lock();
        if state.infos.segments.len() < 2 {
            return Ok(None);
        }
        let mut docs = Vec::new();
        for segment in &state.infos.segments {
            for file in &segment.files {
                docs.extend(decode_segment(file, &self.directory.read_file(file)?)?);
            }
        }
        let segment_name = format!("_{}", state.next_segment);
        let file_name = format!("{}.seg", segment_name);
        let data = encode_segment(&docs)?;
        self.directory.write_file(&file_name, &data)?;
        let merged_meta = StoreFileMetadata::of(file_name.clone(), &data, CURRENT_CODEC_VERSION);

        let old_files: Vec<String> = state.files.keys().cloned().collect();
        state.next_segment += 1;
        state.infos.segments = vec![SegmentInfo {
            name: segment_name.clone(),
            doc_count: docs.len() as u64,
            files: vec![file_name.clone()],
        }];
        state.infos.generation += 1;
        state.infos.version += 1;
        state.files = BTreeMap::from([(file_name.clone(), merged_meta.clone())]);
        let checkpoint = state.commit(&self.shard_id)?;
        for name in old_files {
            self.directory.delete_file(&name)?;
        }

        let merged = ReplicationCheckpoint::new(
            self.shard_id.clone(),
            checkpoint.primary_term,
            checkpoint.segments_generation,
            checkpoint.version,
            checkpoint.codec_version,
            BTreeMap::from([(file_name, merged_meta)]),
        );
        info!(shard = %self.shard_id, segment = %segment_name, docs = docs.len(), "merged segments");
        Ok(Some(MergedSegmentCheckpoint::new(merged, segment_name)))
    }

    /// Live documents in the latest durable state.
    pub fn doc_count(&self) -> u64 {
        self.state.lock().infos.doc_count()
    }
}

impl PrimaryEngine for InMemoryPrimaryEngine {
    fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    fn primary_term(&self) -> u64 {
        self.state.lock().primary_term
    }

    fn refresh(&self) -> SegrepResult<Option<ReplicationCheckpoint>> {
        let mut state = self.state.lock();
        if state.buffer.is_empty() {
            return Ok(None);
        }
        let docs = std::mem::take(&mut state.buffer);
        let segment_name = format!("_{}", state.next_segment);
        let file_name = format!("{}.seg", segment_name);
        let data = encode_segment(&docs)?;
        self.directory.write_file(&file_name, &data)?;

        state.next_segment += 1;
        state.infos.segments.push(SegmentInfo {
            name: segment_name,
            doc_count: docs.len() as u64,
            files: vec![file_name.clone()],
        });
        state.infos.generation += 1;
        state.infos.version += docs.len() as u64;
        state.files.insert(
            file_name.clone(),
            StoreFileMetadata::of(file_name, &data, CURRENT_CODEC_VERSION),
        );
        let checkpoint = state.commit(&self.shard_id)?;
        debug!(shard = %self.shard_id, checkpoint = %checkpoint.key(), docs = docs.len(), "refreshed");
        Ok(Some(checkpoint))
    }

    fn current_manifest(&self) -> SegrepResult<SegmentManifest> {
        Ok(self.state.lock().manifest.clone())
    }

    fn directory(&self) -> Arc<dyn Directory> {
        Arc::clone(&self.directory)
    }
}

impl std::fmt::Debug for InMemoryPrimaryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryPrimaryEngine")
            .field("shard_id", &self.shard_id)
            .finish()
    }
}
