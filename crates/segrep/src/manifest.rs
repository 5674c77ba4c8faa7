//! Segment-file manifests.
//!
//! A [`SegmentManifest`] is what a replica applies: the checkpoint that names
//! the state plus the writer's segment list ([`SegmentInfos`]) that says which
//! files make up each searchable segment.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::checkpoint::ReplicationCheckpoint;
use crate::error::{SegrepError, SegrepResult};

/// Length, checksum and writer version of one segment file.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    /// Logical file name, e.g. `_3.seg`.
    pub name: String,
    /// Length in bytes.
    pub length: u64,
    /// CRC32 of the file contents.
    pub checksum: u64,
    /// Major codec version of the writer.
    pub written_by: u32,
}

impl StoreFileMetadata {
    /// Create file metadata.
    pub fn new(name: impl Into<String>, length: u64, checksum: u64, written_by: u32) -> Self {
        Self {
            name: name.into(),
            length,
            checksum,
            written_by,
        }
    }

    /// Compute metadata for `data`.
    pub fn of(name: impl Into<String>, data: &[u8], written_by: u32) -> Self {
        Self::new(name, data.len() as u64, checksum(data), written_by)
    }

    /// True if `other` describes identical contents.
    pub fn is_same(&self, other: &StoreFileMetadata) -> bool {
        self.length == other.length && self.checksum == other.checksum
    }

    /// Check `data` against this metadata.
    pub fn verify(&self, data: &[u8]) -> SegrepResult<()> {
        if data.len() as u64 != self.length {
            return Err(SegrepError::corrupt(format!(
                "length mismatch on [{}]: expected {}, actual {}",
                self.name,
                self.length,
                data.len()
            )));
        }
        let actual = checksum(data);
        if actual != self.checksum {
            return Err(SegrepError::corrupt(format!(
                "checksum mismatch on [{}]: expected {:#x}, actual {:#x}",
                self.name, self.checksum, actual
            )));
        }
        Ok(())
    }
}

/// Checksum used for every segment file.
pub fn checksum(data: &[u8]) -> u64 {
    crc32fast::hash(data) as u64
}

/// One searchable segment and the files it consists of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment name, e.g. `_3`.
    pub name: String,
    /// Live documents in the segment.
    pub doc_count: u64,
    /// Files of the segment.
    pub files: Vec<String>,
}

/// The writer's commit point: the ordered list of live segments.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SegmentInfos {
    /// Generation of this commit point.
    pub generation: u64,
    /// Version of the segment set.
    pub version: u64,
    /// Live segments, oldest first.
    pub segments: Vec<SegmentInfo>,
}

impl SegmentInfos {
    /// All files referenced by the segments.
    pub fn files(&self) -> impl Iterator<Item = &str> {
        self.segments
            .iter()
            .flat_map(|s| s.files.iter().map(String::as_str))
    }

    /// Total live documents.
    pub fn doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count).sum()
    }

    /// Encode to the low-level segment-list blob.
    pub fn to_bytes(&self) -> SegrepResult<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    /// Decode the low-level segment-list blob.
    pub fn from_bytes(data: &[u8]) -> SegrepResult<Self> {
        bincode::deserialize(data)
            .map_err(|e| SegrepError::corrupt(format!("unreadable segment infos: {}", e)))
    }
}

/// A complete, self-consistent state a replica can switch to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentManifest {
    /// The state's identity and file metadata.
    pub checkpoint: ReplicationCheckpoint,
    /// The segment list.
    pub infos: SegmentInfos,
}

impl SegmentManifest {
    /// Build a manifest, checking that every file the segment list references
    /// is described by the checkpoint.
    pub fn new(checkpoint: ReplicationCheckpoint, infos: SegmentInfos) -> SegrepResult<Self> {
        let manifest = Self { checkpoint, infos };
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> SegrepResult<()> {
        if self.infos.generation != self.checkpoint.segments_generation {
            return Err(SegrepError::corrupt(format!(
                "segment infos generation {} does not match checkpoint generation {}",
                self.infos.generation, self.checkpoint.segments_generation
            )));
        }
        for file in self.infos.files() {
            if !self.checkpoint.metadata_map.contains_key(file) {
                return Err(SegrepError::corrupt(format!(
                    "segment file [{}] missing from checkpoint metadata",
                    file
                )));
            }
        }
        Ok(())
    }

    /// Generation of this manifest.
    pub fn generation(&self) -> u64 {
        self.checkpoint.segments_generation
    }

    /// Primary term of this manifest.
    pub fn primary_term(&self) -> u64 {
        self.checkpoint.primary_term
    }

    /// Names of all files the manifest references.
    pub fn file_names(&self) -> Vec<String> {
        self.checkpoint.metadata_map.keys().cloned().collect()
    }
}

/// Result of comparing a source file set against a target file set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationDiff {
    /// Files the target lacks.
    pub missing: Vec<StoreFileMetadata>,
    /// Files both have, with different contents.
    pub different: Vec<StoreFileMetadata>,
    /// Files both have with identical contents.
    pub identical: Vec<StoreFileMetadata>,
}

impl ReplicationDiff {
    /// Files the target must fetch.
    pub fn to_fetch(&self) -> Vec<StoreFileMetadata> {
        self.missing
            .iter()
            .chain(self.different.iter())
            .cloned()
            .collect()
    }
}

/// Compare `source` (what the primary has) with `target` (what the replica has).
pub fn segment_replication_diff(
    source: &BTreeMap<String, StoreFileMetadata>,
    target: &BTreeMap<String, StoreFileMetadata>,
) -> ReplicationDiff {
    let mut diff = ReplicationDiff::default();
    for (name, meta) in source {
        match target.get(name) {
            None => diff.missing.push(meta.clone()),
            Some(existing) if existing.is_same(meta) => diff.identical.push(meta.clone()),
            Some(_) => diff.different.push(meta.clone()),
        }
    }
    diff
}
