//! Replication checkpoints: the totally ordered identity of one durable state
//! of a shard's segment set.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::codec::{StreamInput, StreamOutput};
use crate::error::SegrepResult;
use crate::manifest::StoreFileMetadata;
use crate::shard::ShardId;

/// Codec version written by the current segment writer.
pub const CURRENT_CODEC_VERSION: u32 = 10;

/// `(primary_term, segments_generation, version)`, compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct CheckpointKey {
    /// Primary term.
    pub primary_term: u64,
    /// Segments generation.
    pub segments_generation: u64,
    /// Segment-set version.
    pub version: u64,
}

impl fmt::Display for CheckpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.primary_term, self.segments_generation, self.version
        )
    }
}

/// One durable, replicable state of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationCheckpoint {
    /// Shard this state belongs to.
    pub shard_id: ShardId,
    /// Term of the primary that produced this state.
    pub primary_term: u64,
    /// Generation assigned by the segment writer.
    pub segments_generation: u64,
    /// Number of operations reflected; increases within a generation.
    pub version: u64,
    /// Total byte size of the referenced files.
    pub length: u64,
    /// Segment format version of the writer.
    pub codec_version: u32,
    /// Files referenced by this state, keyed by logical name.
    #[serde(default)]
    pub metadata_map: BTreeMap<String, StoreFileMetadata>,
}

impl ReplicationCheckpoint {
    /// Create a checkpoint; `length` is computed from `metadata_map`.
    pub fn new(
        shard_id: ShardId,
        primary_term: u64,
        segments_generation: u64,
        version: u64,
        codec_version: u32,
        metadata_map: BTreeMap<String, StoreFileMetadata>,
    ) -> Self {
        let length = metadata_map.values().map(|m| m.length).sum();
        Self {
            shard_id,
            primary_term,
            segments_generation,
            version,
            length,
            codec_version,
            metadata_map,
        }
    }

    /// The state of a shard with no generation loaded.
    pub fn empty(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            primary_term: 0,
            segments_generation: 0,
            version: 0,
            length: 0,
            codec_version: CURRENT_CODEC_VERSION,
            metadata_map: BTreeMap::new(),
        }
    }

    /// Ordering key of this checkpoint.
    pub fn key(&self) -> CheckpointKey {
        CheckpointKey {
            primary_term: self.primary_term,
            segments_generation: self.segments_generation,
            version: self.version,
        }
    }

    /// True if this checkpoint is strictly newer than `other`.
    ///
    /// A higher primary term always wins: a new primary's lineage may restart
    /// generation numbering below what the old primary reached.
    pub fn is_ahead_of(&self, other: &ReplicationCheckpoint) -> bool {
        self.key() > other.key()
    }

    /// True if this checkpoint references no files.
    pub fn is_empty(&self) -> bool {
        self.segments_generation == 0 && self.metadata_map.is_empty()
    }

    /// Write the wire format: shard id, then term, generation, version,
    /// length and codec version as varints. The file map is not part of it.
    pub fn write_to(&self, out: &mut StreamOutput) {
        out.write_string(&self.shard_id.index_name);
        out.write_string(&self.shard_id.index_uuid);
        out.write_vint(self.shard_id.shard_num);
        out.write_vlong(self.primary_term);
        out.write_vlong(self.segments_generation);
        out.write_vlong(self.version);
        out.write_vlong(self.length);
        out.write_vint(self.codec_version);
    }

    /// Read the wire format written by [`write_to`](Self::write_to).
    pub fn read_from(input: &mut StreamInput) -> SegrepResult<Self> {
        let index_name = input.read_string()?;
        let index_uuid = input.read_string()?;
        let shard_num = input.read_vint()?;
        Ok(Self {
            shard_id: ShardId::new(index_name, index_uuid, shard_num),
            primary_term: input.read_vlong()?,
            segments_generation: input.read_vlong()?,
            version: input.read_vlong()?,
            length: input.read_vlong()?,
            codec_version: input.read_vint()?,
            metadata_map: BTreeMap::new(),
        })
    }

    /// Encode to standalone wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = StreamOutput::new();
        self.write_to(&mut out);
        out.freeze()
    }

    /// Decode standalone wire bytes.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> SegrepResult<Self> {
        let mut input = StreamInput::new(bytes);
        Self::read_from(&mut input)
    }
}

impl fmt::Display for ReplicationCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ReplicationCheckpoint{{shard={}, term={}, gen={}, version={}, size={}, codec={}}}",
            self.shard_id,
            self.primary_term,
            self.segments_generation,
            self.version,
            self.length,
            self.codec_version
        )
    }
}

/// Checkpoint produced by a segment merge: the compacted files of one merged
/// segment, pre-copied to replicas before they become part of a visible
/// generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedSegmentCheckpoint {
    /// The merged segment's files and the primary state they were produced in.
    pub checkpoint: ReplicationCheckpoint,
    /// Name of the merged segment, e.g. `_4`.
    pub segment_name: String,
}

impl MergedSegmentCheckpoint {
    /// Create a merged segment checkpoint.
    pub fn new(checkpoint: ReplicationCheckpoint, segment_name: impl Into<String>) -> Self {
        Self {
            checkpoint,
            segment_name: segment_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardId {
        ShardId::new("logs", "uuid-1", 0)
    }

    fn cp(term: u64, gen: u64, version: u64) -> ReplicationCheckpoint {
        ReplicationCheckpoint::new(shard(), term, gen, version, CURRENT_CODEC_VERSION, BTreeMap::new())
    }

    mod ordering {
        use super::*;

        #[test]
        fn test_generation_then_version() {
            assert!(cp(1, 6, 11).is_ahead_of(&cp(1, 5, 10)));
            assert!(cp(1, 5, 11).is_ahead_of(&cp(1, 5, 10)));
            assert!(!cp(1, 5, 10).is_ahead_of(&cp(1, 5, 10)));
            assert!(!cp(1, 5, 10).is_ahead_of(&cp(1, 6, 11)));
        }

        #[test]
        fn test_higher_term_resets_lineage() {
            assert!(cp(2, 1, 1).is_ahead_of(&cp(1, 50, 900)));
            assert!(!cp(1, 50, 900).is_ahead_of(&cp(2, 1, 1)));
        }

        #[test]
        fn test_empty_is_behind_everything() {
            let empty = ReplicationCheckpoint::empty(shard());
            assert!(empty.is_empty());
            assert!(cp(1, 1, 1).is_ahead_of(&empty));
        }

        #[test]
        fn test_key_display() {
            assert_eq!(cp(1, 5, 10).key().to_string(), "1/5/10");
        }
    }

    mod wire {
        use super::*;

        #[test]
        fn test_wire_roundtrip_drops_file_map() {
            let mut files = BTreeMap::new();
            files.insert(
                "_0.cfs".to_string(),
                StoreFileMetadata::new("_0.cfs", 120, 0xdead, CURRENT_CODEC_VERSION),
            );
            let original =
                ReplicationCheckpoint::new(shard(), 3, 5, 10, CURRENT_CODEC_VERSION, files);
            assert_eq!(original.length, 120);

            let decoded = ReplicationCheckpoint::from_bytes(original.to_bytes()).unwrap();
            assert_eq!(decoded.key(), original.key());
            assert_eq!(decoded.length, 120);
            assert_eq!(decoded.shard_id, original.shard_id);
            assert!(decoded.metadata_map.is_empty());
        }

        #[test]
        fn test_wire_field_order() {
            let bytes = cp(1, 2, 3).to_bytes();
            let mut input = StreamInput::new(bytes);
            assert_eq!(input.read_string().unwrap(), "logs");
            assert_eq!(input.read_string().unwrap(), "uuid-1");
            assert_eq!(input.read_vint().unwrap(), 0);
            assert_eq!(input.read_vlong().unwrap(), 1);
            assert_eq!(input.read_vlong().unwrap(), 2);
            assert_eq!(input.read_vlong().unwrap(), 3);
            assert_eq!(input.read_vlong().unwrap(), 0);
            assert_eq!(input.read_vint().unwrap(), CURRENT_CODEC_VERSION);
            assert_eq!(input.remaining(), 0);
        }

        #[test]
        fn test_truncated_wire() {
            let bytes = cp(1, 2, 3).to_bytes();
            let truncated = bytes.slice(0..bytes.len() - 1);
            assert!(ReplicationCheckpoint::from_bytes(truncated).is_err());
        }
    }

    #[test]
    fn test_merged_checkpoint() {
        let merged = MergedSegmentCheckpoint::new(cp(1, 5, 10), "_4");
        assert_eq!(merged.segment_name, "_4");
        assert_eq!(merged.checkpoint.segments_generation, 5);
    }

    #[test]
    fn test_display() {
        let s = cp(1, 5, 10).to_string();
        assert!(s.contains("gen=5"));
        assert!(s.contains("[logs][0]"));
    }
}
