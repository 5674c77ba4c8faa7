//! Versioned codec for remote segment metadata blobs.
//!
//! A blob is framed by [`crate::codec::write_envelope`] with codec name
//! [`METADATA_CODEC`] and the handler version; the content is produced by the
//! handler for that version.
//!
//! - Version 1: file map, generation, primary term, segment-list blob.
//! - Version 2: file map, full replication checkpoint, segment-list blob.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crate::checkpoint::ReplicationCheckpoint;
use crate::codec::{read_envelope, write_envelope, StreamInput, StreamOutput};
use crate::error::{SegrepError, SegrepResult};
use crate::manifest::StoreFileMetadata;

/// Codec name written into every metadata envelope.
pub const METADATA_CODEC: &str = "segment_md";

/// Version written by default.
pub const CURRENT_METADATA_VERSION: u32 = 2;

/// Every version this build can read and write, oldest first.
pub const SHIPPED_VERSIONS: &[u32] = &[1, 2];

/// Separator inside an encoded [`UploadedSegmentMetadata`].
const FIELD_SEPARATOR: &str = "::";

/// Where one logical segment file lives in the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UploadedSegmentMetadata {
    /// Logical name, e.g. `_3.seg`.
    pub original_name: String,
    /// Physical blob name, `<logical>__<uuid>`.
    pub uploaded_name: String,
    /// CRC32 of the contents.
    pub checksum: u64,
    /// Length in bytes.
    pub length: u64,
    /// Major codec version of the writer.
    pub written_by_major: u32,
}

impl UploadedSegmentMetadata {
    /// Describe `file` under a fresh physical name.
    pub fn for_upload(file: &StoreFileMetadata) -> Self {
        Self {
            original_name: file.name.clone(),
            uploaded_name: format!("{}__{}", file.name, uuid::Uuid::new_v4().simple()),
            checksum: file.checksum,
            length: file.length,
            written_by_major: file.written_by,
        }
    }

    /// Local view of this file.
    pub fn to_store_file_metadata(&self) -> StoreFileMetadata {
        StoreFileMetadata::new(
            self.original_name.clone(),
            self.length,
            self.checksum,
            self.written_by_major,
        )
    }

    /// `original::uploaded::checksum::length::written_by_major`.
    pub fn encode(&self) -> String {
        [
            self.original_name.as_str(),
            self.uploaded_name.as_str(),
            &self.checksum.to_string(),
            &self.length.to_string(),
            &self.written_by_major.to_string(),
        ]
        .join(FIELD_SEPARATOR)
    }

    /// Parse the form written by [`encode`](Self::encode).
    pub fn decode(value: &str) -> SegrepResult<Self> {
        let parts: Vec<&str> = value.split(FIELD_SEPARATOR).collect();
        if parts.len() != 5 {
            return Err(SegrepError::corrupt(format!(
                "uploaded segment metadata has {} fields, expected 5: [{}]",
                parts.len(),
                value
            )));
        }
        let number = |field: &str, raw: &str| -> SegrepResult<u64> {
            raw.parse()
                .map_err(|_| SegrepError::corrupt(format!("invalid {} [{}] in [{}]", field, raw, value)))
        };
        Ok(Self {
            original_name: parts[0].to_string(),
            uploaded_name: parts[1].to_string(),
            checksum: number("checksum", parts[2])?,
            length: number("length", parts[3])?,
            written_by_major: u32::try_from(number("writer version", parts[4])?)
                .map_err(|_| SegrepError::corrupt(format!("writer version out of range in [{}]", value)))?,
        })
    }
}

/// Contents of one metadata blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSegmentMetadata {
    /// Logical name to physical file.
    pub metadata: BTreeMap<String, UploadedSegmentMetadata>,
    /// Embedded segment-list blob; empty when absent.
    pub segment_infos_bytes: Bytes,
    /// Segments generation.
    pub generation: u64,
    /// Primary term.
    pub primary_term: u64,
    /// Full checkpoint; absent in version 1 blobs.
    pub checkpoint: Option<ReplicationCheckpoint>,
}

impl RemoteSegmentMetadata {
    /// Build metadata around a checkpoint. The checkpoint's file map is
    /// replaced by the one derived from `metadata` so both always agree.
    pub fn new(
        metadata: BTreeMap<String, UploadedSegmentMetadata>,
        segment_infos_bytes: Bytes,
        mut checkpoint: ReplicationCheckpoint,
    ) -> Self {
        checkpoint.metadata_map = derive_file_map(&metadata);
        checkpoint.length = checkpoint.metadata_map.values().map(|m| m.length).sum();
        Self {
            generation: checkpoint.segments_generation,
            primary_term: checkpoint.primary_term,
            metadata,
            segment_infos_bytes,
            checkpoint: Some(checkpoint),
        }
    }

    /// Build version-1 style metadata with no checkpoint.
    pub fn without_checkpoint(
        metadata: BTreeMap<String, UploadedSegmentMetadata>,
        segment_infos_bytes: Bytes,
        generation: u64,
        primary_term: u64,
    ) -> Self {
        Self {
            metadata,
            segment_infos_bytes,
            generation,
            primary_term,
            checkpoint: None,
        }
    }

    /// Segments generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Primary term.
    pub fn primary_term(&self) -> u64 {
        self.primary_term
    }

    /// Physical blob names referenced.
    pub fn uploaded_names(&self) -> impl Iterator<Item = &str> {
        self.metadata.values().map(|m| m.uploaded_name.as_str())
    }
}

fn derive_file_map(
    metadata: &BTreeMap<String, UploadedSegmentMetadata>,
) -> BTreeMap<String, StoreFileMetadata> {
    metadata
        .iter()
        .map(|(name, m)| (name.clone(), m.to_store_file_metadata()))
        .collect()
}

fn write_file_map(out: &mut StreamOutput, metadata: &BTreeMap<String, UploadedSegmentMetadata>) {
    let encoded: BTreeMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (k.clone(), v.encode()))
        .collect();
    out.write_string_map(&encoded);
}

fn read_file_map(input: &mut StreamInput) -> SegrepResult<BTreeMap<String, UploadedSegmentMetadata>> {
    let raw = input.read_string_map()?;
    let mut metadata = BTreeMap::new();
    for (name, value) in raw {
        let uploaded = UploadedSegmentMetadata::decode(&value)?;
        if uploaded.original_name != name {
            return Err(SegrepError::corrupt(format!(
                "file map key [{}] does not match entry name [{}]",
                name, uploaded.original_name
            )));
        }
        metadata.insert(name, uploaded);
    }
    Ok(metadata)
}

/// Encoder/decoder for one metadata version.
pub trait MetadataHandler: Send + Sync + std::fmt::Debug {
    /// Version this handler reads and writes.
    fn version(&self) -> u32;
    /// Write `metadata` as content bytes.
    fn write_content(&self, out: &mut StreamOutput, metadata: &RemoteSegmentMetadata) -> SegrepResult<()>;
    /// Read content bytes written by [`write_content`](Self::write_content).
    fn read_content(&self, input: &mut StreamInput) -> SegrepResult<RemoteSegmentMetadata>;
}

/// Version 1: no checkpoint, generation and term only.
#[derive(Debug)]
pub struct MetadataHandlerV1;

impl MetadataHandler for MetadataHandlerV1 {
    fn version(&self) -> u32 {
        1
    }

    fn write_content(&self, out: &mut StreamOutput, metadata: &RemoteSegmentMetadata) -> SegrepResult<()> {
        write_file_map(out, &metadata.metadata);
        out.write_vlong(metadata.generation);
        out.write_vlong(metadata.primary_term);
        out.write_bytes(&metadata.segment_infos_bytes);
        Ok(())
    }

    fn read_content(&self, input: &mut StreamInput) -> SegrepResult<RemoteSegmentMetadata> {
        let metadata = read_file_map(input)?;
        let generation = input.read_vlong()?;
        let primary_term = input.read_vlong()?;
        let segment_infos_bytes = input.read_bytes()?;
        Ok(RemoteSegmentMetadata::without_checkpoint(
            metadata,
            segment_infos_bytes,
            generation,
            primary_term,
        ))
    }
}

/// Version 2: full checkpoint.
#[derive(Debug)]
pub struct MetadataHandlerV2;

impl MetadataHandler for MetadataHandlerV2 {
    fn version(&self) -> u32 {
        2
    }

    fn write_content(&self, out: &mut StreamOutput, metadata: &RemoteSegmentMetadata) -> SegrepResult<()> {
        let checkpoint = metadata.checkpoint.as_ref().ok_or_else(|| SegrepError::Config {
            reason: "metadata version 2 requires a replication checkpoint".to_string(),
        })?;
        write_file_map(out, &metadata.metadata);
        checkpoint.write_to(out);
        out.write_bytes(&metadata.segment_infos_bytes);
        Ok(())
    }

    fn read_content(&self, input: &mut StreamInput) -> SegrepResult<RemoteSegmentMetadata> {
        let metadata = read_file_map(input)?;
        let checkpoint = ReplicationCheckpoint::read_from(input)?;
        let segment_infos_bytes = input.read_bytes()?;
        let declared_length = checkpoint.length;
        let decoded = RemoteSegmentMetadata::new(metadata, segment_infos_bytes, checkpoint);
        if let Some(cp) = &decoded.checkpoint {
            if cp.length != declared_length {
                return Err(SegrepError::corrupt(format!(
                    "checkpoint length {} does not match file map total {}",
                    declared_length, cp.length
                )));
            }
        }
        Ok(decoded)
    }
}

fn build_handler(version: u32) -> Option<Arc<dyn MetadataHandler>> {
    match version {
        1 => Some(Arc::new(MetadataHandlerV1)),
        2 => Some(Arc::new(MetadataHandlerV2)),
        _ => None,
    }
}

/// Fixed table of handlers, one per version, built once and shared.
#[derive(Debug)]
pub struct MetadataHandlerRegistry {
    handlers: BTreeMap<u32, Arc<dyn MetadataHandler>>,
}

impl MetadataHandlerRegistry {
    /// Build a registry offering exactly `versions`.
    pub fn with_versions(versions: &[u32]) -> SegrepResult<Self> {
        let mut handlers = BTreeMap::new();
        for &version in versions {
            let handler = build_handler(version).ok_or_else(|| SegrepError::UnsupportedVersion {
                version,
                supported: SHIPPED_VERSIONS.to_vec(),
            })?;
            handlers.insert(version, handler);
        }
        Ok(Self { handlers })
    }

    /// The process-wide registry of every shipped version.
    pub fn shipped() -> &'static MetadataHandlerRegistry {
        static SHIPPED: OnceLock<MetadataHandlerRegistry> = OnceLock::new();
        SHIPPED.get_or_init(|| MetadataHandlerRegistry {
            handlers: SHIPPED_VERSIONS
                .iter()
                .filter_map(|&v| build_handler(v).map(|h| (v, h)))
                .collect(),
        })
    }

    /// The cached handler for `version`.
    pub fn get_handler(&self, version: u32) -> SegrepResult<Arc<dyn MetadataHandler>> {
        self.handlers
            .get(&version)
            .cloned()
            .ok_or_else(|| SegrepError::UnsupportedVersion {
                version,
                supported: self.versions(),
            })
    }

    /// Versions offered.
    pub fn versions(&self) -> Vec<u32> {
        self.handlers.keys().copied().collect()
    }

    /// Frame `metadata` as a version-`version` blob.
    pub fn encode(&self, metadata: &RemoteSegmentMetadata, version: u32) -> SegrepResult<Bytes> {
        let handler = self.get_handler(version)?;
        let mut out = StreamOutput::new();
        handler.write_content(&mut out, metadata)?;
        Ok(write_envelope(METADATA_CODEC, version, &out.freeze()))
    }

    /// Verify and decode a framed blob with the handler its header names.
    pub fn decode(&self, framed: &[u8]) -> SegrepResult<RemoteSegmentMetadata> {
        let (version, content) = read_envelope(METADATA_CODEC, framed)?;
        let handler = self.get_handler(version)?;
        let mut input = StreamInput::new(content);
        let metadata = handler.read_content(&mut input)?;
        if input.remaining() != 0 {
            return Err(SegrepError::corrupt(format!(
                "{} trailing bytes after metadata content",
                input.remaining()
            )));
        }
        Ok(metadata)
    }
}

/// Handler for `version` from the shipped registry.
pub fn get_handler(version: u32) -> SegrepResult<Arc<dyn MetadataHandler>> {
    MetadataHandlerRegistry::shipped().get_handler(version)
}
