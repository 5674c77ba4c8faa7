//! Remote blob layout.
//!
//! ```text
//! <base>/<index_uuid>/<shard>/segments/data/<logical>__<uuid>
//! <base>/<index_uuid>/<shard>/segments/metadata/metadata__<inv term>__<inv gen>__<inv ts>__<node>__<uuid>__<version>
//! <base>/<index_uuid>/<shard>/segments/lock_files/lock__<gen>___<owner>___v2_lock
//! ```
//!
//! Inverted numbers are `u64::MAX - n` zero-padded to 20 digits, so an
//! ascending listing of the metadata prefix is newest first.

use std::fmt;

use crate::error::{SegrepError, SegrepResult};

/// Separator between fields of a metadata file name.
pub const METADATA_SEPARATOR: &str = "__";

/// Prefix of every metadata file name.
pub const METADATA_PREFIX: &str = "metadata";

/// Width of a zero-padded u64.
const PADDED_WIDTH: usize = 20;

/// Data category of a remote path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    /// Segment files and their metadata.
    Segments,
}

impl fmt::Display for DataCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataCategory::Segments => f.write_str("segments"),
        }
    }
}

/// Kind of blob under a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Segment file contents.
    Data,
    /// Manifest blobs.
    Metadata,
    /// Advisory lock markers.
    LockFiles,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Data => f.write_str("data"),
            DataType::Metadata => f.write_str("metadata"),
            DataType::LockFiles => f.write_str("lock_files"),
        }
    }
}

/// Root of one shard's remote data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteShardPath {
    base_path: String,
    index_uuid: String,
    shard_num: u32,
}

impl RemoteShardPath {
    /// Create a shard path under `base_path` (trailing `/` optional).
    pub fn new(base_path: impl Into<String>, index_uuid: impl Into<String>, shard_num: u32) -> Self {
        let base_path = base_path.into().trim_end_matches('/').to_string();
        Self {
            base_path,
            index_uuid: index_uuid.into(),
            shard_num,
        }
    }

    /// Directory prefix (with trailing `/`) for a category and type.
    pub fn prefix(&self, category: DataCategory, data_type: DataType) -> String {
        let mut path = String::new();
        if !self.base_path.is_empty() {
            path.push_str(&self.base_path);
            path.push('/');
        }
        path.push_str(&format!(
            "{}/{}/{}/{}/",
            self.index_uuid, self.shard_num, category, data_type
        ));
        path
    }
}

/// Zero-padded `u64::MAX - n`.
pub fn invert(n: u64) -> String {
    format!("{:0width$}", u64::MAX - n, width = PADDED_WIDTH)
}

/// Inverse of [`invert`].
pub fn uninvert(s: &str) -> SegrepResult<u64> {
    let inverted: u64 = s
        .parse()
        .map_err(|_| SegrepError::corrupt(format!("not an inverted number: [{}]", s)))?;
    Ok(u64::MAX - inverted)
}

/// Fields encoded in a metadata file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFileName {
    /// Primary term of the uploading primary.
    pub primary_term: u64,
    /// Segments generation.
    pub generation: u64,
    /// Upload time, milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Uploading node.
    pub node_id: String,
    /// Random discriminator so concurrent primaries cannot collide.
    pub uuid: String,
    /// Metadata codec version of the blob.
    pub version: u32,
}

impl MetadataFileName {
    /// Create a name with a fresh random discriminator.
    pub fn new(primary_term: u64, generation: u64, timestamp_ms: u64, node_id: &str, version: u32) -> SegrepResult<Self> {
        if node_id.is_empty() || node_id.contains(METADATA_SEPARATOR) || node_id.contains('/') {
            return Err(SegrepError::Config {
                reason: format!("node id [{}] cannot be used in a metadata file name", node_id),
            });
        }
        Ok(Self {
            primary_term,
            generation,
            timestamp_ms,
            node_id: node_id.to_string(),
            uuid: uuid::Uuid::new_v4().simple().to_string(),
            version,
        })
    }

    /// Parse a metadata blob name (without directory prefix).
    pub fn parse(name: &str) -> SegrepResult<Self> {
        let parts: Vec<&str> = name.split(METADATA_SEPARATOR).collect();
        if parts.len() != 7 || parts[0] != METADATA_PREFIX {
            return Err(SegrepError::corrupt(format!(
                "invalid metadata file name [{}]",
                name
            )));
        }
        let version = parts[6]
            .parse()
            .map_err(|_| SegrepError::corrupt(format!("invalid metadata version in [{}]", name)))?;
        Ok(Self {
            primary_term: uninvert(parts[1])?,
            generation: uninvert(parts[2])?,
            timestamp_ms: uninvert(parts[3])?,
            node_id: parts[4].to_string(),
            uuid: parts[5].to_string(),
            version,
        })
    }
}

impl fmt::Display for MetadataFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sep = METADATA_SEPARATOR;
        write!(
            f,
            "{METADATA_PREFIX}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}{sep}{}",
            invert(self.primary_term),
            invert(self.generation),
            invert(self.timestamp_ms),
            self.node_id,
            self.uuid,
            self.version
        )
    }
}

/// Last path segment of a blob key.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
