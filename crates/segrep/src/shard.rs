//! Shard identity and routing types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of one shard: index name, index UUID and shard number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name.
    pub index_name: String,
    /// Index UUID, unique across index re-creations with the same name.
    pub index_uuid: String,
    /// Shard number within the index.
    pub shard_num: u32,
}

impl ShardId {
    /// Create a new shard id.
    pub fn new(index_name: impl Into<String>, index_uuid: impl Into<String>, shard_num: u32) -> Self {
        Self {
            index_name: index_name.into(),
            index_uuid: index_uuid.into(),
            shard_num,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index_name, self.shard_num)
    }
}

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one shard copy's allocation; survives relocation of the node but
/// not re-allocation of the copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub String);

impl AllocationId {
    /// Generate a fresh random allocation id.
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where one copy of a shard lives and whether it is the primary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// The shard.
    pub shard_id: ShardId,
    /// Allocation of this copy.
    pub allocation_id: AllocationId,
    /// Node holding this copy.
    pub node_id: NodeId,
    /// True for the primary copy.
    pub primary: bool,
}

impl ShardRouting {
    /// Routing entry for a primary copy.
    pub fn primary(shard_id: ShardId, node_id: NodeId) -> Self {
        Self {
            shard_id,
            allocation_id: AllocationId::random(),
            node_id,
            primary: true,
        }
    }

    /// Routing entry for a replica copy.
    pub fn replica(shard_id: ShardId, node_id: NodeId) -> Self {
        Self {
            shard_id,
            allocation_id: AllocationId::random(),
            node_id,
            primary: false,
        }
    }
}
