//! Cluster-state view consumed by the action framework.
//!
//! Membership and consensus live elsewhere; replication only asks who the
//! primary is, under which term, and which replica copies exist.

use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::info;

use crate::error::{SegrepError, SegrepResult};
use crate::shard::{AllocationId, ShardId, ShardRouting};

/// Read-only routing view.
pub trait ClusterStateView: Send + Sync {
    /// Current primary term of `shard`.
    fn primary_term(&self, shard: &ShardId) -> SegrepResult<u64>;
    /// Routing entry of the primary copy.
    fn primary(&self, shard: &ShardId) -> SegrepResult<ShardRouting>;
    /// Routing entries of every replica copy.
    fn replica_copies(&self, shard: &ShardId) -> SegrepResult<Vec<ShardRouting>>;
}

#[derive(Debug, Clone)]
struct ShardTable {
    primary_term: u64,
    primary: ShardRouting,
    replicas: Vec<ShardRouting>,
}

/// Routing table held in memory, mutated by tests and the demo node.
#[derive(Debug, Default)]
pub struct InMemoryClusterState {
    shards: RwLock<HashMap<ShardId, ShardTable>>,
}

fn unknown(shard: &ShardId) -> SegrepError {
    SegrepError::Config {
        reason: format!("{} is not in the routing table", shard),
    }
}

impl InMemoryClusterState {
    /// Create an empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a shard with its primary copy.
    pub fn add_shard(&self, primary: ShardRouting, primary_term: u64) {
        let shard = primary.shard_id.clone();
        self.shards.write().insert(
            shard,
            ShardTable {
                primary_term,
                primary,
                replicas: Vec::new(),
            },
        );
    }

    /// Add a replica copy.
    pub fn add_replica(&self, replica: ShardRouting) -> SegrepResult<()> {
        let mut shards = self.shards.write();
        let table = shards
            .get_mut(&replica.shard_id)
            .ok_or_else(|| unknown(&replica.shard_id))?;
        table.replicas.push(ShardRouting {
            primary: false,
            ..replica
        });
        Ok(())
    }

    /// Remove a replica copy.
    pub fn remove_replica(&self, shard: &ShardId, allocation_id: &AllocationId) -> SegrepResult<bool> {
        let mut shards = self.shards.write();
        let table = shards.get_mut(shard).ok_or_else(|| unknown(shard))?;
        let before = table.replicas.len();
        table.replicas.retain(|r| &r.allocation_id != allocation_id);
        Ok(table.replicas.len() != before)
    }

    /// Promote a replica to primary, dropping the old primary and bumping
    /// the term. Returns the new term.
    pub fn promote(&self, shard: &ShardId, allocation_id: &AllocationId) -> SegrepResult<u64> {
        let mut shards = self.shards.write();
        let table = shards.get_mut(shard).ok_or_else(|| unknown(shard))?;
        let idx = table
            .replicas
            .iter()
            .position(|r| &r.allocation_id == allocation_id)
            .ok_or_else(|| SegrepError::Config {
                reason: format!("{} has no replica [{}]", shard, allocation_id),
            })?;
        let mut promoted = table.replicas.remove(idx);
        promoted.primary = true;
        table.primary = promoted;
        table.primary_term += 1;
        info!(shard = %shard, allocation = %allocation_id, term = table.primary_term, "promoted replica to primary");
        Ok(table.primary_term)
    }

    /// Raise the term without moving the primary.
    pub fn bump_term(&self, shard: &ShardId) -> SegrepResult<u64> {
        let mut shards = self.shards.write();
        let table = shards.get_mut(shard).ok_or_else(|| unknown(shard))?;
        table.primary_term += 1;
        Ok(table.primary_term)
    }
}

impl ClusterStateView for InMemoryClusterState {
    fn primary_term(&self, shard: &ShardId) -> SegrepResult<u64> {
        self.shards
            .read()
            .get(shard)
            .map(|t| t.primary_term)
            .ok_or_else(|| unknown(shard))
    }

    fn primary(&self, shard: &ShardId) -> SegrepResult<ShardRouting> {
        self.shards
            .read()
            .get(shard)
            .map(|t| t.primary.clone())
            .ok_or_else(|| unknown(shard))
    }

    fn replica_copies(&self, shard: &ShardId) -> SegrepResult<Vec<ShardRouting>> {
        self.shards
            .read()
            .get(shard)
            .map(|t| t.replicas.clone())
            .ok_or_else(|| unknown(shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::NodeId;

    fn shard() -> ShardId {
        ShardId::new("logs", "idx", 0)
    }

    #[test]
    fn test_routing_and_promotion() {
        let state = InMemoryClusterState::new();
        let primary = ShardRouting::primary(shard(), NodeId("n1".into()));
        let replica = ShardRouting::replica(shard(), NodeId("n2".into()));
        state.add_shard(primary.clone(), 1);
        state.add_replica(replica.clone()).unwrap();

        assert_eq!(state.primary(&shard()).unwrap(), primary);
        assert_eq!(state.replica_copies(&shard()).unwrap().len(), 1);

        let term = state.promote(&shard(), &replica.allocation_id).unwrap();
        assert_eq!(term, 2);
        let new_primary = state.primary(&shard()).unwrap();
        assert_eq!(new_primary.allocation_id, replica.allocation_id);
        assert!(new_primary.primary);
        assert!(state.replica_copies(&shard()).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_shard() {
        let state = InMemoryClusterState::new();
        assert!(state.primary_term(&shard()).is_err());
        assert!(state
            .add_replica(ShardRouting::replica(shard(), NodeId("n".into())))
            .is_err());
    }

    #[test]
    fn test_remove_replica_and_bump() {
        let state = InMemoryClusterState::new();
        state.add_shard(ShardRouting::primary(shard(), NodeId("n1".into())), 4);
        let replica = ShardRouting::replica(shard(), NodeId("n2".into()));
        state.add_replica(replica.clone()).unwrap();
        assert!(state.remove_replica(&shard(), &replica.allocation_id).unwrap());
        assert!(!state.remove_replica(&shard(), &replica.allocation_id).unwrap());
        assert_eq!(state.bump_term(&shard()).unwrap(), 5);
    }
}
