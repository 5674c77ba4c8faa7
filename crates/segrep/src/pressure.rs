//! Replica lag tracking and write back-pressure.
//!
//! The primary remembers when each checkpoint was published. A replica's lag
//! is measured against its last visible checkpoint: how many published
//! checkpoints it has not reached yet, and for how long the oldest of them
//! has been waiting.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::checkpoint::CheckpointKey;
use crate::config::PressureConfig;
use crate::error::{SegrepError, SegrepResult};
use crate::shard::{AllocationId, ShardId};

/// Published checkpoints remembered per shard; older ones are dropped even if
/// a replica never reaches them.
const MAX_TRACKED_CHECKPOINTS: usize = 1024;

/// Lag of one replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplicaLag {
    /// The replica.
    pub allocation_id: AllocationId,
    /// Last checkpoint the replica serves.
    pub visible: String,
    /// Published checkpoints not yet visible.
    pub checkpoints_behind: u64,
    /// Age of the oldest of those.
    pub current_replication_time_ms: u64,
}

#[derive(Debug, Default)]
struct TrackerState {
    latest: CheckpointKey,
    published: VecDeque<(CheckpointKey, Instant)>,
    replicas: HashMap<AllocationId, CheckpointKey>,
}

impl TrackerState {
    fn prune(&mut self) {
        let floor = self.replicas.values().min().copied().unwrap_or(self.latest);
        while matches!(self.published.front(), Some((key, _)) if *key <= floor) {
            self.published.pop_front();
        }
    }

    fn lag(&self, visible: CheckpointKey, now: Instant) -> (u64, u64) {
        let mut behind = 0u64;
        let mut oldest = None;
        for (key, at) in &self.published {
            if *key > visible {
                behind += 1;
                oldest.get_or_insert(*at);
            }
        }
        let ms = oldest.map_or(0, |at| now.saturating_duration_since(at).as_millis() as u64);
        (behind, ms)
    }
}

/// Per-shard replica lag, kept on the primary.
#[derive(Debug)]
pub struct ReplicationTracker {
    shard_id: ShardId,
    state: Mutex<TrackerState>,
}

impl ReplicationTracker {
    /// Create a tracker with no replicas.
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// The tracked shard.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Start tracking a replica at the empty checkpoint.
    pub fn add_replica(&self, allocation_id: AllocationId) {
        self.state.lock().replicas.entry(allocation_id).or_default();
    }

    /// Stop tracking a replica.
    pub fn remove_replica(&self, allocation_id: &AllocationId) -> bool {
        let mut state = self.state.lock();
        let removed = state.replicas.remove(allocation_id).is_some();
        state.prune();
        removed
    }

    /// Record a checkpoint published by the primary. Keys not ahead of the
    /// latest are ignored.
    pub fn set_latest_checkpoint(&self, key: CheckpointKey) {
        let mut state = self.state.lock();
        if key <= state.latest {
            return;
        }
        state.latest = key;
        state.published.push_back((key, Instant::now()));
        if state.published.len() > MAX_TRACKED_CHECKPOINTS {
            state.published.pop_front();
        }
    }

    /// Newest published checkpoint.
    pub fn latest_checkpoint(&self) -> CheckpointKey {
        self.state.lock().latest
    }

    /// Record what a replica now serves. Never moves a replica backwards.
    pub fn update_visible_checkpoint(&self, allocation_id: &AllocationId, key: CheckpointKey) {
        let mut state = self.state.lock();
        let Some(visible) = state.replicas.get_mut(allocation_id) else {
            debug!(allocation = %allocation_id, "visible checkpoint for untracked replica");
            return;
        };
        if key > *visible {
            *visible = key;
            state.prune();
        }
    }

    /// Published checkpoints the replica has not reached.
    pub fn checkpoints_behind(&self, allocation_id: &AllocationId) -> Option<u64> {
        let state = self.state.lock();
        let visible = *state.replicas.get(allocation_id)?;
        Some(state.lag(visible, Instant::now()).0)
    }

    /// How long the oldest checkpoint the replica has not reached has been
    /// published; 0 when caught up.
    pub fn current_replication_time_ms(&self, allocation_id: &AllocationId) -> Option<u64> {
        let state = self.state.lock();
        let visible = *state.replicas.get(allocation_id)?;
        Some(state.lag(visible, Instant::now()).1)
    }

    /// Lag of every tracked replica, ordered by allocation id.
    pub fn replica_lags(&self) -> Vec<ReplicaLag> {
        let state = self.state.lock();
        let now = Instant::now();
        let mut lags: Vec<ReplicaLag> = state
            .replicas
            .iter()
            .map(|(id, visible)| {
                let (behind, ms) = state.lag(*visible, now);
                ReplicaLag {
                    allocation_id: id.clone(),
                    visible: visible.to_string(),
                    checkpoints_behind: behind,
                    current_replication_time_ms: ms,
                }
            })
            .collect();
        lags.sort_by(|a, b| a.allocation_id.cmp(&b.allocation_id));
        lags
    }

    /// Follow a replica engine's served checkpoint until the engine goes away.
    pub fn track_replica(self: &Arc<Self>, allocation_id: AllocationId, mut served: watch::Receiver<CheckpointKey>) -> JoinHandle<()> {
        self.add_replica(allocation_id.clone());
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let key = *served.borrow_and_update();
                tracker.update_visible_checkpoint(&allocation_id, key);
                if served.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

/// Pressure counters for one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShardPressureStats {
    /// Writes rejected.
    pub rejected_requests: u64,
    /// Current lag per replica.
    pub replicas: Vec<ReplicaLag>,
}

/// Pressure counters across shards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PressureStats {
    /// Writes rejected across shards.
    pub total_rejections: u64,
    /// Per shard, keyed by display name.
    pub shards: BTreeMap<String, ShardPressureStats>,
}

/// Rejects writes to shards whose replicas fall too far behind.
#[derive(Debug)]
pub struct PressureService {
    config: PressureConfig,
    trackers: DashMap<ShardId, Arc<ReplicationTracker>>,
    rejections: DashMap<ShardId, u64>,
}

impl PressureService {
    /// Create a service.
    pub fn new(config: PressureConfig) -> Self {
        Self {
            config,
            trackers: DashMap::new(),
            rejections: DashMap::new(),
        }
    }

    /// Active settings.
    pub fn config(&self) -> &PressureConfig {
        &self.config
    }

    /// Create or return the tracker of `shard`.
    pub fn tracker(&self, shard: &ShardId) -> Arc<ReplicationTracker> {
        Arc::clone(
            self.trackers
                .entry(shard.clone())
                .or_insert_with(|| Arc::new(ReplicationTracker::new(shard.clone())))
                .value(),
        )
    }

    /// Forget a shard.
    pub fn remove_shard(&self, shard: &ShardId) {
        self.trackers.remove(shard);
        self.rejections.remove(shard);
    }

    fn is_stale(&self, lag: &ReplicaLag) -> bool {
        lag.checkpoints_behind > self.config.max_checkpoints_behind
            && lag.current_replication_time_ms > self.config.max_replication_time_ms
    }

    /// Fail with [`SegrepError::ReplicationPressure`] if enough replicas of
    /// `shard` are stale to stop accepting writes.
    pub fn check(&self, shard: &ShardId) -> SegrepResult<()> {
        if !self.config.enabled {
            return Ok(());
        }
        let Some(tracker) = self.trackers.get(shard).map(|t| Arc::clone(t.value())) else {
            return Ok(());
        };
        let lags = tracker.replica_lags();
        let total = lags.len();
        let stale = lags.iter().filter(|l| self.is_stale(l)).count();
        if stale == 0 || (stale as f64) < total as f64 * self.config.max_stale_replica_fraction {
            return Ok(());
        }
        *self.rejections.entry(shard.clone()).or_insert(0) += 1;
        warn!(shard = %shard, stale, total, "rejecting write, replicas are behind");
        Err(SegrepError::ReplicationPressure {
            shard: shard.clone(),
            stale_replicas: stale,
            total_replicas: total,
        })
    }

    /// Replicas lagging longer than the fail limit.
    pub fn replicas_to_fail(&self, shard: &ShardId) -> Vec<AllocationId> {
        let limit = self.config.fail_replica_after_ms;
        if limit == 0 {
            return Vec::new();
        }
        let Some(tracker) = self.trackers.get(shard).map(|t| Arc::clone(t.value())) else {
            return Vec::new();
        };
        tracker
            .replica_lags()
            .into_iter()
            .filter(|l| l.checkpoints_behind > 0 && l.current_replication_time_ms > limit)
            .map(|l| l.allocation_id)
            .collect()
    }

    /// Snapshot of counters and lag.
    pub fn stats(&self) -> PressureStats {
        let mut stats = PressureStats::default();
        for entry in self.trackers.iter() {
            let rejected = self.rejections.get(entry.key()).map_or(0, |r| *r.value());
            stats.total_rejections += rejected;
            stats.shards.insert(
                entry.key().to_string(),
                ShardPressureStats {
                    rejected_requests: rejected,
                    replicas: entry.value().replica_lags(),
                },
            );
        }
        stats
    }
}
