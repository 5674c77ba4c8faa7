//! Primary-then-replicas dispatch.
//!
//! A [`ReplicationAction`] runs one [`ReplicatedOperation`] against the
//! current primary, retrying when the primary turns out to have been
//! demoted, and then fans the replica request out to every replica copy
//! concurrently. The caller gets a [`ReplicationResponse`] with per-copy
//! results as soon as the primary phase succeeds and enough copies have
//! acknowledged under the configured [`AckPolicy`].

pub mod cluster;
pub mod publish;

pub use cluster::{ClusterStateView, InMemoryClusterState};
pub use publish::{
    CheckpointDispatcher, DispatcherStats, LocalShardRegistry, PublishCheckpointAction, PublishMergedSegmentAction,
};

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{SegrepError, SegrepResult};
use crate::shard::{AllocationId, NodeId, ShardId, ShardRouting};

/// How many copies must acknowledge before the action succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckPolicy {
    /// The primary alone is enough; replica failures are reported only.
    #[default]
    BestEffort,
    /// A majority of all copies, primary included.
    Quorum,
    /// Every copy.
    All,
}

impl AckPolicy {
    /// Copies required out of `total` (primary included).
    pub fn required(&self, total: usize) -> usize {
        match self {
            AckPolicy::BestEffort => total.min(1),
            AckPolicy::Quorum => total / 2 + 1,
            AckPolicy::All => total,
        }
    }
}

/// Lifecycle of one action, recorded in order in the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionState {
    /// Accepted, primary not yet resolved.
    Dispatched,
    /// Running on the primary.
    PrimaryExecuting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Primary phase done.
    PrimarySucceeded,
    /// Primary phase failed for good.
    PrimaryFailed,
    /// Replica requests in flight.
    Replicating {
        /// Replica copies targeted.
        copies: usize,
    },
    /// Every replica acknowledged.
    AllAcked,
    /// Some replicas failed or timed out.
    PartialFailure {
        /// Failed copies.
        failed: usize,
    },
    /// Response handed back.
    Responded,
}

/// One replica copy that did not acknowledge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaFailure {
    /// The failed copy.
    pub allocation_id: AllocationId,
    /// The node it lives on.
    pub node_id: NodeId,
    /// Why it failed.
    pub reason: String,
}

/// Per-copy tally attached to a response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardInfo {
    /// Copies targeted, primary included.
    pub total: usize,
    /// Copies that acknowledged, primary included.
    pub successful: usize,
    /// Replica copies that did not.
    pub failures: Vec<ReplicaFailure>,
}

impl ShardInfo {
    /// Copies that failed.
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Result of a completed action.
#[derive(Debug)]
pub struct ReplicationResponse<R> {
    /// What the primary phase returned.
    pub response: R,
    /// Term the primary phase ran under.
    pub primary_term: u64,
    /// Primary attempts made.
    pub attempts: u32,
    /// Per-copy outcome.
    pub shard_info: ShardInfo,
    /// States passed through, in order.
    pub states: Vec<ActionState>,
    /// Time from dispatch to response.
    pub latency_us: u64,
}

/// An operation executed first on the primary, then on each replica.
#[async_trait]
pub trait ReplicatedOperation: Send + Sync + 'static {
    /// Caller input.
    type Request: Send + Sync + 'static;
    /// Returned to the caller.
    type PrimaryResponse: Send + 'static;
    /// Sent to each replica.
    type ReplicaRequest: Clone + Send + Sync + 'static;

    /// Operation name for logs.
    fn name(&self) -> &'static str;

    /// Primary phase. Fails with [`SegrepError::ShardNotPrimary`] if
    /// `primary` no longer holds `primary_term`.
    async fn execute_on_primary(
        &self,
        primary: &ShardRouting,
        primary_term: u64,
        request: &Self::Request,
    ) -> SegrepResult<(Self::PrimaryResponse, Self::ReplicaRequest)>;

    /// Replica phase, run under the term the primary phase used.
    async fn execute_on_replica(
        &self,
        replica: &ShardRouting,
        primary_term: u64,
        request: &Self::ReplicaRequest,
    ) -> SegrepResult<()>;
}

/// Tuning for [`ReplicationAction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionConfig {
    /// Re-resolutions of the primary after `ShardNotPrimary`.
    pub max_primary_retries: u32,
    /// Pause between primary attempts.
    pub retry_backoff: Duration,
    /// Per-replica acknowledgement timeout.
    pub replica_ack_timeout: Duration,
    /// Acknowledgement policy.
    pub ack_policy: AckPolicy,
}

impl Default for ActionConfig {
    fn default() -> Self {
        Self {
            max_primary_retries: 3,
            retry_backoff: Duration::from_millis(50),
            replica_ack_timeout: Duration::from_secs(30),
            ack_policy: AckPolicy::BestEffort,
        }
    }
}

/// Action counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionStats {
    /// Actions that responded successfully.
    pub completed: u64,
    /// Actions that returned an error.
    pub failed: u64,
    /// Primary re-resolutions.
    pub primary_retries: u64,
    /// Replica copies that did not acknowledge.
    pub replica_failures: u64,
}

#[derive(Debug, Default)]
struct ActionStatsInner {
    completed: AtomicU64,
    failed: AtomicU64,
    primary_retries: AtomicU64,
    replica_failures: AtomicU64,
}

impl ActionStatsInner {
    fn snapshot(&self) -> ActionStats {
        ActionStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            primary_retries: self.primary_retries.load(Ordering::Relaxed),
            replica_failures: self.replica_failures.load(Ordering::Relaxed),
        }
    }
}

/// Runs a [`ReplicatedOperation`] against the routing in a
/// [`ClusterStateView`].
pub struct ReplicationAction<O: ReplicatedOperation> {
    op: Arc<O>,
    cluster: Arc<dyn ClusterStateView>,
    config: ActionConfig,
    stats: Arc<ActionStatsInner>,
}

impl<O: ReplicatedOperation> Clone for ReplicationAction<O> {
    fn clone(&self) -> Self {
        Self {
            op: Arc::clone(&self.op),
            cluster: Arc::clone(&self.cluster),
            config: self.config.clone(),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<O: ReplicatedOperation> ReplicationAction<O> {
    /// Create an action.
    pub fn new(op: O, cluster: Arc<dyn ClusterStateView>, config: ActionConfig) -> Self {
        Self {
            op: Arc::new(op),
            cluster,
            config,
            stats: Arc::new(ActionStatsInner::default()),
        }
    }

    /// The wrapped operation.
    pub fn operation(&self) -> &Arc<O> {
        &self.op
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> ActionStats {
        self.stats.snapshot()
    }

    /// Run `request` for `shard`.
    pub async fn execute(&self, shard: &ShardId, request: O::Request) -> SegrepResult<ReplicationResponse<O::PrimaryResponse>> {
        let result = self.execute_inner(shard, request).await;
        match &result {
            Ok(_) => self.stats.completed.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn execute_inner(
        &self,
        shard: &ShardId,
        request: O::Request,
    ) -> SegrepResult<ReplicationResponse<O::PrimaryResponse>> {
        let start = Instant::now();
        let mut states = vec![ActionState::Dispatched];
        let max_attempts = self.config.max_primary_retries + 1;
        let mut attempt = 0u32;

        let (response, replica_request, term) = loop {
            attempt += 1;
            states.push(ActionState::PrimaryExecuting { attempt });
            match self.run_primary(shard, &request).await {
                Ok(done) => break done,
                Err(e @ SegrepError::ShardNotPrimary { .. }) if attempt < max_attempts => {
                    warn!(
                        op = self.op.name(),
                        shard = %shard,
                        attempt,
                        error = %e,
                        "primary moved, re-resolving"
                    );
                    self.stats.primary_retries.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(jittered(self.config.retry_backoff)).await;
                }
                Err(SegrepError::ShardNotPrimary {
                    expected_term,
                    actual_term,
                    ..
                }) => {
                    states.push(ActionState::PrimaryFailed);
                    return Err(SegrepError::OperationFailed {
                        attempts: attempt,
                        reason: format!(
                            "{} on {}: no primary at term {} (found {})",
                            self.op.name(),
                            shard,
                            expected_term,
                            actual_term
                        ),
                    });
                }
                Err(e) => {
                    states.push(ActionState::PrimaryFailed);
                    warn!(op = self.op.name(), shard = %shard, error = %e, "primary phase failed");
                    return Err(e);
                }
            }
        };
        states.push(ActionState::PrimarySucceeded);

        let replicas = self.cluster.replica_copies(shard)?;
        states.push(ActionState::Replicating {
            copies: replicas.len(),
        });
        let failures = self.fan_out(&replicas, term, replica_request).await;

        let total = replicas.len() + 1;
        let successful = total - failures.len();
        if failures.is_empty() {
            states.push(ActionState::AllAcked);
        } else {
            self.stats
                .replica_failures
                .fetch_add(failures.len() as u64, Ordering::Relaxed);
            states.push(ActionState::PartialFailure {
                failed: failures.len(),
            });
        }

        let required = self.config.ack_policy.required(total);
        if successful < required {
            warn!(
                op = self.op.name(),
                shard = %shard,
                acked = successful,
                required,
                "not enough copies acknowledged"
            );
            return Err(SegrepError::InsufficientCopies {
                acked: successful,
                required,
            });
        }

        states.push(ActionState::Responded);
        let latency_us = start.elapsed().as_micros() as u64;
        debug!(
            op = self.op.name(),
            shard = %shard,
            term,
            total,
            successful,
            latency_us,
            "action responded"
        );
        Ok(ReplicationResponse {
            response,
            primary_term: term,
            attempts: attempt,
            shard_info: ShardInfo {
                total,
                successful,
                failures,
            },
            states,
            latency_us,
        })
    }

    async fn run_primary(
        &self,
        shard: &ShardId,
        request: &O::Request,
    ) -> SegrepResult<(O::PrimaryResponse, O::ReplicaRequest, u64)> {
        let term = self.cluster.primary_term(shard)?;
        let primary = self.cluster.primary(shard)?;
        let (response, replica_request) = self.op.execute_on_primary(&primary, term, request).await?;
        // leadership may have moved while the primary phase ran
        let live = self.cluster.primary_term(shard)?;
        if live != term {
            return Err(SegrepError::ShardNotPrimary {
                shard: shard.clone(),
                expected_term: live,
                actual_term: term,
            });
        }
        Ok((response, replica_request, term))
    }

    async fn fan_out(&self, replicas: &[ShardRouting], term: u64, request: O::ReplicaRequest) -> Vec<ReplicaFailure> {
        let timeout = self.config.replica_ack_timeout;
        let mut handles = Vec::with_capacity(replicas.len());
        for replica in replicas {
            let op = Arc::clone(&self.op);
            let replica = replica.clone();
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                match tokio::time::timeout(timeout, op.execute_on_replica(&replica, term, &request)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e.to_string()),
                    Err(_) => Err(format!("no acknowledgement within {}ms", timeout.as_millis())),
                }
            }));
        }

        let mut failures = Vec::new();
        for (replica, handle) in replicas.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(format!("replica task failed: {}", e)),
            };
            if let Err(reason) = outcome {
                warn!(
                    op = self.op.name(),
                    allocation = %replica.allocation_id,
                    node = %replica.node_id,
                    reason = %reason,
                    "replica did not acknowledge"
                );
                failures.push(ReplicaFailure {
                    allocation_id: replica.allocation_id.clone(),
                    node_id: replica.node_id.clone(),
                    reason,
                });
            }
        }
        if failures.is_empty() && !replicas.is_empty() {
            info!(op = self.op.name(), copies = replicas.len(), "all replicas acknowledged");
        }
        failures
    }
}

/// `base` plus up to half of it again, so retrying coordinators spread out.
fn jittered(base: Duration) -> Duration {
    let spread = base.as_millis() as u64 / 2;
    if spread == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
}
