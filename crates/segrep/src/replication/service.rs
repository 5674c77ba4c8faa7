//! Per-shard replica replication service.
//!
//! Checkpoints may arrive in any order. The service keeps at most one round
//! in flight and remembers only the newest checkpoint received meanwhile;
//! anything not ahead of what is served, in flight or pending is dropped.
//!
//! A round that finds the local copy corrupt or diverged from the source
//! fails the copy: the reader refuses generations, the service refuses
//! checkpoints and waiters see [`SegrepError::ShardFailed`] until
//! [`SegmentReplicationTargetService::recover`] resets it.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointKey, MergedSegmentCheckpoint, ReplicationCheckpoint};
use crate::engine::nrt::{NrtReplicationEngine, ReaderState};
use crate::error::{SegrepError, SegrepResult};
use crate::replication::source::ReplicationSource;
use crate::replication::target::{ReplicationOutcome, SegmentReplicationTarget};
use crate::replication::CancellationHandle;
use crate::shard::AllocationId;

/// Attempts per checkpoint when the source moved on underneath a round.
const MAX_ROUND_ATTEMPTS: u32 = 3;

/// Service counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetServiceStats {
    /// Checkpoints received.
    pub received: u64,
    /// Checkpoints dropped as not ahead of served/in-flight/pending state.
    pub dropped_stale: u64,
    /// Pending checkpoints replaced by a newer one before starting.
    pub superseded: u64,
    /// Rounds started.
    pub rounds_started: u64,
    /// Rounds that applied a new generation.
    pub rounds_applied: u64,
    /// Rounds that found nothing to do.
    pub rounds_skipped: u64,
    /// Rounds that failed.
    pub rounds_failed: u64,
    /// Rounds cancelled.
    pub rounds_cancelled: u64,
    /// Files transferred.
    pub files_fetched: u64,
    /// Bytes transferred.
    pub bytes_fetched: u64,
    /// Merged segment files copied ahead of the generation listing them.
    pub files_prewarmed: u64,
}

#[derive(Debug, Default)]
struct TargetServiceStatsInner {
    received: AtomicU64,
    dropped_stale: AtomicU64,
    superseded: AtomicU64,
    rounds_started: AtomicU64,
    rounds_applied: AtomicU64,
    rounds_skipped: AtomicU64,
    rounds_failed: AtomicU64,
    rounds_cancelled: AtomicU64,
    files_fetched: AtomicU64,
    bytes_fetched: AtomicU64,
    files_prewarmed: AtomicU64,
}

impl TargetServiceStatsInner {
    fn snapshot(&self) -> TargetServiceStats {
        TargetServiceStats {
            received: self.received.load(Ordering::Relaxed),
            dropped_stale: self.dropped_stale.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            rounds_applied: self.rounds_applied.load(Ordering::Relaxed),
            rounds_skipped: self.rounds_skipped.load(Ordering::Relaxed),
            rounds_failed: self.rounds_failed.load(Ordering::Relaxed),
            rounds_cancelled: self.rounds_cancelled.load(Ordering::Relaxed),
            files_fetched: self.files_fetched.load(Ordering::Relaxed),
            bytes_fetched: self.bytes_fetched.load(Ordering::Relaxed),
            files_prewarmed: self.files_prewarmed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct InFlight {
    key: CheckpointKey,
    cancel: CancellationHandle,
}

#[derive(Debug, Default)]
struct ServiceState {
    in_flight: Option<InFlight>,
    pending: Option<ReplicationCheckpoint>,
    closed: bool,
    last_failure: Option<String>,
}

struct ServiceInner {
    allocation_id: AllocationId,
    engine: Arc<NrtReplicationEngine>,
    source: RwLock<Arc<dyn ReplicationSource>>,
    state: Mutex<ServiceState>,
    failed_tx: watch::Sender<Option<String>>,
    stats: TargetServiceStatsInner,
}

/// Replication driver for one replica copy.
#[derive(Clone)]
pub struct SegmentReplicationTargetService {
    inner: Arc<ServiceInner>,
}

impl SegmentReplicationTargetService {
    /// Create a service applying into `engine` from `source`.
    pub fn new(allocation_id: AllocationId, engine: Arc<NrtReplicationEngine>, source: Arc<dyn ReplicationSource>) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                allocation_id,
                engine,
                source: RwLock::new(source),
                state: Mutex::new(ServiceState::default()),
                failed_tx: watch::channel(None).0,
                stats: TargetServiceStatsInner::default(),
            }),
        }
    }

    /// Allocation id of this copy.
    pub fn allocation_id(&self) -> &AllocationId {
        &self.inner.allocation_id
    }

    /// The replica's reader manager.
    pub fn engine(&self) -> &Arc<NrtReplicationEngine> {
        &self.inner.engine
    }

    /// Replace the source, e.g. after the primary moved. Applies to the next
    /// round.
    pub fn set_source(&self, source: Arc<dyn ReplicationSource>) {
        info!(allocation = %self.inner.allocation_id, source = %source.description(), "replication source changed");
        *self.inner.source.write() = source;
    }

    /// Offer a checkpoint. Returns `true` if it was accepted for replication,
    /// either started now or queued behind the round in flight.
    ///
    /// Must be called within a tokio runtime.
    pub fn on_new_checkpoint(&self, checkpoint: ReplicationCheckpoint) -> bool {
        let inner = &self.inner;
        inner.stats.received.fetch_add(1, Ordering::Relaxed);
        let mut state = inner.state.lock();
        if state.closed {
            return false;
        }
        if inner.engine.state() == ReaderState::Failed {
            debug!(allocation = %inner.allocation_id, received = %checkpoint.key(), "refusing checkpoint on failed copy");
            return false;
        }

        let mut reference = inner.engine.current_checkpoint().key();
        if let Some(in_flight) = &state.in_flight {
            reference = reference.max(in_flight.key);
        }
        if let Some(pending) = &state.pending {
            reference = reference.max(pending.key());
        }
        if checkpoint.key() <= reference {
            inner.stats.dropped_stale.fetch_add(1, Ordering::Relaxed);
            debug!(
                allocation = %inner.allocation_id,
                received = %checkpoint.key(),
                reference = %reference,
                "dropping checkpoint that is not ahead"
            );
            return false;
        }

        if state.in_flight.is_some() {
            if state.pending.replace(checkpoint).is_some() {
                inner.stats.superseded.fetch_add(1, Ordering::Relaxed);
            }
            return true;
        }

        let cancel = CancellationHandle::new();
        state.in_flight = Some(InFlight {
            key: checkpoint.key(),
            cancel: cancel.clone(),
        });
        drop(state);
        tokio::spawn(drive(Arc::clone(inner), checkpoint, cancel));
        true
    }

    /// Copy a merged segment's files ahead of the refresh that first lists
    /// them. The served generation does not change. Returns `true` if a copy
    /// was started.
    ///
    /// Must be called within a tokio runtime.
    pub fn prewarm_merged(&self, merged: &MergedSegmentCheckpoint) -> bool {
        let inner = &self.inner;
        if inner.state.lock().closed || inner.engine.state() == ReaderState::Failed {
            return false;
        }
        if !merged.checkpoint.is_ahead_of(&inner.engine.current_checkpoint()) {
            return false;
        }
        let source = Arc::clone(&inner.source.read());
        let target = SegmentReplicationTarget::new(
            Arc::clone(&inner.engine),
            source,
            merged.checkpoint.clone(),
            CancellationHandle::new(),
        );
        let inner = Arc::clone(inner);
        let segment = merged.segment_name.clone();
        tokio::spawn(async move {
            match target.prewarm().await {
                Ok(files) => {
                    inner.stats.files_prewarmed.fetch_add(files as u64, Ordering::Relaxed);
                }
                Err(e) => warn!(allocation = %inner.allocation_id, segment = %segment, error = %e, "merged segment copy failed"),
            }
        });
        true
    }

    /// Wait until the served generation is at or past `key`. Returns
    /// [`SegrepError::ShardFailed`] as soon as the copy fails.
    pub async fn wait_for(&self, key: CheckpointKey, timeout: Duration) -> SegrepResult<()> {
        let mut applied = self.inner.engine.subscribe();
        let mut failed = self.inner.failed_tx.subscribe();
        let shard = || self.inner.engine.shard_id().clone();
        let wait = async {
            loop {
                if *applied.borrow_and_update() >= key {
                    return Ok(());
                }
                if let Some(reason) = failed.borrow_and_update().clone() {
                    return Err(SegrepError::ShardFailed { shard: shard(), reason });
                }
                let changed = tokio::select! {
                    changed = applied.changed() => changed,
                    changed = failed.changed() => changed,
                };
                if changed.is_err() {
                    return Err(SegrepError::ShardClosed { shard: shard() });
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SegrepError::Timeout {
                what: format!("{} to reach {}", self.inner.allocation_id, key),
                timeout_ms: timeout.as_millis() as u64,
            })?
    }

    /// True while a round is running.
    pub fn is_replicating(&self) -> bool {
        self.inner.state.lock().in_flight.is_some()
    }

    /// Cancel the round in flight, if any. Pending work is kept.
    pub fn cancel_in_flight(&self, reason: &str) {
        if let Some(in_flight) = &self.inner.state.lock().in_flight {
            in_flight.cancel.cancel(reason);
        }
    }

    /// Stop replicating and close the reader.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.pending = None;
            if let Some(in_flight) = &state.in_flight {
                in_flight.cancel.cancel("shard closing");
            }
        }
        self.inner.engine.close();
        info!(allocation = %self.inner.allocation_id, "closed replication target");
    }

    /// True once a round found the local copy diverged, until [`Self::recover`].
    pub fn is_failed(&self) -> bool {
        self.inner.engine.state() == ReaderState::Failed
    }

    /// Why the copy failed, if it did.
    pub fn failure(&self) -> Option<String> {
        self.inner.engine.failure()
    }

    /// Reset a failed copy and replicate `checkpoint` into it from scratch.
    ///
    /// The reader drops its generation and every unpinned local file is
    /// deleted before the round starts. On a copy that has not failed this
    /// only offers `checkpoint`. Returns whether the checkpoint was accepted.
    ///
    /// Must be called within a tokio runtime.
    pub fn recover(&self, checkpoint: ReplicationCheckpoint) -> SegrepResult<bool> {
        if self.inner.state.lock().closed {
            return Err(SegrepError::ShardClosed {
                shard: self.inner.engine.shard_id().clone(),
            });
        }
        if self.is_failed() {
            let removed = self.inner.engine.reset()?;
            self.inner.state.lock().last_failure = None;
            self.inner.failed_tx.send_replace(None);
            info!(
                allocation = %self.inner.allocation_id,
                removed,
                checkpoint = %checkpoint.key(),
                "recovering failed copy from scratch"
            );
        }
        Ok(self.on_new_checkpoint(checkpoint))
    }

    /// Message of the most recent failed round.
    pub fn last_failure(&self) -> Option<String> {
        self.inner.state.lock().last_failure.clone()
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> TargetServiceStats {
        self.inner.stats.snapshot()
    }
}

impl std::fmt::Debug for SegmentReplicationTargetService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReplicationTargetService")
            .field("allocation_id", &self.inner.allocation_id)
            .finish()
    }
}

async fn drive(inner: Arc<ServiceInner>, mut checkpoint: ReplicationCheckpoint, mut cancel: CancellationHandle) {
    let mut attempt = 1;
    loop {
        inner.stats.rounds_started.fetch_add(1, Ordering::Relaxed);
        let source = Arc::clone(&inner.source.read());
        let target = SegmentReplicationTarget::new(Arc::clone(&inner.engine), source, checkpoint.clone(), cancel.clone());
        let result = target.run().await;
        let retry = match record(&inner, &checkpoint, result) {
            RoundVerdict::Done => false,
            RoundVerdict::Retry => attempt < MAX_ROUND_ATTEMPTS,
            RoundVerdict::Diverged(reason) => {
                fail_copy(&inner, reason);
                break;
            }
        };

        let next = {
            let mut state = inner.state.lock();
            let current = inner.engine.current_checkpoint();
            let pending = state.pending.take().filter(|cp| cp.is_ahead_of(&current));
            let next = match pending {
                Some(cp) if !state.closed => {
                    attempt = 1;
                    Some(cp)
                }
                _ if retry && !state.closed && checkpoint.is_ahead_of(&current) => {
                    attempt += 1;
                    Some(checkpoint.clone())
                }
                _ => None,
            };
            match next {
                Some(cp) => {
                    let handle = CancellationHandle::new();
                    state.in_flight = Some(InFlight {
                        key: cp.key(),
                        cancel: handle.clone(),
                    });
                    Some((cp, handle))
                }
                None => {
                    state.in_flight = None;
                    None
                }
            }
        };

        match next {
            Some((cp, handle)) => {
                checkpoint = cp;
                cancel = handle;
            }
            None => break,
        }
    }
}

/// Stop replicating into a copy whose local files can no longer be trusted.
fn fail_copy(inner: &ServiceInner, reason: String) {
    inner.engine.fail(reason.clone());
    {
        let mut state = inner.state.lock();
        state.in_flight = None;
        state.pending = None;
    }
    inner.failed_tx.send_replace(Some(reason));
}

/// What a finished round means for the checkpoint it ran for.
#[derive(Debug, PartialEq, Eq)]
enum RoundVerdict {
    Done,
    /// The source moved on underneath the round; worth another attempt.
    Retry,
    /// The local copy is corrupt or diverged from the source.
    Diverged(String),
}

/// Record a round's result.
fn record(inner: &ServiceInner, checkpoint: &ReplicationCheckpoint, result: SegrepResult<ReplicationOutcome>) -> RoundVerdict {
    let allocation = &inner.allocation_id;
    match result {
        Ok(ReplicationOutcome::Applied {
            files_fetched,
            bytes_fetched,
            ..
        }) => {
            inner.stats.rounds_applied.fetch_add(1, Ordering::Relaxed);
            inner.stats.files_fetched.fetch_add(files_fetched as u64, Ordering::Relaxed);
            inner.stats.bytes_fetched.fetch_add(bytes_fetched, Ordering::Relaxed);
            RoundVerdict::Done
        }
        Ok(ReplicationOutcome::Skipped { current }) => {
            inner.stats.rounds_skipped.fetch_add(1, Ordering::Relaxed);
            debug!(allocation = %allocation, current = %current, "replication round skipped");
            RoundVerdict::Done
        }
        Err(SegrepError::Cancelled { reason }) => {
            inner.stats.rounds_cancelled.fetch_add(1, Ordering::Relaxed);
            info!(allocation = %allocation, checkpoint = %checkpoint.key(), reason = %reason, "replication round cancelled");
            RoundVerdict::Done
        }
        Err(e) => {
            inner.stats.rounds_failed.fetch_add(1, Ordering::Relaxed);
            if e.is_fatal() {
                error!(allocation = %allocation, checkpoint = %checkpoint.key(), error = %e, "replication round failed");
            } else {
                warn!(allocation = %allocation, checkpoint = %checkpoint.key(), error = %e, "replication round failed");
            }
            inner.state.lock().last_failure = Some(e.to_string());
            match e {
                SegrepError::CorruptManifest { reason } => RoundVerdict::Diverged(reason),
                SegrepError::FileNotFound { .. } | SegrepError::BlobNotFound { .. } => RoundVerdict::Retry,
                e if e.is_retryable() => RoundVerdict::Retry,
                _ => RoundVerdict::Done,
            }
        }
    }
}
