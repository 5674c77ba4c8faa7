//! Replica-side replication: fetching a checkpoint's files from a source,
//! verifying them and handing the manifest to the reader manager.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{SegrepError, SegrepResult};

pub mod service;
pub mod source;
pub mod target;

pub use service::{SegmentReplicationTargetService, TargetServiceStats};
pub use source::{CheckpointInfo, PrimaryShardSource, RemoteStoreSource, ReplicationSource};
pub use target::{ReplicationOutcome, SegmentReplicationTarget};

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Shared cancellation flag for one replication round.
#[derive(Debug, Clone, Default)]
pub struct CancellationHandle {
    inner: Arc<CancelInner>,
}

impl CancellationHandle {
    /// A fresh, uncancelled handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut current = self.inner.reason.lock();
        if current.is_none() {
            *current = Some(reason.into());
        }
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Fail with [`SegrepError::Cancelled`] if cancelled.
    pub fn check(&self) -> SegrepResult<()> {
        if self.is_cancelled() {
            return Err(SegrepError::Cancelled {
                reason: self
                    .inner
                    .reason
                    .lock()
                    .clone()
                    .unwrap_or_else(|| "cancelled".to_string()),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_handle() {
        let handle = CancellationHandle::new();
        let clone = handle.clone();
        assert!(handle.check().is_ok());
        clone.cancel("shard closing");
        clone.cancel("relocating");
        assert!(handle.is_cancelled());
        match handle.check() {
            Err(SegrepError::Cancelled { reason }) => assert_eq!(reason, "shard closing"),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
