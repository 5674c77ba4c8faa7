//! Error types for the segment replication subsystem.

use thiserror::Error;

use crate::shard::ShardId;

/// Result type alias for segment replication operations.
pub type SegrepResult<T> = Result<T, SegrepError>;

/// Error variants for segment replication.
#[derive(Debug, Error)]
pub enum SegrepError {
    /// A manifest or checkpoint older than the current reader state was offered.
    #[error("stale generation: current {current}, received {received}")]
    StaleGeneration {
        /// Ordering key of the state already applied, rendered as `term/gen/version`.
        current: String,
        /// Ordering key of the rejected state.
        received: String,
    },

    /// A metadata version that was never shipped.
    #[error("unsupported metadata version {version}, supported: {supported:?}")]
    UnsupportedVersion {
        /// The requested version.
        version: u32,
        /// Versions this build can read and write.
        supported: Vec<u32>,
    },

    /// The repository backing the remote store could not be resolved.
    #[error("repository [{repository}] is missing")]
    RepositoryMissing {
        /// Name of the repository.
        repository: String,
    },

    /// Release of a lock that was never acquired (or already released).
    #[error("lock not found for generation {generation} owned by [{owner}]")]
    LockNotFound {
        /// Segments generation the lock was expected on.
        generation: u64,
        /// Acquirer id.
        owner: String,
    },

    /// The local shard is no longer the primary for the expected term.
    #[error("{shard} is not the primary: expected term {expected_term}, actual term {actual_term}")]
    ShardNotPrimary {
        /// The shard.
        shard: ShardId,
        /// Term the operation was started under.
        expected_term: u64,
        /// Term currently known to the shard.
        actual_term: u64,
    },

    /// A manifest failed structural, length or checksum validation.
    #[error("corrupt manifest: {reason}")]
    CorruptManifest {
        /// Description of the corruption.
        reason: String,
    },

    /// A replicated operation gave up after exhausting its retries.
    #[error("operation failed after {attempts} attempts: {reason}")]
    OperationFailed {
        /// Number of primary attempts made.
        attempts: u32,
        /// Last failure.
        reason: String,
    },

    /// A blob was expected at a path but does not exist.
    #[error("blob not found: {path}")]
    BlobNotFound {
        /// Full blob path.
        path: String,
    },

    /// A local segment file does not exist.
    #[error("file not found: {name}")]
    FileNotFound {
        /// File name.
        name: String,
    },

    /// The shard was closed while work was pending.
    #[error("{shard} is closed")]
    ShardClosed {
        /// The shard.
        shard: ShardId,
    },

    /// A replica copy diverged from its source and stopped replicating until
    /// it is reset.
    #[error("{shard} failed: {reason}")]
    ShardFailed {
        /// The shard.
        shard: ShardId,
        /// Failure that stopped the copy.
        reason: String,
    },

    /// In-flight work was cancelled.
    #[error("cancelled: {reason}")]
    Cancelled {
        /// Why the work was cancelled.
        reason: String,
    },

    /// A bounded wait elapsed.
    #[error("timed out after {timeout_ms}ms waiting for {what}")]
    Timeout {
        /// What was being waited on.
        what: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// A replica copy failed to apply a replicated operation.
    #[error("replica [{allocation_id}] failed: {reason}")]
    ReplicaFailed {
        /// Allocation id of the failed copy.
        allocation_id: String,
        /// Failure message.
        reason: String,
    },

    /// Fewer copies acknowledged than the ack policy requires.
    #[error("insufficient copies acknowledged: {acked} of {required} required")]
    InsufficientCopies {
        /// Copies that acknowledged, primary included.
        acked: usize,
        /// Copies required by the policy.
        required: usize,
    },

    /// Indexing rejected because too many replicas lag behind.
    #[error("rejected write on {shard}: {stale_replicas} of {total_replicas} replicas are stale")]
    ReplicationPressure {
        /// The shard.
        shard: ShardId,
        /// Replicas over the lag limits.
        stale_replicas: usize,
        /// Replicas tracked.
        total_replicas: usize,
    },

    /// Invalid configuration.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the problem.
        reason: String,
    },

    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

impl SegrepError {
    /// Shorthand for a [`SegrepError::CorruptManifest`].
    pub fn corrupt(reason: impl Into<String>) -> Self {
        SegrepError::CorruptManifest {
            reason: reason.into(),
        }
    }

    /// Errors a coordinator may retry by re-resolving routing or resending.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SegrepError::ShardNotPrimary { .. }
                | SegrepError::Timeout { .. }
                | SegrepError::ReplicaFailed { .. }
        )
    }

    /// Storage-format and configuration faults that must never be masked.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SegrepError::UnsupportedVersion { .. }
                | SegrepError::RepositoryMissing { .. }
                | SegrepError::CorruptManifest { .. }
        )
    }

    /// True for stale-generation rejections, which callers absorb.
    pub fn is_stale(&self) -> bool {
        matches!(self, SegrepError::StaleGeneration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_alias() {
        let ok: SegrepResult<u64> = Ok(5);
        assert!(ok.is_ok());

        let err: SegrepResult<u64> = Err(SegrepError::corrupt("bad footer"));
        assert!(err.is_err());
    }

    #[test]
    fn test_io_error_from_std() {
        let std_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: SegrepError = std_err.into();
        assert!(matches!(err, SegrepError::Io(_)));
    }

    #[test]
    fn test_unsupported_version_display() {
        let err = SegrepError::UnsupportedVersion {
            version: 3,
            supported: vec![1, 2],
        };
        let msg = format!("{}", err);
        assert!(msg.contains('3'));
        assert!(msg.contains("[1, 2]"));
    }

    #[test]
    fn test_lock_not_found_display() {
        let err = SegrepError::LockNotFound {
            generation: 5,
            owner: "r1".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "lock not found for generation 5 owned by [r1]"
        );
    }

    #[test]
    fn test_shard_not_primary_display() {
        let err = SegrepError::ShardNotPrimary {
            shard: ShardId::new("logs", "uuid-1", 0),
            expected_term: 1,
            actual_term: 2,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("[logs][0]"));
        assert!(msg.contains("expected term 1"));
    }

    #[test]
    fn test_classification() {
        let stale = SegrepError::StaleGeneration {
            current: "1/6/11".into(),
            received: "1/5/10".into(),
        };
        assert!(stale.is_stale());
        assert!(!stale.is_fatal());
        assert!(!stale.is_retryable());

        let not_primary = SegrepError::ShardNotPrimary {
            shard: ShardId::new("logs", "uuid-1", 0),
            expected_term: 1,
            actual_term: 2,
        };
        assert!(not_primary.is_retryable());
        assert!(!not_primary.is_fatal());

        assert!(SegrepError::corrupt("x").is_fatal());
        assert!(SegrepError::RepositoryMissing {
            repository: "r".into()
        }
        .is_fatal());
        assert!(!SegrepError::RepositoryMissing {
            repository: "r".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_shard_failed_display() {
        let err = SegrepError::ShardFailed {
            shard: ShardId::new("logs", "uuid-1", 0),
            reason: "local copy of [_1.seg] differs".into(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("[logs][0] failed"));
        assert!(msg.contains("_1.seg"));
        assert!(!err.is_retryable());
        assert!(!err.is_fatal());
    }
}
