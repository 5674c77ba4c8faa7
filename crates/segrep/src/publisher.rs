//! Checkpoint publishers.
//!
//! A primary announces each new durable state by emitting a
//! [`CheckpointAvailable`] event on a channel. Subscribers (the replica
//! dispatcher, the remote uploader) drain the receiving end. Segment
//! checkpoints additionally run the shard's own "published" bookkeeping;
//! merged-segment checkpoints do not.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::checkpoint::{MergedSegmentCheckpoint, ReplicationCheckpoint};
use crate::error::{SegrepError, SegrepResult};
use crate::shard::ShardId;

/// A new checkpoint on a primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointAvailable {
    /// Produced by a refresh or commit.
    Segment(ReplicationCheckpoint),
    /// Produced by a segment merge.
    Merged(MergedSegmentCheckpoint),
}

impl CheckpointAvailable {
    /// The shard the checkpoint belongs to.
    pub fn shard_id(&self) -> &ShardId {
        &self.checkpoint().shard_id
    }

    /// The underlying checkpoint.
    pub fn checkpoint(&self) -> &ReplicationCheckpoint {
        match self {
            CheckpointAvailable::Segment(cp) => cp,
            CheckpointAvailable::Merged(merged) => &merged.checkpoint,
        }
    }
}

/// The shard side of publishing.
pub trait PublishingShard: Send + Sync {
    /// The shard.
    fn shard_id(&self) -> &ShardId;
    /// True if this copy is the primary.
    fn is_primary(&self) -> bool;
    /// True if at least one replica or a remote store receives checkpoints.
    fn has_replication_targets(&self) -> bool;
    /// Bookkeeping run after a segment checkpoint was handed off.
    fn on_checkpoint_published(&self, checkpoint: &ReplicationCheckpoint);
}

/// Publisher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStats {
    /// Events emitted.
    pub published: u64,
    /// Calls skipped because the shard was not eligible.
    pub skipped: u64,
}

#[derive(Debug, Default)]
struct PublisherStatsInner {
    published: AtomicU64,
    skipped: AtomicU64,
}

impl PublisherStatsInner {
    fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            published: self.published.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
struct Channel {
    sender: mpsc::Sender<CheckpointAvailable>,
    stats: Arc<PublisherStatsInner>,
}

/// Receiving end of a publisher channel.
#[derive(Debug)]
pub struct CheckpointReceiver {
    receiver: mpsc::Receiver<CheckpointAvailable>,
}

impl CheckpointReceiver {
    /// Next event; `None` once every publisher is dropped.
    pub async fn recv(&mut self) -> Option<CheckpointAvailable> {
        self.receiver.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<CheckpointAvailable> {
        self.receiver.try_recv().ok()
    }
}

/// Create a segment and merged publisher sharing one bounded channel.
pub fn checkpoint_channel(capacity: usize) -> (CheckpointPublisher, MergedSegmentPublisher, CheckpointReceiver) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let segment = CheckpointPublisher {
        channel: Some(Channel {
            sender: sender.clone(),
            stats: Arc::new(PublisherStatsInner::default()),
        }),
    };
    let merged = MergedSegmentPublisher {
        channel: Some(Channel {
            sender,
            stats: Arc::new(PublisherStatsInner::default()),
        }),
    };
    (segment, merged, CheckpointReceiver { receiver })
}

async fn emit(channel: &Channel, event: CheckpointAvailable) -> SegrepResult<()> {
    let shard = event.shard_id().clone();
    channel.sender.send(event).await.map_err(|_| {
        warn!(shard = %shard, "checkpoint subscribers are gone");
        SegrepError::ShardClosed { shard }
    })?;
    channel.stats.published.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

fn eligible(shard: &dyn PublishingShard) -> bool {
    shard.is_primary() && shard.has_replication_targets()
}

/// Publishes refresh/commit checkpoints.
#[derive(Debug)]
pub struct CheckpointPublisher {
    channel: Option<Channel>,
}

impl CheckpointPublisher {
    /// Publisher that does nothing, for replicas and remote-only nodes.
    pub const EMPTY: CheckpointPublisher = CheckpointPublisher { channel: None };

    /// Announce `checkpoint` for `shard`, then run the shard's bookkeeping.
    ///
    /// Returns `false` without side effects if this is the empty publisher or
    /// the shard is not an eligible primary.
    pub async fn publish(&self, shard: &dyn PublishingShard, checkpoint: ReplicationCheckpoint) -> SegrepResult<bool> {
        let Some(channel) = &self.channel else {
            return Ok(false);
        };
        if !eligible(shard) {
            channel.stats.skipped.fetch_add(1, Ordering::Relaxed);
            debug!(shard = %shard.shard_id(), "shard not eligible for checkpoint publish");
            return Ok(false);
        }
        info!(shard = %shard.shard_id(), checkpoint = %checkpoint.key(), "publishing checkpoint");
        emit(channel, CheckpointAvailable::Segment(checkpoint.clone())).await?;
        shard.on_checkpoint_published(&checkpoint);
        Ok(true)
    }

    /// True for [`CheckpointPublisher::EMPTY`].
    pub fn is_empty(&self) -> bool {
        self.channel.is_none()
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> PublisherStats {
        self.channel
            .as_ref()
            .map(|c| c.stats.snapshot())
            .unwrap_or_default()
    }
}

/// Publishes merged-segment checkpoints. Merges change how data is stored,
/// not what is readable, so there is no local completion callback.
#[derive(Debug)]
pub struct MergedSegmentPublisher {
    channel: Option<Channel>,
}

impl MergedSegmentPublisher {
    /// Publisher that does nothing.
    pub const EMPTY: MergedSegmentPublisher = MergedSegmentPublisher { channel: None };

    /// Announce a merged segment for `shard`.
    pub async fn publish(&self, shard: &dyn PublishingShard, checkpoint: MergedSegmentCheckpoint) -> SegrepResult<bool> {
        let Some(channel) = &self.channel else {
            return Ok(false);
        };
        if !eligible(shard) {
            channel.stats.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        info!(
            shard = %shard.shard_id(),
            segment = %checkpoint.segment_name,
            checkpoint = %checkpoint.checkpoint.key(),
            "publishing merged segment"
        );
        emit(channel, CheckpointAvailable::Merged(checkpoint)).await?;
        Ok(true)
    }

    /// True for [`MergedSegmentPublisher::EMPTY`].
    pub fn is_empty(&self) -> bool {
        self.channel.is_none()
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> PublisherStats {
        self.channel
            .as_ref()
            .map(|c| c.stats.snapshot())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CURRENT_CODEC_VERSION;
    use parking_lot::Mutex;
    use std::collections::BTreeMap;

    struct TestShard {
        shard_id: ShardId,
        primary: bool,
        targets: bool,
        published: Mutex<Vec<ReplicationCheckpoint>>,
    }

    impl TestShard {
        fn new(primary: bool, targets: bool) -> Self {
            Self {
                shard_id: ShardId::new("logs", "idx", 0),
                primary,
                targets,
                published: Mutex::new(Vec::new()),
            }
        }
    }

    impl PublishingShard for TestShard {
        fn shard_id(&self) -> &ShardId {
            &self.shard_id
        }
        fn is_primary(&self) -> bool {
            self.primary
        }
        fn has_replication_targets(&self) -> bool {
            self.targets
        }
        fn on_checkpoint_published(&self, checkpoint: &ReplicationCheckpoint) {
            self.published.lock().push(checkpoint.clone());
        }
    }

    fn checkpoint(generation: u64) -> ReplicationCheckpoint {
        ReplicationCheckpoint::new(
            ShardId::new("logs", "idx", 0),
            1,
            generation,
            generation,
            CURRENT_CODEC_VERSION,
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn test_publish_emits_then_callback() {
        let (publisher, _merged, mut rx) = checkpoint_channel(8);
        let shard = TestShard::new(true, true);
        assert!(publisher.publish(&shard, checkpoint(5)).await.unwrap());
        assert_eq!(rx.try_recv(), Some(CheckpointAvailable::Segment(checkpoint(5))));
        assert_eq!(shard.published.lock().len(), 1);
        assert_eq!(publisher.stats().published, 1);
    }

    #[tokio::test]
    async fn test_ineligible_shard_skipped() {
        let (publisher, _merged, mut rx) = checkpoint_channel(8);
        let replica = TestShard::new(false, true);
        let lonely_primary = TestShard::new(true, false);
        assert!(!publisher.publish(&replica, checkpoint(1)).await.unwrap());
        assert!(!publisher.publish(&lonely_primary, checkpoint(1)).await.unwrap());
        assert!(rx.try_recv().is_none());
        assert!(replica.published.lock().is_empty());
        assert_eq!(publisher.stats().skipped, 2);
    }

    #[tokio::test]
    async fn test_empty_is_noop() {
        let shard = TestShard::new(true, true);
        assert!(CheckpointPublisher::EMPTY.is_empty());
        assert!(!CheckpointPublisher::EMPTY.publish(&shard, checkpoint(1)).await.unwrap());
        assert!(shard.published.lock().is_empty());
        assert_eq!(CheckpointPublisher::EMPTY.stats(), PublisherStats::default());
        let merged = MergedSegmentCheckpoint::new(checkpoint(1), "_0");
        assert!(!MergedSegmentPublisher::EMPTY.publish(&shard, merged).await.unwrap());
    }

    #[tokio::test]
    async fn test_merged_has_no_callback() {
        let (_publisher, merged, mut rx) = checkpoint_channel(8);
        let shard = TestShard::new(true, true);
        let event = MergedSegmentCheckpoint::new(checkpoint(3), "_2");
        assert!(merged.publish(&shard, event.clone()).await.unwrap());
        assert_eq!(rx.try_recv(), Some(CheckpointAvailable::Merged(event)));
        assert!(shard.published.lock().is_empty());
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let (publisher, _merged, rx) = checkpoint_channel(1);
        drop(rx);
        let shard = TestShard::new(true, true);
        let err = publisher.publish(&shard, checkpoint(1)).await.unwrap_err();
        assert!(matches!(err, SegrepError::ShardClosed { .. }));
        assert!(shard.published.lock().is_empty());
    }
}
