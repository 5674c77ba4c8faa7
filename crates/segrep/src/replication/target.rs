//! One replication round on a replica.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointKey, ReplicationCheckpoint};
use crate::directory::{Directory, TEMP_FILE_PREFIX};
use crate::engine::nrt::{FileRefTracker, NrtReplicationEngine};
use crate::error::{SegrepError, SegrepResult};
use crate::manifest::{segment_replication_diff, StoreFileMetadata};
use crate::remote::lock::LockGuard;
use crate::replication::source::{CheckpointInfo, ReplicationSource};
use crate::replication::CancellationHandle;

static NEXT_ROUND_ID: AtomicU64 = AtomicU64::new(1);

/// How a round ended when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// A new generation is being served.
    Applied {
        /// The generation applied.
        checkpoint: CheckpointKey,
        /// Files transferred.
        files_fetched: usize,
        /// Bytes transferred.
        bytes_fetched: u64,
        /// Local files reused.
        files_reused: usize,
    },
    /// Nothing to do; the replica already serves this state or newer.
    Skipped {
        /// Ordering key the replica serves.
        current: CheckpointKey,
    },
}

/// Keeps reused local files referenced for the duration of a round.
struct PinnedFiles {
    tracker: Arc<FileRefTracker>,
    files: Vec<String>,
}

impl Drop for PinnedFiles {
    fn drop(&mut self) {
        self.tracker.dec_ref(&self.files);
    }
}

/// Fetch, verify and apply one checkpoint.
pub struct SegmentReplicationTarget {
    id: u64,
    engine: Arc<NrtReplicationEngine>,
    source: Arc<dyn ReplicationSource>,
    checkpoint: ReplicationCheckpoint,
    cancel: CancellationHandle,
}

impl SegmentReplicationTarget {
    /// Prepare a round replicating towards `checkpoint`.
    pub fn new(
        engine: Arc<NrtReplicationEngine>,
        source: Arc<dyn ReplicationSource>,
        checkpoint: ReplicationCheckpoint,
        cancel: CancellationHandle,
    ) -> Self {
        Self {
            id: NEXT_ROUND_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            source,
            checkpoint,
            cancel,
        }
    }

    /// Round id, unique within the process.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run the round. On any failure or cancellation, partially fetched files
    /// are deleted, the source lock is released and the served generation is
    /// untouched.
    pub async fn run(self) -> SegrepResult<ReplicationOutcome> {
        self.cancel.check()?;
        let mut info = self.source.get_checkpoint_info(&self.checkpoint).await?;
        let lock = info.lock.take();

        let mut written = Vec::new();
        let result = self.fetch_and_apply(&info, &mut written).await;
        if result.is_err() {
            self.cleanup(&written);
        }
        release_lock(lock).await;
        result
    }

    async fn fetch_and_apply(&self, info: &CheckpointInfo, written: &mut Vec<String>) -> SegrepResult<ReplicationOutcome> {
        let current = self.engine.current_checkpoint();
        if !info.manifest.checkpoint.is_ahead_of(&current) {
            debug!(
                round = self.id,
                current = %current.key(),
                offered = %info.manifest.checkpoint.key(),
                "replica already up to date"
            );
            return Ok(ReplicationOutcome::Skipped {
                current: current.key(),
            });
        }

        let directory = self.engine.directory();
        let tracker = Arc::clone(self.engine.file_refs());
        let source_files = &info.manifest.checkpoint.metadata_map;
        let local = local_metadata(directory.as_ref(), source_files)?;
        let diff = segment_replication_diff(source_files, &local);

        if let Some(in_use) = diff.different.iter().find(|f| tracker.is_referenced(&f.name)) {
            return Err(SegrepError::corrupt(format!(
                "local copy of [{}] differs from {} and is in use",
                in_use.name,
                self.source.description()
            )));
        }

        let reused: Vec<String> = diff.identical.iter().map(|f| f.name.clone()).collect();
        tracker.inc_ref(&reused);
        let _pinned = PinnedFiles {
            tracker: Arc::clone(&tracker),
            files: reused,
        };

        let mut temps = Vec::new();
        let mut bytes_fetched = 0u64;
        let to_fetch = diff.to_fetch();
        for file in &to_fetch {
            self.cancel.check()?;
            let data = self.source.get_file(info, file).await?;
            file.verify(&data)?;
            let temp = format!("{}{}.{}", TEMP_FILE_PREFIX, self.id, file.name);
            written.push(temp.clone());
            directory.write_file(&temp, &data)?;
            bytes_fetched += data.len() as u64;
            temps.push((temp, file.name.clone()));
            debug!(round = self.id, file = %file.name, size = data.len(), "fetched segment file");
        }

        self.cancel.check()?;
        for (temp, name) in &temps {
            directory.rename(temp, name)?;
            written.push(name.clone());
        }

        match self.engine.update_segments(info.manifest.clone()) {
            Ok(()) => {}
            Err(e) if e.is_stale() => {
                // a newer generation won meanwhile; what we fetched is unused
                self.cleanup(written);
                written.clear();
                return Ok(ReplicationOutcome::Skipped {
                    current: self.engine.current_checkpoint().key(),
                });
            }
            Err(e) => return Err(e),
        }
        // applied: the files now belong to the served generation
        written.clear();

        info!(
            round = self.id,
            checkpoint = %info.manifest.checkpoint.key(),
            files_fetched = to_fetch.len(),
            bytes_fetched,
            "replication round applied"
        );
        Ok(ReplicationOutcome::Applied {
            checkpoint: info.manifest.checkpoint.key(),
            files_fetched: to_fetch.len(),
            bytes_fetched,
            files_reused: diff.identical.len(),
        })
    }

    /// Copy the requested checkpoint's files that are not local yet, without
    /// publishing a generation. Used for merged segments: the files land
    /// unreferenced and are reused by the round that first applies a
    /// generation listing them. Returns the number of files copied.
    pub async fn prewarm(self) -> SegrepResult<usize> {
        self.cancel.check()?;
        let mut info = self.source.get_checkpoint_info(&self.checkpoint).await?;
        let lock = info.lock.take();

        let mut written = Vec::new();
        let result = self.fetch_missing(&info, &mut written).await;
        if result.is_err() {
            self.cleanup(&written);
        }
        release_lock(lock).await;
        result
    }

    async fn fetch_missing(&self, info: &CheckpointInfo, written: &mut Vec<String>) -> SegrepResult<usize> {
        let directory = self.engine.directory();
        let wanted = &self.checkpoint.metadata_map;
        let local = local_metadata(directory.as_ref(), wanted)?;
        let offered = &info.manifest.checkpoint.metadata_map;

        let mut fetched = 0;
        for file in segment_replication_diff(wanted, &local).missing {
            if !offered.get(&file.name).is_some_and(|o| o.is_same(&file)) {
                debug!(round = self.id, file = %file.name, "source no longer offers merged file");
                continue;
            }
            self.cancel.check()?;
            let data = self.source.get_file(info, &file).await?;
            file.verify(&data)?;
            let temp = format!("{}{}.{}", TEMP_FILE_PREFIX, self.id, file.name);
            written.push(temp.clone());
            directory.write_file(&temp, &data)?;
            directory.rename(&temp, &file.name)?;
            written.push(file.name.clone());
            fetched += 1;
        }
        written.clear();
        if fetched > 0 {
            info!(round = self.id, checkpoint = %self.checkpoint.key(), files = fetched, "pre-copied merged segment files");
        }
        Ok(fetched)
    }

    fn cleanup(&self, written: &[String]) {
        let directory = self.engine.directory();
        let tracker = self.engine.file_refs();
        for name in written {
            if tracker.is_referenced(name) {
                continue;
            }
            if let Err(e) = directory.delete_file(name) {
                warn!(round = self.id, file = %name, error = %e, "failed to delete partial file");
            }
        }
    }
}

async fn release_lock(lock: Option<LockGuard>) {
    let Some(lock) = lock else {
        return;
    };
    let generation = lock.generation();
    if let Err(e) = lock.release().await {
        warn!(generation, error = %e, "failed to release source lock");
    }
}

fn local_metadata(
    directory: &dyn Directory,
    wanted: &BTreeMap<String, StoreFileMetadata>,
) -> SegrepResult<BTreeMap<String, StoreFileMetadata>> {
    let mut local = BTreeMap::new();
    for (name, meta) in wanted {
        match directory.read_file(name) {
            Ok(data) => {
                local.insert(name.clone(), StoreFileMetadata::of(name.clone(), &data, meta.written_by));
            }
            Err(SegrepError::FileNotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(local)
}
