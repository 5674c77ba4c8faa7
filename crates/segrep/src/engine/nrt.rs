//! Replica-side near-real-time reader manager.
//!
//! The engine never indexes. It accepts complete manifests whose files are
//! already in the local directory and publishes each as an immutable
//! [`ReaderSnapshot`]. The current snapshot pointer is the only shared mutable
//! cell. It lives in an [`ArcSwap`]: readers load it without locking and an
//! apply publishes with compare-and-swap against the snapshot it validated
//! from, so a concurrent newer apply makes the older one lose and report
//! itself stale.
//!
//! Every snapshot holds a reference on each of its files through the
//! [`FileRefTracker`]; a file whose count drops to zero is deleted, so an old
//! generation's files live exactly as long as its last [`ReaderView`].
//!
//! A copy whose local files diverged from its source is marked
//! [`ReaderState::Failed`] and refuses further generations until
//! [`NrtReplicationEngine::reset`] empties it.

use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{CheckpointKey, ReplicationCheckpoint};
use crate::directory::Directory;
use crate::engine::{decode_segment, Document};
use crate::error::{SegrepError, SegrepResult};
use crate::manifest::{SegmentInfos, SegmentManifest};
use crate::shard::ShardId;

/// Lifecycle of a replica reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No generation loaded.
    Empty,
    /// Serving the current generation.
    Steady,
    /// Validating a pending generation; readers still see the current one.
    Swapping {
        /// Ordering key of the generation being validated.
        pending: CheckpointKey,
    },
    /// Local copy diverged; generations are refused until reset.
    Failed,
    /// Shard closed.
    Closed,
}

/// Reference counts of local files held by reader snapshots.
pub struct FileRefTracker {
    directory: Arc<dyn Directory>,
    refs: Mutex<HashMap<String, usize>>,
    reclaimed: AtomicU64,
}

impl FileRefTracker {
    /// Create a tracker deleting unreferenced files from `directory`.
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self {
            directory,
            refs: Mutex::new(HashMap::new()),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Add a reference to each file.
    pub fn inc_ref(&self, files: &[String]) {
        let mut refs = self.refs.lock();
        for file in files {
            *refs.entry(file.clone()).or_insert(0) += 1;
        }
    }

    /// Drop a reference to each file, deleting files no longer referenced.
    pub fn dec_ref(&self, files: &[String]) {
        let mut unreferenced = Vec::new();
        {
            let mut refs = self.refs.lock();
            for file in files {
                if let Some(count) = refs.get_mut(file) {
                    *count -= 1;
                    if *count == 0 {
                        refs.remove(file);
                        unreferenced.push(file.clone());
                    }
                }
            }
            // deleted under the lock: inc_ref must never see a half-deleted file
            for file in &unreferenced {
                match self.directory.delete_file(file) {
                    Ok(()) => {
                        self.reclaimed.fetch_add(1, Ordering::Relaxed);
                        debug!(file = %file, "reclaimed unreferenced segment file");
                    }
                    Err(e) => warn!(file = %file, error = %e, "failed to delete unreferenced file"),
                }
            }
        }
    }

    /// Current reference count of `file`.
    pub fn ref_count(&self, file: &str) -> usize {
        self.refs.lock().get(file).copied().unwrap_or(0)
    }

    /// True if any snapshot references `file`.
    pub fn is_referenced(&self, file: &str) -> bool {
        self.ref_count(file) > 0
    }

    /// Files deleted so far.
    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for FileRefTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRefTracker")
            .field("files", &self.refs.lock().len())
            .finish()
    }
}

/// One immutable generation.
#[derive(Debug)]
pub struct ReaderSnapshot {
    manifest: SegmentManifest,
    files: Vec<String>,
    tracker: Arc<FileRefTracker>,
}

impl ReaderSnapshot {
    fn new(manifest: SegmentManifest, tracker: Arc<FileRefTracker>) -> Self {
        let files = manifest.file_names();
        tracker.inc_ref(&files);
        Self {
            manifest,
            files,
            tracker,
        }
    }
}

impl Drop for ReaderSnapshot {
    fn drop(&mut self) {
        self.tracker.dec_ref(&self.files);
    }
}

/// A pinned generation. The generation's files stay on disk until every view
/// on it is dropped.
#[derive(Clone)]
pub struct ReaderView {
    snapshot: Arc<ReaderSnapshot>,
    directory: Arc<dyn Directory>,
}

impl ReaderView {
    /// Checkpoint of the pinned generation.
    pub fn checkpoint(&self) -> &ReplicationCheckpoint {
        &self.snapshot.manifest.checkpoint
    }

    /// Ordering key of the pinned generation.
    pub fn key(&self) -> CheckpointKey {
        self.checkpoint().key()
    }

    /// Segments generation.
    pub fn generation(&self) -> u64 {
        self.snapshot.manifest.generation()
    }

    /// Segment list of the pinned generation.
    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.snapshot.manifest.infos
    }

    /// Files of the pinned generation.
    pub fn file_names(&self) -> &[String] {
        &self.snapshot.files
    }

    /// Live documents, per the segment list.
    pub fn doc_count(&self) -> u64 {
        self.snapshot.manifest.infos.doc_count()
    }

    /// Read every document of the pinned generation, oldest segment first.
    pub fn documents(&self) -> SegrepResult<Vec<Document>> {
        let mut docs = Vec::new();
        for file in self.snapshot.manifest.infos.files() {
            let data = self.directory.read_file(file)?;
            docs.extend(decode_segment(file, &data)?);
        }
        Ok(docs)
    }

    /// Release the view.
    pub fn release(self) {}
}

impl std::fmt::Debug for ReaderView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReaderView")
            .field("checkpoint", &self.key())
            .field("files", &self.snapshot.files)
            .finish()
    }
}

/// Counters for one reader manager.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NrtStats {
    /// Generations published.
    pub updates_applied: u64,
    /// Manifests rejected as older than the current generation.
    pub stale_rejected: u64,
    /// Manifests equal to the current generation.
    pub duplicates_ignored: u64,
    /// Manifests rejected because local files did not match.
    pub corrupt_rejected: u64,
    /// Views handed out.
    pub views_acquired: u64,
    /// Unreferenced files deleted.
    pub files_reclaimed: u64,
}

#[derive(Debug, Default)]
struct NrtStatsInner {
    updates_applied: AtomicU64,
    stale_rejected: AtomicU64,
    duplicates_ignored: AtomicU64,
    corrupt_rejected: AtomicU64,
    views_acquired: AtomicU64,
}

/// Replica-side engine for one shard copy.
pub struct NrtReplicationEngine {
    shard_id: ShardId,
    directory: Arc<dyn Directory>,
    tracker: Arc<FileRefTracker>,
    current: ArcSwap<ReaderSnapshot>,
    state: Mutex<ReaderState>,
    failure: Mutex<Option<String>>,
    applied_tx: watch::Sender<CheckpointKey>,
    stats: NrtStatsInner,
}

impl NrtReplicationEngine {
    /// Open an empty reader over `directory`.
    pub fn new(shard_id: ShardId, directory: Arc<dyn Directory>) -> SegrepResult<Self> {
        let tracker = Arc::new(FileRefTracker::new(Arc::clone(&directory)));
        let snapshot = Arc::new(ReaderSnapshot::new(empty_manifest(&shard_id)?, Arc::clone(&tracker)));
        let (applied_tx, _) = watch::channel(snapshot.manifest.checkpoint.key());
        info!(shard = %shard_id, "opened replica reader");
        Ok(Self {
            shard_id,
            directory,
            tracker,
            current: ArcSwap::new(snapshot),
            state: Mutex::new(ReaderState::Empty),
            failure: Mutex::new(None),
            applied_tx,
            stats: NrtStatsInner::default(),
        })
    }

    /// The shard.
    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Local directory.
    pub fn directory(&self) -> Arc<dyn Directory> {
        Arc::clone(&self.directory)
    }

    /// File reference tracker.
    pub fn file_refs(&self) -> &Arc<FileRefTracker> {
        &self.tracker
    }

    /// Lifecycle state.
    pub fn state(&self) -> ReaderState {
        *self.state.lock()
    }

    /// Checkpoint currently served.
    pub fn current_checkpoint(&self) -> ReplicationCheckpoint {
        self.current.load().manifest.checkpoint.clone()
    }

    /// Manifest currently served.
    pub fn current_manifest(&self) -> SegmentManifest {
        self.current.load().manifest.clone()
    }

    /// Watch the ordering key of the served generation.
    pub fn subscribe(&self) -> watch::Receiver<CheckpointKey> {
        self.applied_tx.subscribe()
    }

    /// Publish `manifest` as the new generation.
    ///
    /// Fails with [`SegrepError::StaleGeneration`] if the manifest is older
    /// than the served generation, including when a newer apply wins the
    /// swap while this one validates; the served state is unchanged and
    /// callers are expected to discard the delivery. Re-delivering the served
    /// generation is a no-op. Fails with [`SegrepError::CorruptManifest`] if
    /// any referenced local file is missing or does not match.
    pub fn update_segments(&self, manifest: SegmentManifest) -> SegrepResult<()> {
        self.check_open()?;

        let mut expected = self.current.load_full();
        let current_key = expected.manifest.checkpoint.key();
        let incoming_key = manifest.checkpoint.key();
        if incoming_key == current_key {
            self.stats.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
            debug!(shard = %self.shard_id, checkpoint = %incoming_key, "generation already served");
            return Ok(());
        }
        if incoming_key < current_key {
            return Err(self.reject_stale(current_key, incoming_key));
        }

        self.set_state(ReaderState::Swapping {
            pending: incoming_key,
        });
        if let Err(e) = self.validate_local_files(&manifest) {
            self.stats.corrupt_rejected.fetch_add(1, Ordering::Relaxed);
            self.settle_state();
            return Err(e);
        }

        let next = Arc::new(ReaderSnapshot::new(manifest, Arc::clone(&self.tracker)));
        loop {
            let previous = self.current.compare_and_swap(&expected, Arc::clone(&next));
            if Arc::ptr_eq(&*previous, &expected) {
                break;
            }
            let winner = Guard::into_inner(previous);
            let winner_key = winner.manifest.checkpoint.key();
            if winner_key >= incoming_key {
                // release our references before reporting
                drop(next);
                self.settle_state();
                return Err(self.reject_stale(winner_key, incoming_key));
            }
            expected = winner;
        }
        drop(expected);

        self.set_state(ReaderState::Steady);
        self.stats.updates_applied.fetch_add(1, Ordering::Relaxed);
        self.applied_tx.send_if_modified(|served| {
            if incoming_key > *served {
                *served = incoming_key;
                true
            } else {
                false
            }
        });
        info!(
            shard = %self.shard_id,
            previous = %current_key,
            checkpoint = %incoming_key,
            "swapped reader generation"
        );
        Ok(())
    }

    fn check_open(&self) -> SegrepResult<()> {
        match *self.state.lock() {
            ReaderState::Closed => Err(SegrepError::ShardClosed {
                shard: self.shard_id.clone(),
            }),
            ReaderState::Failed => Err(SegrepError::ShardFailed {
                shard: self.shard_id.clone(),
                reason: self.failure.lock().clone().unwrap_or_default(),
            }),
            _ => Ok(()),
        }
    }

    fn reject_stale(&self, current: CheckpointKey, received: CheckpointKey) -> SegrepError {
        self.stats.stale_rejected.fetch_add(1, Ordering::Relaxed);
        debug!(
            shard = %self.shard_id,
            current = %current,
            received = %received,
            "rejected stale generation"
        );
        SegrepError::StaleGeneration {
            current: current.to_string(),
            received: received.to_string(),
        }
    }

    /// Closed and Failed are sticky.
    fn set_state(&self, next: ReaderState) {
        let mut state = self.state.lock();
        if !matches!(*state, ReaderState::Closed | ReaderState::Failed) {
            *state = next;
        }
    }

    fn settle_state(&self) {
        let loaded = self.current.load().manifest.checkpoint.key() != self.empty_key();
        self.set_state(if loaded {
            ReaderState::Steady
        } else {
            ReaderState::Empty
        });
    }

    fn empty_key(&self) -> CheckpointKey {
        ReplicationCheckpoint::empty(self.shard_id.clone()).key()
    }

    fn validate_local_files(&self, manifest: &SegmentManifest) -> SegrepResult<()> {
        manifest.validate()?;
        for (name, meta) in &manifest.checkpoint.metadata_map {
            let data = self.directory.read_file(name).map_err(|e| match e {
                SegrepError::FileNotFound { .. } => {
                    SegrepError::corrupt(format!("manifest references missing file [{}]", name))
                }
                other => other,
            })?;
            meta.verify(&data)?;
        }
        Ok(())
    }

    /// Pin the served generation.
    pub fn acquire(&self) -> SegrepResult<ReaderView> {
        self.check_open()?;
        let snapshot = self.current.load_full();
        self.stats.views_acquired.fetch_add(1, Ordering::Relaxed);
        Ok(ReaderView {
            snapshot,
            directory: Arc::clone(&self.directory),
        })
    }

    /// A view on the served generation if it differs from `view`'s.
    pub fn refresh_if_needed(&self, view: &ReaderView) -> SegrepResult<Option<ReaderView>> {
        {
            let current = self.current.load();
            if Arc::ptr_eq(&*current, &view.snapshot) || current.manifest.checkpoint.key() == view.key() {
                return Ok(None);
            }
        }
        self.acquire().map(Some)
    }

    /// Mark the local copy as diverged. Later generations and new views are
    /// refused with [`SegrepError::ShardFailed`] until [`Self::reset`].
    /// Views already handed out stay readable.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut state = self.state.lock();
        if matches!(*state, ReaderState::Closed | ReaderState::Failed) {
            return;
        }
        *state = ReaderState::Failed;
        error!(shard = %self.shard_id, reason = %reason, "replica copy failed");
        *self.failure.lock() = Some(reason);
    }

    /// Reason the copy was failed, if it is.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().clone()
    }

    /// Drop the served generation and delete every local file no view still
    /// pins, leaving an empty reader ready to recover from scratch. Files
    /// pinned by outstanding views are deleted when those views drop.
    ///
    /// Replication into this engine must be stopped while it resets.
    /// Returns the number of files deleted directly.
    pub fn reset(&self) -> SegrepResult<usize> {
        {
            let mut state = self.state.lock();
            if *state == ReaderState::Closed {
                return Err(SegrepError::ShardClosed {
                    shard: self.shard_id.clone(),
                });
            }
            // refuse applies until the directory is clean
            *state = ReaderState::Failed;
        }

        let empty = Arc::new(ReaderSnapshot::new(empty_manifest(&self.shard_id)?, Arc::clone(&self.tracker)));
        drop(self.current.swap(empty));

        let mut removed = 0;
        for file in self.directory.list_all()? {
            if self.tracker.is_referenced(&file) {
                continue;
            }
            self.directory.delete_file(&file)?;
            removed += 1;
        }

        *self.failure.lock() = None;
        {
            let mut state = self.state.lock();
            if *state != ReaderState::Closed {
                *state = ReaderState::Empty;
            }
        }
        self.applied_tx.send_replace(self.empty_key());
        info!(shard = %self.shard_id, removed, "reset replica copy");
        Ok(removed)
    }

    /// Close the reader. Outstanding views stay readable until dropped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if *state != ReaderState::Closed {
            *state = ReaderState::Closed;
            info!(shard = %self.shard_id, "closed replica reader");
        }
    }

    /// Snapshot of counters.
    pub fn stats(&self) -> NrtStats {
        NrtStats {
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            stale_rejected: self.stats.stale_rejected.load(Ordering::Relaxed),
            duplicates_ignored: self.stats.duplicates_ignored.load(Ordering::Relaxed),
            corrupt_rejected: self.stats.corrupt_rejected.load(Ordering::Relaxed),
            views_acquired: self.stats.views_acquired.load(Ordering::Relaxed),
            files_reclaimed: self.tracker.reclaimed(),
        }
    }
}

fn empty_manifest(shard_id: &ShardId) -> SegrepResult<SegmentManifest> {
    SegmentManifest::new(ReplicationCheckpoint::empty(shard_id.clone()), SegmentInfos::default())
}

impl std::fmt::Debug for NrtReplicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NrtReplicationEngine")
            .field("shard_id", &self.shard_id)
            .field("state", &self.state())
            .finish()
    }
}
