//! Property-based tests for segrep using proptest.
//!
//! These cover the invariants replicas and the remote store rely on: wire
//! formats survive a round trip, replicas never move backwards, readers see
//! whole generations, and garbage collection leaves locked generations alone.

mod common;

use bytes::Bytes;
use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use segrep::checkpoint::{CheckpointKey, ReplicationCheckpoint, CURRENT_CODEC_VERSION};
use segrep::engine::PrimaryEngine;
use segrep::manifest::{SegmentManifest, StoreFileMetadata};
use segrep::remote::{
    GcSweep, MetadataFileName, MetadataHandlerRegistry, RemoteSegmentMetadata, UploadedSegmentMetadata,
};
use segrep::shard::ShardId;

use common::{copy_files, index_in_batches, new_primary, new_replica_engine, shard};

fn any_file_map() -> impl Strategy<Value = BTreeMap<String, StoreFileMetadata>> {
    proptest::collection::btree_map(
        "_[0-9]{1,3}\\.seg",
        proptest::collection::vec(any::<u8>(), 0..64),
        0..8,
    )
    .prop_map(|files| {
        files
            .into_iter()
            .map(|(name, data)| {
                let meta = StoreFileMetadata::of(name.clone(), &data, CURRENT_CODEC_VERSION);
                (name, meta)
            })
            .collect()
    })
}

fn any_checkpoint() -> impl Strategy<Value = ReplicationCheckpoint> {
    (
        "[a-z]{1,12}",
        0u32..64,
        0u64..1_000,
        0u64..100_000,
        0u64..1_000_000,
        any_file_map(),
    )
        .prop_map(|(index, shard_num, term, generation, version, files)| {
            ReplicationCheckpoint::new(
                ShardId::new(index, "4b7e2c", shard_num),
                term,
                generation,
                version,
                CURRENT_CODEC_VERSION,
                files,
            )
        })
}

fn any_key() -> impl Strategy<Value = CheckpointKey> {
    (0u64..4, 0u64..4, 0u64..4).prop_map(|(primary_term, segments_generation, version)| CheckpointKey {
        primary_term,
        segments_generation,
        version,
    })
}

fn uploaded(files: &BTreeMap<String, StoreFileMetadata>) -> BTreeMap<String, UploadedSegmentMetadata> {
    files
        .iter()
        .map(|(name, meta)| (name.clone(), UploadedSegmentMetadata::for_upload(meta)))
        .collect()
}

/// Applying `generations` in this order to a fresh replica.
fn shuffled_generations() -> impl Strategy<Value = Vec<usize>> {
    (2usize..8).prop_flat_map(|n| Just((0..n).collect::<Vec<usize>>()).prop_shuffle())
}

proptest! {
    /// A checkpoint survives the wire format, including one with no files.
    #[test]
    fn test_checkpoint_round_trip(checkpoint in any_checkpoint()) {
        let decoded = ReplicationCheckpoint::from_bytes(checkpoint.to_bytes()).unwrap();
        prop_assert_eq!(decoded, checkpoint);
    }

    /// Checkpoint keys order by term, then generation, then version.
    #[test]
    fn test_checkpoint_key_order_is_lexicographic(a in any_key(), b in any_key()) {
        let expected = (a.primary_term, a.segments_generation, a.version)
            .cmp(&(b.primary_term, b.segments_generation, b.version));
        prop_assert_eq!(a.cmp(&b), expected);
    }

    /// Version 2 metadata decodes to exactly what was written, whether or not
    /// a segment-list blob is embedded.
    #[test]
    fn test_metadata_v2_round_trip(
        checkpoint in any_checkpoint(),
        infos in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let registry = MetadataHandlerRegistry::shipped();
        let metadata = RemoteSegmentMetadata::new(
            uploaded(&checkpoint.metadata_map),
            Bytes::from(infos),
            checkpoint,
        );
        let framed = registry.encode(&metadata, 2).unwrap();
        prop_assert_eq!(registry.decode(&framed).unwrap(), metadata);
    }

    /// Version 1 metadata carries no checkpoint; everything else survives.
    #[test]
    fn test_metadata_v1_round_trip(
        files in any_file_map(),
        generation in 0u64..10_000,
        term in 0u64..100,
        infos in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let registry = MetadataHandlerRegistry::shipped();
        let metadata = RemoteSegmentMetadata::without_checkpoint(uploaded(&files), Bytes::from(infos), generation, term);
        let framed = registry.encode(&metadata, 1).unwrap();
        let decoded = registry.decode(&framed).unwrap();
        prop_assert!(decoded.checkpoint.is_none());
        prop_assert_eq!(decoded, metadata);
    }

    /// A flipped byte anywhere in a framed blob is detected.
    #[test]
    fn test_metadata_corruption_detected(checkpoint in any_checkpoint(), flip in any::<prop::sample::Index>()) {
        let registry = MetadataHandlerRegistry::shipped();
        let metadata = RemoteSegmentMetadata::new(uploaded(&checkpoint.metadata_map), Bytes::new(), checkpoint);
        let mut framed = registry.encode(&metadata, 2).unwrap().to_vec();
        let at = flip.index(framed.len());
        framed[at] ^= 0x5a;
        prop_assert!(registry.decode(&framed).is_err());
    }

    /// Repeated lookups return the same handler instance; unknown versions
    /// are rejected.
    #[test]
    fn test_handler_lookup_is_cached(version in 0u32..8, lookups in 2usize..6) {
        let registry = MetadataHandlerRegistry::shipped();
        if version == 1 || version == 2 {
            let first = registry.get_handler(version).unwrap();
            prop_assert_eq!(first.version(), version);
            for _ in 1..lookups {
                prop_assert!(Arc::ptr_eq(&first, &registry.get_handler(version).unwrap()));
            }
        } else {
            prop_assert!(registry.get_handler(version).is_err());
        }
    }

    /// Whatever order generations arrive in, the served generation is the
    /// newest one seen so far and older deliveries are rejected as stale.
    #[test]
    fn test_replica_generation_is_monotonic(order in shuffled_generations()) {
        let primary = new_primary(1);
        let mut manifests: Vec<SegmentManifest> = Vec::new();
        for _ in 0..order.len() {
            index_in_batches(&primary, 1, 2);
            manifests.push(primary.current_manifest().unwrap());
        }

        let replica = new_replica_engine();
        for manifest in &manifests {
            copy_files(manifest, primary.directory().as_ref(), replica.directory().as_ref());
        }

        let mut newest: Option<CheckpointKey> = None;
        for idx in order {
            let manifest = manifests[idx].clone();
            let key = manifest.checkpoint.key();
            let result = replica.update_segments(manifest);
            match newest {
                Some(served) if key < served => prop_assert!(result.unwrap_err().is_stale()),
                _ => {
                    prop_assert!(result.is_ok());
                    newest = Some(key);
                }
            }
            prop_assert_eq!(Some(replica.current_checkpoint().key()), newest);
        }
    }

    /// A sweep never selects a locked generation, always keeps the newest
    /// `keep_last`, and never deletes a blob a retained generation uses.
    #[test]
    fn test_gc_never_deletes_locked_generations(
        generations in 1u64..12,
        keep_last in 1usize..4,
        locked in proptest::collection::btree_set(1u64..12, 0..4),
    ) {
        let mut metadata = Vec::new();
        let mut files = BTreeMap::new();
        for generation in 1..=generations {
            let name = format!("_{}.seg", generation);
            let meta = StoreFileMetadata::of(name.clone(), name.as_bytes(), CURRENT_CODEC_VERSION);
            files.insert(name, UploadedSegmentMetadata::for_upload(&meta));
            metadata.push((
                MetadataFileName::new(1, generation, generation, "node-0", 2).unwrap(),
                RemoteSegmentMetadata::without_checkpoint(files.clone(), Bytes::new(), generation, 1),
            ));
        }
        metadata.reverse();

        let locks: BTreeMap<u64, BTreeSet<String>> = locked
            .iter()
            .map(|&g| (g, BTreeSet::from(["reader".to_string()])))
            .collect();
        let plan = GcSweep::new(keep_last).plan(&metadata, &locks);

        for generation in &plan.deletable_generations {
            prop_assert!(!locked.contains(generation));
        }
        let newest: Vec<u64> = (1..=generations).rev().take(keep_last).collect();
        for generation in &newest {
            prop_assert!(plan.retained_generations.contains(generation));
        }
        prop_assert_eq!(
            plan.retained_generations.len() + plan.deletable_generations.len(),
            generations as usize
        );
        let retained_blobs: BTreeSet<&str> = metadata
            .iter()
            .filter(|(name, _)| plan.retained_generations.contains(&name.generation))
            .flat_map(|(_, md)| md.uploaded_names())
            .collect();
        for blob in &plan.deletable_blobs {
            prop_assert!(!retained_blobs.contains(blob.as_str()));
        }
    }
}

#[test]
fn test_readers_see_whole_generations_during_updates() {
    let primary = new_primary(1);
    let replica = new_replica_engine();
    let mut manifests = Vec::new();
    for _ in 0..20 {
        index_in_batches(&primary, 1, 3);
        let manifest = primary.current_manifest().unwrap();
        copy_files(&manifest, primary.directory().as_ref(), replica.directory().as_ref());
        manifests.push(manifest);
    }

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let replica = Arc::clone(&replica);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut last_generation = 0;
                let mut views = 0u64;
                loop {
                    let view = replica.acquire().unwrap();
                    let docs = view.documents().unwrap();
                    assert_eq!(docs.len() as u64, view.doc_count());
                    assert_eq!(view.doc_count(), view.generation() * 3);
                    assert!(view.generation() >= last_generation);
                    last_generation = view.generation();
                    views += 1;
                    if done.load(Ordering::Acquire) {
                        return views;
                    }
                }
            })
        })
        .collect();

    for manifest in manifests {
        replica.update_segments(manifest).unwrap();
        std::thread::yield_now();
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(replica.acquire().unwrap().generation(), 20);
}
