//! Garbage-collection planning for remote segment metadata.
//!
//! The plan never selects a locked generation, and never deletes a data blob
//! still referenced by a retained metadata file.

use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::remote::metadata::RemoteSegmentMetadata;
use crate::remote::path::MetadataFileName;

/// What a sweep would delete.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcPlan {
    /// Generations kept, newest first.
    pub retained_generations: Vec<u64>,
    /// Generations whose metadata is deleted.
    pub deletable_generations: Vec<u64>,
    /// Metadata file names to delete.
    pub deletable_metadata: Vec<String>,
    /// Physical data blob names to delete.
    pub deletable_blobs: Vec<String>,
}

impl GcPlan {
    /// True if nothing would be deleted.
    pub fn is_empty(&self) -> bool {
        self.deletable_metadata.is_empty() && self.deletable_blobs.is_empty()
    }
}

/// Sweep policy: keep the newest `keep_last` metadata files and every locked
/// generation.
#[derive(Debug, Clone, Copy)]
pub struct GcSweep {
    keep_last: usize,
}

impl GcSweep {
    /// Create a sweep keeping at least one generation.
    pub fn new(keep_last: usize) -> Self {
        Self {
            keep_last: keep_last.max(1),
        }
    }

    /// Plan a sweep over `metadata`, which must be ordered newest first.
    pub fn plan(
        &self,
        metadata: &[(MetadataFileName, RemoteSegmentMetadata)],
        locked: &BTreeMap<u64, BTreeSet<String>>,
    ) -> GcPlan {
        let mut plan = GcPlan::default();
        let mut retained_blobs = BTreeSet::new();
        let mut candidate_blobs = BTreeSet::new();

        for (idx, (name, md)) in metadata.iter().enumerate() {
            let is_locked = locked.get(&name.generation).is_some_and(|o| !o.is_empty());
            if idx < self.keep_last || is_locked {
                plan.retained_generations.push(name.generation);
                retained_blobs.extend(md.uploaded_names().map(str::to_string));
            } else {
                plan.deletable_generations.push(name.generation);
                plan.deletable_metadata.push(name.to_string());
                candidate_blobs.extend(md.uploaded_names().map(str::to_string));
            }
        }

        plan.deletable_blobs = candidate_blobs
            .into_iter()
            .filter(|blob| !retained_blobs.contains(blob))
            .collect();
        debug!(
            retained = plan.retained_generations.len(),
            deletable = plan.deletable_generations.len(),
            blobs = plan.deletable_blobs.len(),
            "planned remote segment sweep"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CURRENT_CODEC_VERSION;
    use crate::manifest::StoreFileMetadata;
    use crate::remote::metadata::UploadedSegmentMetadata;
    use bytes::Bytes;

    fn entry(generation: u64, files: &[&UploadedSegmentMetadata]) -> (MetadataFileName, RemoteSegmentMetadata) {
        let map = files
            .iter()
            .map(|f| (f.original_name.clone(), (*f).clone()))
            .collect();
        (
            MetadataFileName::new(1, generation, generation * 10, "node", 1).unwrap(),
            RemoteSegmentMetadata::without_checkpoint(map, Bytes::new(), generation, 1),
        )
    }

    fn file(name: &str) -> UploadedSegmentMetadata {
        UploadedSegmentMetadata::for_upload(&StoreFileMetadata::of(name, name.as_bytes(), CURRENT_CODEC_VERSION))
    }

    #[test]
    fn test_keeps_newest_and_locked() {
        let a = file("_0.seg");
        let b = file("_1.seg");
        let c = file("_2.seg");
        let md = vec![
            entry(4, &[&a, &b, &c]),
            entry(3, &[&a, &b]),
            entry(2, &[&a]),
            entry(1, &[&file("_x.seg")]),
        ];
        let mut locked = BTreeMap::new();
        locked.insert(2, BTreeSet::from(["r1".to_string()]));

        let plan = GcSweep::new(1).plan(&md, &locked);
        assert_eq!(plan.retained_generations, vec![4, 2]);
        assert_eq!(plan.deletable_generations, vec![3, 1]);
        assert_eq!(plan.deletable_blobs.len(), 1);
        assert!(plan.deletable_blobs[0].starts_with("_x.seg__"));
    }

    #[test]
    fn test_empty_owner_set_is_unlocked() {
        let md = vec![entry(2, &[&file("_0.seg")]), entry(1, &[&file("_1.seg")])];
        let mut locked = BTreeMap::new();
        locked.insert(1, BTreeSet::new());
        let plan = GcSweep::new(1).plan(&md, &locked);
        assert_eq!(plan.deletable_generations, vec![1]);
    }

    #[test]
    fn test_keep_last_at_least_one() {
        let md = vec![entry(1, &[&file("_0.seg")])];
        let plan = GcSweep::new(0).plan(&md, &BTreeMap::new());
        assert!(plan.is_empty());
    }
}
