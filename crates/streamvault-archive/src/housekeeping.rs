//! Housekeeping Jobs
//!
//! A housekeeping job is a pluggable maintenance capability attached to an
//! archiver: `{name, run(deadline), interrupt}`. The archiver's housekeeping
//! driver runs each job on its jittered schedule; future jobs (scrubbing,
//! lifecycle transitions) attach to the same scheduler.
//!
//! The one job shipped today is [`AdjacentSegmentMerger`]: it scans the
//! manifest for runs of small neighbouring uploaded segments and re-uploads
//! them as one merged object, cutting per-object request overhead for
//! readers. The merged upload replaces its sources atomically in the
//! manifest; the superseded objects are garbage collected later.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Weak;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use streamvault_core::{Offset, PartitionManifest, SegmentMeta};

use crate::archiver::PartitionArchiver;
use crate::config::Binding;
use crate::error::Result;
use crate::policy::AdjacentSegmentRun;

/// A maintenance task the archiver's housekeeping scheduler drives.
#[async_trait]
pub trait HousekeepingJob: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run until out of work or the deadline passes. Implementations must
    /// return promptly after [`HousekeepingJob::interrupt`].
    async fn run(&self, deadline: Instant) -> Result<()>;

    /// Ask a running job to stop at its next safe point.
    fn interrupt(&self);
}

/// Find the first run of small adjacent uploaded segments worth merging.
///
/// A run qualifies when it has at least two contiguous same-term segments,
/// each smaller than half the target segment size, with a combined size not
/// exceeding the target. Segments below the retention frontier or the local
/// log start are never considered.
pub fn scan_adjacent_run(
    manifest: &PartitionManifest,
    local_start_offset: Offset,
    target_size: u64,
) -> Option<AdjacentSegmentRun> {
    let small = target_size / 2;
    let floor = manifest.start_offset().max(local_start_offset);

    let mut run: Vec<SegmentMeta> = Vec::new();
    let mut total: u64 = 0;
    for meta in manifest.segments() {
        if meta.base_offset < floor {
            continue;
        }
        let continues = match run.last() {
            Some(prev) => {
                prev.committed_offset + 1 == meta.base_offset
                    && prev.segment_term == meta.segment_term
            }
            None => true,
        };
        let fits = meta.size_bytes < small && total + meta.size_bytes <= target_size;

        if continues && fits {
            total += meta.size_bytes;
            run.push(meta.clone());
        } else if run.len() >= 2 {
            break;
        } else {
            run.clear();
            total = 0;
            if meta.size_bytes < small {
                total = meta.size_bytes;
                run.push(meta.clone());
            }
        }
    }
    if run.len() < 2 {
        return None;
    }

    let first = &run[0];
    let last = run.last().expect("non-empty run");
    let merged = SegmentMeta {
        base_offset: first.base_offset,
        committed_offset: last.committed_offset,
        delta_offset: first.delta_offset,
        size_bytes: total,
        max_timestamp: run.iter().map(|s| s.max_timestamp).max().unwrap_or(0),
        segment_term: first.segment_term,
        archiver_term: first.archiver_term,
        is_compacted: run.iter().any(|s| s.is_compacted),
        extension: Default::default(),
    };
    Some(AdjacentSegmentRun { metas: run, merged })
}

/// Merges runs of small neighbouring uploaded segments.
pub struct AdjacentSegmentMerger {
    archiver: Weak<PartitionArchiver>,
    target_segment_size: Binding<u64>,
    interrupted: AtomicBool,
}

impl AdjacentSegmentMerger {
    pub(crate) fn new(
        archiver: Weak<PartitionArchiver>,
        target_segment_size: Binding<u64>,
    ) -> Self {
        Self {
            archiver,
            target_segment_size,
            interrupted: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl HousekeepingJob for AdjacentSegmentMerger {
    fn name(&self) -> &'static str {
        "adjacent-segment-merger"
    }

    async fn run(&self, deadline: Instant) -> Result<()> {
        self.interrupted.store(false, Ordering::SeqCst);
        let archiver = match self.archiver.upgrade() {
            Some(archiver) => archiver,
            None => return Ok(()),
        };
        loop {
            if self.interrupted.load(Ordering::SeqCst) || Instant::now() >= deadline {
                return Ok(());
            }
            let target = self.target_segment_size.get();
            let candidate = archiver
                .find_reupload_candidate(|start, manifest| {
                    scan_adjacent_run(manifest, start, target)
                })
                .await;
            let candidate = match candidate {
                Some(candidate) => candidate,
                None => return Ok(()),
            };
            debug!(
                base = candidate.candidate.meta.base_offset,
                committed = candidate.candidate.meta.committed_offset,
                "merging adjacent segments"
            );
            if !archiver.upload(candidate, None).await? {
                return Ok(());
            }
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streamvault_core::{ManifestCommand, TopicPartition};

    fn meta(base: Offset, committed: Offset, size: u64, term: u64) -> SegmentMeta {
        SegmentMeta {
            base_offset: base,
            committed_offset: committed,
            delta_offset: 0,
            size_bytes: size,
            max_timestamp: committed as i64,
            segment_term: term,
            archiver_term: term,
            is_compacted: false,
            extension: Default::default(),
        }
    }

    fn manifest(segments: &[(Offset, Offset, u64, u64)]) -> PartitionManifest {
        let mut m = PartitionManifest::new(TopicPartition::new("ns", "t", 0), 1);
        for &(base, committed, size, term) in segments {
            m.apply(&ManifestCommand::AddSegments(vec![meta(base, committed, size, term)]))
                .expect("apply");
        }
        m
    }

    #[test]
    fn test_finds_run_of_small_segments() {
        let m = manifest(&[(0, 99, 100, 1), (100, 199, 100, 1), (200, 299, 5000, 1)]);
        let run = scan_adjacent_run(&m, 0, 1000).expect("run");
        assert_eq!(run.metas.len(), 2);
        assert_eq!(run.merged.base_offset, 0);
        assert_eq!(run.merged.committed_offset, 199);
        assert_eq!(run.merged.size_bytes, 200);
        assert_eq!(run.merged.max_timestamp, 199);
    }

    #[test]
    fn test_no_run_when_segments_are_large() {
        let m = manifest(&[(0, 99, 900, 1), (100, 199, 900, 1)]);
        assert!(scan_adjacent_run(&m, 0, 1000).is_none());
    }

    #[test]
    fn test_run_does_not_cross_terms() {
        let m = manifest(&[(0, 99, 100, 1), (100, 199, 100, 2), (200, 299, 100, 2)]);
        let run = scan_adjacent_run(&m, 0, 1000).expect("run");
        // The term-1 singleton cannot merge with term-2 neighbours; the
        // first mergeable run is the two term-2 segments.
        assert_eq!(run.merged.segment_term, 2);
        assert_eq!(run.merged.base_offset, 100);
        assert_eq!(run.merged.committed_offset, 299);
    }

    #[test]
    fn test_run_respects_frontier() {
        let mut m = manifest(&[(0, 99, 100, 1), (100, 199, 100, 1), (200, 299, 100, 1)]);
        m.apply(&ManifestCommand::AdvanceStartOffset(100)).unwrap();
        let run = scan_adjacent_run(&m, 0, 1000).expect("run");
        assert_eq!(run.merged.base_offset, 100);
    }

    #[test]
    fn test_run_bounded_by_target_size() {
        let m = manifest(&[
            (0, 9, 400, 1),
            (10, 19, 400, 1),
            (20, 29, 400, 1),
            (30, 39, 400, 1),
        ]);
        let run = scan_adjacent_run(&m, 0, 1000).expect("run");
        // 400 * 2 fits within 1000; a third would exceed it.
        assert_eq!(run.metas.len(), 2);
        assert_eq!(run.merged.size_bytes, 800);
    }

    #[test]
    fn test_single_small_segment_is_not_a_run() {
        let m = manifest(&[(0, 99, 100, 1), (100, 199, 5000, 1)]);
        assert!(scan_adjacent_run(&m, 0, 1000).is_none());
    }
}
