//! Archival Policy
//!
//! Given the manifest, the local log, and an upper offset bound, the policy
//! emits the next upload candidate. The decisions it owns:
//!
//! - **Term boundary.** One uploaded object never spans a term change. A
//!   candidate that would concatenate segments from different terms is
//!   truncated at the last offset of the first term.
//! - **Size target.** Small adjacent local segments are concatenated until
//!   the candidate approaches the configured target segment size.
//! - **Offset budget.** Candidates never reach past the last stable offset;
//!   when it falls inside a segment, the candidate covers the stable prefix
//!   and the remainder waits for the next pass.
//! - **Delta accounting.** Each candidate carries the count of non-data
//!   batches preceding its base offset, so manifest consumers can translate
//!   offsets.
//! - **Locking.** Read locks on all source segments are acquired before the
//!   candidate is returned and travel with it to the scheduler.
//!
//! Compacted candidates come from a second, disjoint source: compacted
//! rewrites of ranges the manifest already lists, which re-upload as
//! replacements. Remote candidates (adjacent-segment merges) are built from
//! a [`AdjacentSegmentRun`] produced by a caller-supplied manifest scanner.

use std::sync::Arc;

use tracing::{debug, warn};

use streamvault_core::{Offset, PartitionManifest, SegmentMeta, Term};

use crate::config::Binding;
use crate::log::{LocalLog, LogSegment, SegmentReadLock};

/// A pending upload: what to read and the manifest entry it will produce.
#[derive(Debug)]
pub struct UploadCandidate {
    /// Prospective manifest entry.
    pub meta: SegmentMeta,

    /// Local source segments, in offset order. Empty for remote candidates.
    pub sources: Vec<Arc<LogSegment>>,

    /// Object keys to re-download and concatenate. Empty for local
    /// candidates.
    pub remote_sources: Vec<String>,
}

impl UploadCandidate {
    pub fn is_remote(&self) -> bool {
        !self.remote_sources.is_empty()
    }
}

/// A candidate together with the read locks protecting its local sources.
pub struct UploadCandidateWithLocks {
    pub candidate: UploadCandidate,
    pub locks: Vec<SegmentReadLock>,
}

/// A run of adjacent uploaded segments selected for a merge re-upload,
/// produced by a manifest scanner.
#[derive(Debug, Clone)]
pub struct AdjacentSegmentRun {
    /// The manifest entries to merge, in offset order.
    pub metas: Vec<SegmentMeta>,

    /// The entry the merged object will replace them with.
    pub merged: SegmentMeta,
}

pub struct ArchivalPolicy {
    target_segment_size: Binding<u64>,
}

impl ArchivalPolicy {
    pub fn new(target_segment_size: Binding<u64>) -> Self {
        Self {
            target_segment_size,
        }
    }

    /// Next non-compacted candidate covering `[start, last]`, or `None`
    /// when no closed, stable data is waiting at the frontier.
    pub async fn next_local_candidate(
        &self,
        log: &dyn LocalLog,
        start: Offset,
        last: Offset,
        archiver_term: Term,
    ) -> Option<UploadCandidateWithLocks> {
        if start > last {
            return None;
        }
        let available = log.segments_in_range(start, last);
        let (first_base, term) = match available.first() {
            Some(first) => (first.base_offset, first.term),
            None => return None,
        };
        if first_base > start && start >= log.start_offset() {
            // The frontier points into locally collected data. Uploads
            // resume from the oldest segment still present.
            warn!(
                start,
                local_base = first_base,
                "upload frontier is below the local log start"
            );
        }
        let base = start.max(first_base);
        let target = self.target_segment_size.get();

        let mut sources: Vec<Arc<LogSegment>> = Vec::new();
        let mut committed = None;
        let mut size_bytes: u64 = 0;
        let mut max_timestamp = i64::MIN;

        for segment in available {
            if segment.term != term {
                // Term boundary: truncate at the last offset of the prior
                // term.
                break;
            }
            if committed.is_some() && size_bytes >= target {
                break;
            }
            if let Some(prev) = committed {
                if segment.base_offset != prev + 1 {
                    break;
                }
            }
            let seg_last = segment.committed_offset.min(last);
            let seg_base = segment.base_offset.max(base);
            if seg_base > seg_last {
                break;
            }
            let full_span = segment.record_span();
            let taken_span = seg_last - segment.base_offset + 1;
            size_bytes += segment.size_bytes * taken_span / full_span;
            max_timestamp = max_timestamp.max(segment.max_timestamp);
            committed = Some(seg_last);
            sources.push(segment.clone());
            if seg_last < segment.committed_offset {
                // Partial segment: the rest is beyond the stable offset.
                break;
            }
        }

        let committed = committed?;
        let delta_offset = sources.first().map(|s| s.delta_offset).unwrap_or(0);

        let mut locks = Vec::with_capacity(sources.len());
        for segment in &sources {
            locks.push(segment.read_lock().await);
        }

        let meta = SegmentMeta {
            base_offset: base,
            committed_offset: committed,
            delta_offset,
            size_bytes,
            max_timestamp,
            segment_term: term,
            archiver_term,
            is_compacted: false,
            extension: Default::default(),
        };
        debug!(
            base = meta.base_offset,
            committed = meta.committed_offset,
            size = meta.size_bytes,
            segments = sources.len(),
            "selected upload candidate"
        );
        Some(UploadCandidateWithLocks {
            candidate: UploadCandidate {
                meta,
                sources,
                remote_sources: Vec::new(),
            },
            locks,
        })
    }

    /// Next compacted re-upload candidate above `from`, or `None`.
    ///
    /// A compacted rewrite qualifies when its range replaces whole segments
    /// the manifest already lists; misaligned rewrites wait for compaction
    /// to catch up.
    pub async fn next_compacted_candidate(
        &self,
        log: &dyn LocalLog,
        manifest: &PartitionManifest,
        from: Offset,
        archiver_term: Term,
    ) -> Option<UploadCandidateWithLocks> {
        let available: Vec<Arc<LogSegment>> = log
            .compacted_segments_below(manifest.next_offset())
            .into_iter()
            .filter(|s| s.base_offset >= from && s.base_offset >= manifest.start_offset())
            .collect();
        let (base, term) = match available.first() {
            Some(first) => (first.base_offset, first.term),
            None => return None,
        };
        let target = self.target_segment_size.get();

        let mut sources: Vec<Arc<LogSegment>> = Vec::new();
        let mut committed = None;
        let mut size_bytes: u64 = 0;
        let mut max_timestamp = i64::MIN;

        for segment in available {
            if segment.term != term {
                break;
            }
            if committed.is_some() && size_bytes >= target {
                break;
            }
            if let Some(prev) = committed {
                if segment.base_offset != prev + 1 {
                    break;
                }
            }
            size_bytes += segment.size_bytes;
            max_timestamp = max_timestamp.max(segment.max_timestamp);
            committed = Some(segment.committed_offset);
            sources.push(segment.clone());
        }

        let committed = committed?;
        if !manifest.is_replaceable_range(base, committed) {
            debug!(
                base,
                committed, "compacted rewrite does not align with uploaded segments"
            );
            return None;
        }

        let delta_offset = sources.first().map(|s| s.delta_offset).unwrap_or(0);
        let mut locks = Vec::with_capacity(sources.len());
        for segment in &sources {
            locks.push(segment.read_lock().await);
        }

        let meta = SegmentMeta {
            base_offset: base,
            committed_offset: committed,
            delta_offset,
            size_bytes,
            max_timestamp,
            segment_term: term,
            archiver_term,
            is_compacted: true,
            extension: Default::default(),
        };
        Some(UploadCandidateWithLocks {
            candidate: UploadCandidate {
                meta,
                sources,
                remote_sources: Vec::new(),
            },
            locks,
        })
    }

    /// Build a remote re-upload candidate out of a scanner-produced run of
    /// already-uploaded segments. The merged object is re-recorded under the
    /// current archiver term.
    pub fn candidate_from_run(
        &self,
        run: AdjacentSegmentRun,
        manifest: &PartitionManifest,
        archiver_term: Term,
    ) -> UploadCandidateWithLocks {
        let remote_sources = run
            .metas
            .iter()
            .map(|meta| manifest.segment_key(meta))
            .collect();
        let mut merged = run.merged;
        merged.archiver_term = archiver_term;
        UploadCandidateWithLocks {
            candidate: UploadCandidate {
                meta: merged,
                sources: Vec::new(),
                remote_sources,
            },
            locks: Vec::new(),
        }
    }
}
