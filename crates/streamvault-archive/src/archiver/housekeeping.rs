//! Housekeeping Driver
//!
//! Runs on a jittered schedule (~10% around the configured interval):
//!
//! - **Retention** computes a new start offset from the size/time retention
//!   settings and replicates the advance. It never deletes data.
//! - **Garbage collection** deletes objects that fell behind the frontier or
//!   were superseded by compacted re-uploads, a bounded batch per cycle.
//!   Nothing leaves the manifest until the store confirms the deletion.
//! - **Jobs** such as the adjacent-segment merger run last, outside the
//!   archiver mutex, pushing their re-uploads through the normal upload
//!   path.
//!
//! Retention and GC share one mutex hold, which pins down the ordering
//! question between a compacted replacement and a concurrent retention
//! advance on the same range: they serialize, retention first within a
//! cycle, and a replacement arriving later for a range now behind the
//! frontier is dropped at manifest-apply time.
//!
//! Failures here are logged and retried on the next cycle; none are fatal
//! to the upload loop.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use streamvault_core::{Offset, SegmentMeta};

use crate::error::{Error, Result};

use super::{jittered, now_ms, PartitionArchiver};

impl PartitionArchiver {
    /// One housekeeping pass: retention, garbage collection, then jobs.
    pub async fn housekeeping(&self) -> Result<()> {
        {
            let _guard = self.mutex.lock().await;
            if !self.can_update_archival_metadata() {
                return Ok(());
            }
            self.do_apply_retention().await?;
            self.do_garbage_collect().await?;
        }
        self.run_housekeeping_jobs().await;
        self.schedule_next_housekeeping().await;
        Ok(())
    }

    /// Advance the retention frontier per the configured policy. Public
    /// entry; takes the archiver mutex.
    pub async fn apply_retention(&self) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.do_apply_retention().await
    }

    /// Delete objects no longer referenced above the frontier. Public
    /// entry; takes the archiver mutex.
    pub async fn garbage_collect(&self) -> Result<()> {
        let _guard = self.mutex.lock().await;
        self.do_garbage_collect().await
    }

    pub(crate) async fn housekeeping_due(&self) -> bool {
        Instant::now() >= *self.next_housekeeping.lock().await
    }

    async fn schedule_next_housekeeping(&self) {
        let interval = jittered(self.bindings.housekeeping_interval.get());
        *self.next_housekeeping.lock().await = Instant::now() + interval;
    }

    async fn do_apply_retention(&self) -> Result<()> {
        if !self.can_update_archival_metadata() {
            return Ok(());
        }
        let manifest = self.stm.manifest().await;
        let mut new_start = manifest.start_offset();

        if let Some(retain_bytes) = self.bindings.retention_bytes.get() {
            new_start = new_start.max(size_based_frontier(&manifest, retain_bytes));
        }
        if let Some(retain_ms) = self.bindings.retention_ms.get() {
            let cutoff = now_ms() - retain_ms;
            new_start = new_start.max(time_based_frontier(&manifest, cutoff));
        }

        if new_start > manifest.start_offset() {
            info!(
                partition = %self.partition,
                from = manifest.start_offset(),
                to = new_start,
                "advancing retention frontier"
            );
            self.stm
                .advance_start_offset(self.start_term(), new_start)
                .await?;
            self.upload_manifest().await;
        }
        Ok(())
    }

    async fn do_garbage_collect(&self) -> Result<()> {
        if !self.can_update_archival_metadata() {
            return Ok(());
        }
        let manifest = self.stm.manifest().await;
        let start_offset = manifest.start_offset();

        let mut batch: Vec<SegmentMeta> = manifest.pending_deletion().to_vec();
        batch.extend(
            manifest
                .segments()
                .filter(|s| s.committed_offset < start_offset)
                .cloned(),
        );
        let cap = self.bindings.max_segments_pending_deletion.get();
        if batch.len() > cap {
            debug!(
                partition = %self.partition,
                pending = batch.len(),
                cap,
                "bounding deletion batch"
            );
            batch.truncate(cap);
        }
        if batch.is_empty() {
            return Ok(());
        }

        let mut removed_keys = Vec::new();
        for meta in &batch {
            if self.shutdown.is_cancelled() {
                return Err(Error::ShuttingDown);
            }
            let key = manifest.segment_key(meta);
            if !self.delete_segment(&key).await {
                // Retried on the next cycle; the manifest keeps listing it.
                continue;
            }
            removed_keys.push(key);
        }

        if removed_keys.is_empty() {
            return Ok(());
        }
        let deleted = removed_keys.len() as u64;
        self.stm
            .remove_segments(self.start_term(), removed_keys)
            .await?;
        self.upload_manifest().await;
        self.probe.gc_deleted(deleted);
        info!(partition = %self.partition, deleted, "garbage collected segments");
        Ok(())
    }

    /// Delete a segment object and its tx side-channel. The side-channel
    /// goes second and only if the segment deletion succeeded; a dangling
    /// tx object is re-tried once the segment delete reports not-found.
    async fn delete_segment(&self, key: &str) -> bool {
        let outcome = self.remote.delete(key).await;
        if !outcome.is_gone() {
            warn!(key = %key, outcome = ?outcome, "segment deletion failed");
            return false;
        }
        let tx_outcome = self
            .remote
            .delete(&streamvault_core::paths::tx_key_for(key))
            .await;
        if !tx_outcome.is_gone() {
            warn!(key = %key, outcome = ?tx_outcome, "tx metadata deletion failed");
            return false;
        }
        true
    }

    async fn run_housekeeping_jobs(&self) {
        if !self.bindings.segment_merging_enabled.get() {
            return;
        }
        let deadline = Instant::now() + self.bindings.housekeeping_interval.get() / 2;
        for job in self.get_housekeeping_jobs() {
            if !self.may_begin_uploads() {
                return;
            }
            if let Err(e) = job.run(deadline).await {
                warn!(
                    partition = %self.partition,
                    job = job.name(),
                    error = %e,
                    "housekeeping job failed"
                );
            }
        }
    }
}

/// Smallest allowed start offset such that at most `retain_bytes` of
/// uploaded data stays ahead of it, dropping whole segments oldest-first.
fn size_based_frontier(
    manifest: &streamvault_core::PartitionManifest,
    retain_bytes: u64,
) -> Offset {
    let live: Vec<&SegmentMeta> = manifest.segments().collect();
    let mut budget = retain_bytes;
    let mut frontier = manifest.start_offset();
    // Walk newest to oldest spending the byte budget; everything older
    // than where it runs out is dropped.
    for meta in live.iter().rev() {
        if meta.size_bytes <= budget {
            budget -= meta.size_bytes;
        } else {
            frontier = frontier.max(meta.committed_offset + 1);
            break;
        }
    }
    frontier
}

/// Start offset advancing past segments whose newest record predates
/// `cutoff_ms`.
fn time_based_frontier(manifest: &streamvault_core::PartitionManifest, cutoff_ms: i64) -> Offset {
    let mut frontier = manifest.start_offset();
    for meta in manifest.segments() {
        if meta.max_timestamp < cutoff_ms {
            frontier = frontier.max(meta.committed_offset + 1);
        } else {
            break;
        }
    }
    frontier
}
