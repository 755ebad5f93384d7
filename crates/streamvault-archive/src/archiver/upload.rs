//! Upload Scheduling
//!
//! The scheduler turns policy candidates into bounded-parallel uploads and
//! folds the results back into the manifest:
//!
//! 1. Build up to two upload contexts: non-compacted data from the manifest
//!    frontier to the last stable offset, and compacted re-uploads.
//! 2. Ask the policy for candidates until it signals no more work, the
//!    in-flight budget (`upload_concurrency`, shared across both kinds) is
//!    reached, or the context's offset budget is exhausted.
//! 3. Launch each candidate as an independent task uploading the segment
//!    body plus its transaction side-channel. Each task holds the source
//!    segments' read locks until it resolves, success or not.
//! 4. Wait for all tasks and classify outcomes per kind. Manifest entries
//!    are added for succeeded uploads only, in strictly increasing base
//!    order; the first failure in a group discards every later result in
//!    that group (counted as cancelled) so the manifest never records a gap.
//! 5. Replicate the delta, upload the manifest, update the probe.
//!
//! A result that arrives after the latched term changed is discarded without
//! a manifest update; the next leader re-uploads under its own term.

use bytes::{Bytes, BytesMut};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

use streamvault_core::{paths, Offset, SegmentMeta};

use crate::error::{Error, Result};
use crate::log::{LocalLog, SegmentReadLock};
use crate::policy::{UploadCandidate, UploadCandidateWithLocks};
use crate::remote::{CloudClient, DownloadOutcome, ObjectClass, RetryChain, RetryPolicy, UploadOutcome};

use super::{BatchResult, PartitionArchiver, SegmentUploadKind, UploadGroupResult};

/// A launched upload: the running task plus the manifest entry it will
/// produce if it succeeds.
pub(crate) struct ScheduledUpload {
    task: tokio::task::JoinHandle<UploadOutcome>,
    meta: SegmentMeta,
    kind: SegmentUploadKind,
    key: String,
}

/// One range of offsets to upload and the rules that apply to it.
struct UploadContext {
    kind: SegmentUploadKind,
    start_offset: Offset,
    last_offset: Offset,
}

impl PartitionArchiver {
    /// Upload the next set of segments, if any.
    ///
    /// Takes the archiver mutex, schedules up to `upload_concurrency`
    /// uploads across both kinds, waits for all of them, and applies the
    /// results to the manifest. `lso_override` replaces the log's last
    /// stable offset, for callers that need a narrower budget.
    pub async fn upload_next_candidates(
        &self,
        lso_override: Option<Offset>,
    ) -> Result<BatchResult> {
        let _guard = self.mutex.lock().await;
        if !self.may_begin_uploads() {
            return Ok(BatchResult::default());
        }
        let lso = match lso_override.or_else(|| self.log.last_stable_offset()) {
            Some(lso) => lso,
            None => return Ok(BatchResult::default()),
        };
        let scheduled = self.schedule_uploads(lso).await;
        self.wait_all_scheduled_uploads(scheduled).await
    }

    /// Upload a candidate supplied from outside the scheduler, e.g. by a
    /// housekeeping job. Returns true when the upload succeeded and was
    /// recorded in the manifest.
    pub async fn upload(
        &self,
        candidate: UploadCandidateWithLocks,
        rtc: Option<RetryChain>,
    ) -> Result<bool> {
        let _guard = self.mutex.lock().await;
        if !self.may_begin_uploads() {
            return Ok(false);
        }
        let kind = if candidate.candidate.meta.is_compacted || candidate.candidate.is_remote() {
            SegmentUploadKind::Compacted
        } else {
            SegmentUploadKind::NonCompacted
        };
        let scheduled = self.schedule_single_upload(candidate, kind, rtc);
        let result = self.wait_all_scheduled_uploads(vec![scheduled]).await?;
        Ok(result.total_succeeded() > 0)
    }

    async fn schedule_uploads(&self, lso: Offset) -> Vec<ScheduledUpload> {
        let manifest = self.stm.manifest().await;
        let compacted_from = match manifest.last_uploaded_compacted_offset() {
            0 => 0,
            n => n + 1,
        };
        let contexts = [
            UploadContext {
                kind: SegmentUploadKind::NonCompacted,
                start_offset: manifest.next_offset(),
                last_offset: lso,
            },
            UploadContext {
                kind: SegmentUploadKind::Compacted,
                start_offset: compacted_from,
                last_offset: manifest.last_offset().unwrap_or(0),
            },
        ];

        let mut scheduled = Vec::new();
        for ctx in contexts {
            let mut start = ctx.start_offset;
            while scheduled.len() < self.config.upload_concurrency && start <= ctx.last_offset {
                if !self.may_begin_uploads() {
                    break;
                }
                let candidate = match ctx.kind {
                    SegmentUploadKind::NonCompacted => {
                        self.policy
                            .next_local_candidate(
                                self.log.as_ref(),
                                start,
                                ctx.last_offset,
                                self.start_term(),
                            )
                            .await
                    }
                    SegmentUploadKind::Compacted => {
                        self.policy
                            .next_compacted_candidate(
                                self.log.as_ref(),
                                &manifest,
                                start,
                                self.start_term(),
                            )
                            .await
                    }
                };
                let candidate = match candidate {
                    Some(candidate) => candidate,
                    // The policy has no more work for this context.
                    None => break,
                };
                start = candidate.candidate.meta.committed_offset + 1;
                scheduled.push(self.schedule_single_upload(candidate, ctx.kind, None));
            }
        }
        scheduled
    }

    pub(crate) fn schedule_single_upload(
        &self,
        candidate_with_locks: UploadCandidateWithLocks,
        kind: SegmentUploadKind,
        rtc: Option<RetryChain>,
    ) -> ScheduledUpload {
        let UploadCandidateWithLocks { candidate, locks } = candidate_with_locks;
        let meta = candidate.meta.clone();
        let key = paths::segment_key(&self.partition, self.initial_revision, &meta);
        let rtc = rtc.unwrap_or_else(|| self.retry_chain());
        debug!(
            partition = %self.partition,
            key = %key,
            kind = %kind,
            "scheduling upload"
        );
        let task = tokio::spawn(perform_upload(
            self.remote.clone(),
            self.log.clone(),
            candidate,
            locks,
            key.clone(),
            rtc,
        ));
        ScheduledUpload {
            task,
            meta,
            kind,
            key,
        }
    }

    /// Wait for every scheduled upload, classify the results, and apply the
    /// successful prefix of each group to the manifest.
    pub(crate) async fn wait_all_scheduled_uploads(
        &self,
        scheduled: Vec<ScheduledUpload>,
    ) -> Result<BatchResult> {
        if scheduled.is_empty() {
            return Ok(BatchResult::default());
        }

        let mut resolved: Vec<(SegmentMeta, SegmentUploadKind, String, UploadOutcome)> =
            Vec::with_capacity(scheduled.len());
        let mut tasks = Vec::with_capacity(scheduled.len());
        let mut infos = Vec::with_capacity(scheduled.len());
        for upload in scheduled {
            tasks.push(upload.task);
            infos.push((upload.meta, upload.kind, upload.key));
        }
        let outcomes = join_all(tasks).await;
        for ((meta, kind, key), outcome) in infos.into_iter().zip(outcomes) {
            let outcome = outcome.unwrap_or_else(|e| {
                warn!(key = %key, error = %e, "upload task aborted");
                UploadOutcome::TransportError
            });
            resolved.push((meta, kind, key, outcome));
        }

        let non_compacted: Vec<_> = resolved
            .iter()
            .filter(|(_, kind, _, _)| *kind == SegmentUploadKind::NonCompacted)
            .map(|(meta, _, _, outcome)| (meta.clone(), *outcome))
            .collect();
        let compacted: Vec<_> = resolved
            .iter()
            .filter(|(_, kind, _, _)| *kind == SegmentUploadKind::Compacted)
            .map(|(meta, _, _, outcome)| (meta.clone(), *outcome))
            .collect();

        let (non_compacted_result, mut adds) = classify_group(non_compacted);
        let (compacted_result, compacted_adds) = classify_group(compacted);
        adds.extend(compacted_adds);

        let result = BatchResult {
            non_compacted: non_compacted_result,
            compacted: compacted_result,
        };
        self.update_probe(&result, &adds);

        if !self.can_update_archival_metadata() {
            // The term moved on while uploads were in flight. The objects
            // are harmless (content-addressed keys); the new leader's
            // manifest simply never references them.
            info!(
                partition = %self.partition,
                "discarding upload results after term change"
            );
            return Ok(result);
        }

        if !adds.is_empty() {
            match self.stm.add_segments(self.start_term(), adds).await {
                Ok(()) => {
                    self.record_upload_time().await;
                    self.upload_manifest().await;
                }
                Err(Error::Consensus(e)) => {
                    debug!(partition = %self.partition, error = %e, "manifest update fenced");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(result)
    }

    fn update_probe(&self, result: &BatchResult, adds: &[SegmentMeta]) {
        for meta in adds {
            let kind = if meta.is_compacted {
                SegmentUploadKind::Compacted
            } else {
                SegmentUploadKind::NonCompacted
            };
            self.probe.segment_uploaded(kind, meta.size_bytes);
        }
        for _ in 0..result.non_compacted.failed {
            self.probe.segment_failed(SegmentUploadKind::NonCompacted);
        }
        for _ in 0..result.compacted.failed {
            self.probe.segment_failed(SegmentUploadKind::Compacted);
        }
        for _ in 0..result.non_compacted.cancelled {
            self.probe.segment_cancelled(SegmentUploadKind::NonCompacted);
        }
        for _ in 0..result.compacted.cancelled {
            self.probe.segment_cancelled(SegmentUploadKind::Compacted);
        }
    }

    /// Serialize the manifest and upload it to its well-known key.
    pub(crate) async fn upload_manifest(&self) -> UploadOutcome {
        let manifest = self.stm.manifest().await;
        let key = manifest.object_key();
        let payload = manifest.serialize();
        let outcome = self
            .remote
            .put(&key, payload, ObjectClass::Manifest, &self.retry_chain())
            .await;
        if outcome.is_success() {
            self.probe.manifest_uploaded();
            debug!(partition = %self.partition, insync = manifest.insync_offset(), "uploaded manifest");
        } else {
            warn!(partition = %self.partition, outcome = %outcome, "manifest upload failed");
        }
        outcome
    }

    /// Re-upload the topic manifest when the topic configuration changed.
    /// Clears the dirty flag on success only.
    pub(crate) async fn upload_topic_manifest(&self) {
        let key = paths::topic_manifest_key(&self.partition.namespace, &self.partition.topic);
        let doc = serde_json::json!({
            "namespace": self.partition.namespace,
            "topic": self.partition.topic,
            "initial_revision": self.initial_revision,
        });
        let payload = Bytes::from(serde_json::to_vec(&doc).expect("json document serializes"));
        let outcome = self
            .remote
            .put(&key, payload, ObjectClass::Manifest, &self.retry_chain())
            .await;
        if outcome.is_success() {
            self.topic_manifest_dirty
                .store(false, std::sync::atomic::Ordering::SeqCst);
            debug!(partition = %self.partition, "uploaded topic manifest");
        } else {
            warn!(partition = %self.partition, outcome = %outcome, "topic manifest upload failed");
        }
    }

    pub(crate) fn retry_chain(&self) -> RetryChain {
        RetryChain::new(
            RetryPolicy::default(),
            self.config.upload_timeout(),
            self.shutdown.child_token(),
        )
    }
}

/// Classify one kind's uploads, in base-offset order. The successful prefix
/// becomes manifest entries; everything after the first non-success is
/// discarded (counted as cancelled) to preserve the no-gap invariant.
fn classify_group(
    mut group: Vec<(SegmentMeta, UploadOutcome)>,
) -> (UploadGroupResult, Vec<SegmentMeta>) {
    group.sort_by_key(|(meta, _)| meta.base_offset);
    let mut result = UploadGroupResult::default();
    let mut adds = Vec::new();
    let mut broken = false;
    for (meta, outcome) in group {
        match outcome {
            UploadOutcome::Success if !broken => {
                result.succeeded += 1;
                adds.push(meta);
            }
            UploadOutcome::Success => {
                // Uploaded fine, but an earlier sibling failed; recording
                // this one would leave a gap.
                result.cancelled += 1;
            }
            UploadOutcome::Cancelled => {
                result.cancelled += 1;
                broken = true;
            }
            UploadOutcome::PreconditionFailed
            | UploadOutcome::TransportError
            | UploadOutcome::TimedOut => {
                result.failed += 1;
                broken = true;
            }
        }
    }
    (result, adds)
}

/// The body of one upload task. Owns the candidate and its locks; the locks
/// release when the task resolves, on every path.
async fn perform_upload(
    remote: Arc<CloudClient>,
    log: Arc<dyn LocalLog>,
    candidate: UploadCandidate,
    locks: Vec<SegmentReadLock>,
    key: String,
    rtc: RetryChain,
) -> UploadOutcome {
    let _locks = locks;
    let meta = &candidate.meta;

    let payload = if candidate.is_remote() {
        // Merge re-upload: re-download the source objects and concatenate.
        let mut buf = BytesMut::new();
        for source in &candidate.remote_sources {
            match remote.download(source).await {
                DownloadOutcome::Found(bytes) => buf.extend_from_slice(&bytes),
                DownloadOutcome::NotFound => {
                    warn!(key = %source, "merge source object missing");
                    return UploadOutcome::TransportError;
                }
                DownloadOutcome::TransportError => return UploadOutcome::TransportError,
                DownloadOutcome::TimedOut => return UploadOutcome::TimedOut,
            }
        }
        buf.freeze()
    } else {
        match log
            .read_segments(&candidate.sources, meta.base_offset, meta.committed_offset)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read segment data");
                return UploadOutcome::TransportError;
            }
        }
    };

    let outcome = remote.put(&key, payload, ObjectClass::Segment, &rtc).await;
    if !outcome.is_success() {
        return outcome;
    }

    // Transaction side-channel travels with the segment. For merge
    // re-uploads the side-channels of the sources are concatenated.
    let tx_payload = if candidate.is_remote() {
        let mut buf = BytesMut::new();
        for source in &candidate.remote_sources {
            if let DownloadOutcome::Found(bytes) = remote.download(&paths::tx_key_for(source)).await
            {
                buf.extend_from_slice(&bytes);
            }
        }
        if buf.is_empty() {
            None
        } else {
            Some(buf.freeze())
        }
    } else {
        match log.tx_metadata(meta.base_offset, meta.committed_offset).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read tx metadata");
                return UploadOutcome::TransportError;
            }
        }
    };

    if let Some(tx) = tx_payload {
        let tx_outcome = remote
            .put(&paths::tx_key_for(&key), tx, ObjectClass::TxMetadata, &rtc)
            .await;
        if !tx_outcome.is_success() {
            return tx_outcome;
        }
    }
    UploadOutcome::Success
}
