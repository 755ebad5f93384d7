//! Partition Archiver
//!
//! One [`PartitionArchiver`] per replicated partition hosted on a node. The
//! archiver is a long-lived actor with two nested loops:
//!
//! - an **outer abort loop** that terminates only on shutdown, waiting on a
//!   leadership condition while the partition is a follower, and
//! - an **inner term loop** that runs while the partition is leader in a
//!   fixed consensus term. The term is latched on entry; any term change
//!   exits the inner loop and falls back to the outer wait.
//!
//! Two mutually exclusive inner-loop bodies exist, selected by
//! [`ArchiverMode`]: producers schedule uploads and housekeeping; read
//! replicas only poll the remote manifest and ingest it.
//!
//! ## Concurrency model
//!
//! All state of one archiver is mutated from its own task plus callers that
//! go through the single-permit archiver mutex. A separate single-permit
//! semaphore (`uploads_active`) is held for the whole of an inner-loop
//! iteration; the leadership transfer gate acquires it to wait for in-flight
//! work to quiesce. Every spawned upload observes the archiver's
//! cancellation token, and `stop` waits for the actor task to unwind.

mod housekeeping;
mod upload;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use streamvault_core::{
    paths, InitialRevision, Offset, PartitionManifest, Term, TopicPartition,
};

use crate::config::{ArchiveBindings, ArchiveConfig};
use crate::consensus::Consensus;
use crate::error::{Error, Result};
use crate::housekeeping::{AdjacentSegmentMerger, HousekeepingJob};
use crate::log::LocalLog;
use crate::policy::{AdjacentSegmentRun, ArchivalPolicy, UploadCandidateWithLocks};
use crate::probe::ArchiverProbe;
use crate::remote::CloudClient;
use crate::stm::ManifestStm;

/// Operating mode, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiverMode {
    /// Upload local segments and run housekeeping while leader.
    Producer,
    /// Only ingest the remote manifest; never upload.
    ReadReplica,
}

/// Kind of a scheduled segment upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegmentUploadKind {
    NonCompacted,
    Compacted,
}

impl SegmentUploadKind {
    pub fn as_label(&self) -> &'static str {
        match self {
            SegmentUploadKind::NonCompacted => "non_compacted",
            SegmentUploadKind::Compacted => "compacted",
        }
    }
}

impl std::fmt::Display for SegmentUploadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// Upload counts for one kind within a scheduler batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadGroupResult {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl UploadGroupResult {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Result of one scheduler batch across both upload kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub non_compacted: UploadGroupResult,
    pub compacted: UploadGroupResult,
}

impl BatchResult {
    /// Number of uploads the batch attempted, regardless of outcome.
    pub fn total_uploads(&self) -> usize {
        self.non_compacted.total() + self.compacted.total()
    }

    pub fn total_succeeded(&self) -> usize {
        self.non_compacted.succeeded + self.compacted.succeeded
    }
}

/// The per-partition archiver actor.
pub struct PartitionArchiver {
    partition: TopicPartition,
    initial_revision: InitialRevision,
    mode: ArchiverMode,
    remote: Arc<CloudClient>,
    log: Arc<dyn LocalLog>,
    consensus: Arc<dyn Consensus>,
    stm: ManifestStm,
    policy: ArchivalPolicy,
    config: ArchiveConfig,
    bindings: ArchiveBindings,
    probe: ArchiverProbe,

    /// Term latched on entry into the inner loop; the leader-epoch guard
    /// for all manifest mutations.
    start_term: AtomicU64,

    /// Set by the transfer gate; blocks new uploads without exiting the
    /// inner loop.
    paused: AtomicBool,

    /// Set by `notify_topic_config`; partition 0 re-uploads the topic
    /// manifest when dirty.
    topic_manifest_dirty: AtomicBool,

    /// Serializes all state-mutating work within the archiver.
    mutex: Mutex<()>,

    /// Held for the whole of an inner-loop iteration; the transfer gate
    /// acquires it to quiesce uploads.
    uploads_active: Semaphore,

    /// Signalled by `notify_leadership`; the outer loop waits on it while
    /// not leader.
    leader_cond: Notify,

    shutdown: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,

    last_upload_time: Mutex<Option<Instant>>,
    next_housekeeping: Mutex<Instant>,

    merger: Arc<AdjacentSegmentMerger>,
}

impl PartitionArchiver {
    /// Create an archiver bound to one partition.
    ///
    /// `manifest` is the recovered (or fresh) manifest the archival STM
    /// starts from; partition identity and initial revision come from it.
    pub fn new(
        mode: ArchiverMode,
        manifest: PartitionManifest,
        remote: Arc<CloudClient>,
        log: Arc<dyn LocalLog>,
        consensus: Arc<dyn Consensus>,
        config: ArchiveConfig,
    ) -> Arc<Self> {
        let bindings = config.bindings();
        Self::with_bindings(mode, manifest, remote, log, consensus, config, bindings)
    }

    /// Like [`PartitionArchiver::new`], with caller-supplied runtime
    /// bindings for the settings that may change while the archiver runs.
    pub fn with_bindings(
        mode: ArchiverMode,
        manifest: PartitionManifest,
        remote: Arc<CloudClient>,
        log: Arc<dyn LocalLog>,
        consensus: Arc<dyn Consensus>,
        config: ArchiveConfig,
        bindings: ArchiveBindings,
    ) -> Arc<Self> {
        let partition = manifest.partition().clone();
        let initial_revision = manifest.initial_revision();
        let probe = ArchiverProbe::new(&partition);
        let policy = ArchivalPolicy::new(bindings.target_segment_size.clone());
        let stm = ManifestStm::new(manifest, consensus.clone());
        let start_term = consensus.term();
        let housekeeping_interval = bindings.housekeeping_interval.get();

        Arc::new_cyclic(|weak| {
            let merger = Arc::new(AdjacentSegmentMerger::new(
                weak.clone(),
                bindings.target_segment_size.clone(),
            ));
            Self {
                partition,
                initial_revision,
                mode,
                remote,
                log,
                consensus,
                stm,
                policy,
                config,
                bindings,
                probe,
                start_term: AtomicU64::new(start_term),
                paused: AtomicBool::new(false),
                topic_manifest_dirty: AtomicBool::new(false),
                mutex: Mutex::new(()),
                uploads_active: Semaphore::new(1),
                leader_cond: Notify::new(),
                shutdown: CancellationToken::new(),
                task: std::sync::Mutex::new(None),
                last_upload_time: Mutex::new(None),
                next_housekeeping: Mutex::new(Instant::now() + housekeeping_interval),
                merger,
            }
        })
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn initial_revision(&self) -> InitialRevision {
        self.initial_revision
    }

    pub fn mode(&self) -> ArchiverMode {
        self.mode
    }

    /// Snapshot of the manifest held by the archival STM.
    pub async fn manifest(&self) -> PartitionManifest {
        self.stm.manifest().await
    }

    /// Wall-clock time of the last successful upload batch.
    pub async fn last_upload_time(&self) -> Option<Instant> {
        *self.last_upload_time.lock().await
    }

    /// Spawn the background loop for this archiver's mode.
    pub fn start(self: &Arc<Self>) {
        let archiver = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match archiver.mode {
                ArchiverMode::Producer => archiver.upload_until_abort().await,
                ArchiverMode::ReadReplica => archiver.sync_manifest_until_abort().await,
            }
        });
        *self.task.lock().expect("task slot") = Some(handle);
    }

    /// Stop the archiver and wait for its loop to unwind. In-flight uploads
    /// resolve as cancelled; their segment locks release normally.
    pub async fn stop(&self) {
        info!(partition = %self.partition, "stopping archiver");
        self.shutdown.cancel();
        self.leader_cond.notify_waiters();
        let handle = self.task.lock().expect("task slot").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(partition = %self.partition, error = %e, "archiver task join failed");
            }
        }
    }

    /// Wake the outer loop after a leadership change. Callers invoke this
    /// from the consensus layer's leadership notification hook.
    pub fn notify_leadership(&self) {
        self.leader_cond.notify_waiters();
    }

    /// Mark the topic configuration dirty. Partition 0's archiver will
    /// re-upload the topic manifest on its next pass.
    pub fn notify_topic_config(&self) {
        self.topic_manifest_dirty.store(true, Ordering::SeqCst);
    }

    /// True while archival metadata may be replicated: still leader, term
    /// unchanged since the inner loop latched it, archiver not stopping.
    pub fn can_update_archival_metadata(&self) -> bool {
        self.consensus.is_leader()
            && self.consensus.term() == self.start_term.load(Ordering::SeqCst)
            && !self.shutdown.is_cancelled()
    }

    /// True when new uploads may start: metadata updates are allowed and
    /// the transfer gate is open.
    pub fn may_begin_uploads(&self) -> bool {
        self.can_update_archival_metadata() && !self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn start_term(&self) -> Term {
        self.start_term.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Transfer gate
    // ------------------------------------------------------------------

    /// Ahead of a leadership transfer: stop starting uploads and wait for
    /// in-flight work to finish, so the transfer cannot orphan an object
    /// uploaded after the manifest was last written.
    ///
    /// Returns true once uploads have quiesced within `timeout`; false on
    /// timeout, leaving the archiver paused either way.
    pub async fn prepare_transfer_leadership(&self, timeout: Duration) -> bool {
        self.paused.store(true, Ordering::SeqCst);
        info!(partition = %self.partition, "pausing uploads for leadership transfer");
        match tokio::time::timeout(timeout, self.uploads_active.acquire()).await {
            Ok(Ok(_permit)) => {
                debug!(partition = %self.partition, "uploads quiesced");
                true
            }
            _ => {
                warn!(partition = %self.partition, "timed out waiting for uploads to quiesce");
                false
            }
        }
    }

    /// After a transfer attempt, whether it proceeded or not: allow this
    /// archiver to resume. If it is still the leader the inner loop picks
    /// up on its next iteration.
    pub fn complete_transfer_leadership(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.leader_cond.notify_waiters();
    }

    // ------------------------------------------------------------------
    // Producer loops
    // ------------------------------------------------------------------

    async fn upload_until_abort(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !self.consensus.is_leader() {
                // The notify can race with losing leadership; the timer
                // bounds how long a missed wakeup can park us.
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.leader_cond.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }

            let term = self.consensus.term();
            self.start_term.store(term, Ordering::SeqCst);
            info!(partition = %self.partition, term, "entering upload loop");

            if let Err(e) = self.maybe_truncate_manifest().await {
                warn!(partition = %self.partition, error = %e, "manifest reconciliation failed");
            }
            self.upload_until_term_change().await;
        }
        debug!(partition = %self.partition, "upload loop exited");
    }

    async fn upload_until_term_change(&self) {
        while self.can_update_archival_metadata() {
            if self.paused.load(Ordering::SeqCst) {
                // Gate closed: idle without holding `uploads_active`, so
                // the transfer gate can acquire it.
                if !self.idle_sleep().await {
                    return;
                }
                continue;
            }

            let permit = match self.uploads_active.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if !self.may_begin_uploads() {
                drop(permit);
                if !self.idle_sleep().await {
                    return;
                }
                continue;
            }

            if self.topic_manifest_dirty.load(Ordering::SeqCst) && self.partition.partition == 0 {
                self.upload_topic_manifest().await;
            }

            let mut attempted = 0;
            match self.upload_next_candidates(None).await {
                Ok(result) => attempted = result.total_uploads(),
                Err(e) => {
                    // Invariant violations are fatal to this archiver.
                    error!(partition = %self.partition, error = %e, "upload pass failed, stopping archiver");
                    self.shutdown.cancel();
                    drop(permit);
                    return;
                }
            }

            if self.housekeeping_due().await {
                if let Err(e) = self.housekeeping().await {
                    warn!(partition = %self.partition, error = %e, "housekeeping failed");
                }
            }
            drop(permit);

            let _ = self.estimate_backlog_size().await;
            if attempted == 0 {
                if !self.idle_sleep().await {
                    return;
                }
            }
        }
    }

    /// Jittered idle backoff, re-checking for pending work each tick.
    /// Returns false when the loop should exit (shutdown or term change).
    async fn idle_sleep(&self) -> bool {
        loop {
            if !self.can_update_archival_metadata() {
                return false;
            }
            let backoff = jittered(self.config.idle_backoff());
            tokio::select! {
                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(backoff) => {}
            }
            if self.has_pending_work().await {
                return true;
            }
        }
    }

    async fn has_pending_work(&self) -> bool {
        if self.topic_manifest_dirty.load(Ordering::SeqCst) {
            return true;
        }
        if self.housekeeping_due().await {
            return true;
        }
        let next = self.stm.with_manifest(|m| m.next_offset()).await;
        matches!(self.log.last_stable_offset(), Some(lso) if lso >= next)
    }

    // ------------------------------------------------------------------
    // Read-replica loops
    // ------------------------------------------------------------------

    async fn sync_manifest_until_abort(self: Arc<Self>) {
        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if !self.consensus.is_leader() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = self.leader_cond.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
                continue;
            }
            let term = self.consensus.term();
            self.start_term.store(term, Ordering::SeqCst);
            info!(partition = %self.partition, term, "entering manifest sync loop");
            self.sync_manifest_until_term_change().await;
        }
        debug!(partition = %self.partition, "manifest sync loop exited");
    }

    async fn sync_manifest_until_term_change(&self) {
        while self.can_update_archival_metadata() {
            let permit = match self.uploads_active.acquire().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            if let Err(e) = self.sync_manifest().await {
                warn!(partition = %self.partition, error = %e, "manifest sync failed");
            }
            drop(permit);

            let interval = self.bindings.sync_manifest_timeout.get();
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Download the remote manifest and ingest it. Returns true when the
    /// local manifest changed. Ingestion is idempotent.
    pub async fn sync_manifest(&self) -> Result<bool> {
        let _guard = self.mutex.lock().await;
        match self.download_manifest().await? {
            Some(remote) => {
                let changed = self.stm.install(remote).await;
                if changed {
                    debug!(partition = %self.partition, "ingested remote manifest");
                }
                Ok(changed)
            }
            None => {
                debug!(partition = %self.partition, "no remote manifest yet");
                Ok(false)
            }
        }
    }

    /// Fetch the manifest from its well-known key. `Ok(None)` means the
    /// store has no manifest for this partition (a fresh partition, not an
    /// error).
    pub async fn download_manifest(&self) -> Result<Option<PartitionManifest>> {
        let key = paths::manifest_key(&self.partition, self.initial_revision);
        match self.remote.download(&key).await {
            crate::remote::DownloadOutcome::Found(bytes) => {
                Ok(Some(PartitionManifest::deserialize(bytes)?))
            }
            crate::remote::DownloadOutcome::NotFound => Ok(None),
            crate::remote::DownloadOutcome::TransportError => {
                Err(Error::Remote(format!("manifest download failed: {key}")))
            }
            crate::remote::DownloadOutcome::TimedOut => {
                Err(Error::Remote(format!("manifest download timed out: {key}")))
            }
        }
    }

    /// Probe the remote store on term entry and reconcile local state.
    ///
    /// A fresh local STM adopts whatever the store holds. Otherwise local
    /// state is authoritative: a remote manifest ahead of local consensus
    /// state is logged at warn and left untouched, never merged.
    pub async fn maybe_truncate_manifest(&self) -> Result<Option<PartitionManifest>> {
        let _guard = self.mutex.lock().await;
        let remote = match self.download_manifest().await? {
            Some(remote) => remote,
            None => return Ok(None),
        };

        let (local_insync, local_segments) = self
            .stm
            .with_manifest(|m| (m.insync_offset(), m.segment_count()))
            .await;
        if local_segments == 0 && local_insync == 0 {
            if self.stm.install(remote.clone()).await {
                info!(
                    partition = %self.partition,
                    segments = remote.segment_count(),
                    "recovered manifest from object store"
                );
            }
        } else if remote.insync_offset() > local_insync {
            // Local consensus state is authoritative for a producer; an
            // ahead remote is surfaced loudly but never merged.
            warn!(
                partition = %self.partition,
                remote_insync = remote.insync_offset(),
                local_insync,
                "remote manifest is ahead of local consensus state, keeping local"
            );
        }
        Ok(Some(remote))
    }

    /// Estimate of local bytes not yet uploaded. Updates the probe.
    pub async fn estimate_backlog_size(&self) -> u64 {
        let next = self.stm.with_manifest(|m| m.next_offset()).await;
        let backlog: u64 = self
            .log
            .segments_in_range(next, Offset::MAX)
            .iter()
            .map(|s| s.size_bytes)
            .sum();
        self.probe.set_backlog_bytes(backlog);
        backlog
    }

    /// Housekeeping jobs owned by this archiver. Currently the
    /// adjacent-segment merger; the list may grow.
    pub fn get_housekeeping_jobs(&self) -> Vec<Arc<dyn HousekeepingJob>> {
        vec![self.merger.clone() as Arc<dyn HousekeepingJob>]
    }

    /// Run a caller-supplied scanner over the manifest and turn its result
    /// into a re-upload candidate. The candidate is remote: its sources are
    /// object keys to re-download and re-emit as one merged object.
    pub async fn find_reupload_candidate<F>(&self, scanner: F) -> Option<UploadCandidateWithLocks>
    where
        F: Fn(Offset, &PartitionManifest) -> Option<AdjacentSegmentRun>,
    {
        let manifest = self.stm.manifest().await;
        let run = scanner(self.log.start_offset(), &manifest)?;
        Some(
            self.policy
                .candidate_from_run(run, &manifest, self.start_term()),
        )
    }

    pub(crate) async fn record_upload_time(&self) {
        *self.last_upload_time.lock().await = Some(Instant::now());
        self.probe.set_last_upload_time(now_ms());
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Add up to 10% random jitter on top of a base duration.
pub(crate) fn jittered(base: Duration) -> Duration {
    let fraction = rand::thread_rng().gen_range(0.0..=0.1);
    base.mul_f64(1.0 + fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::LocalConsensus;
    use crate::log::InMemoryLog;
    use object_store::memory::InMemory;

    fn archiver() -> (Arc<PartitionArchiver>, Arc<LocalConsensus>) {
        let store = Arc::new(InMemory::new());
        let client = Arc::new(CloudClient::new(store, Duration::from_secs(5)));
        let log = Arc::new(InMemoryLog::new());
        let consensus = Arc::new(LocalConsensus::new());
        let manifest = PartitionManifest::new(TopicPartition::new("ns", "t", 0), 1);
        let archiver = PartitionArchiver::new(
            ArchiverMode::Producer,
            manifest,
            client,
            log,
            consensus.clone(),
            ArchiveConfig::default(),
        );
        (archiver, consensus)
    }

    #[test]
    fn test_upload_kind_labels() {
        assert_eq!(SegmentUploadKind::Compacted.to_string(), "compacted");
        assert_eq!(SegmentUploadKind::NonCompacted.to_string(), "non_compacted");
    }

    #[test]
    fn test_batch_result_totals() {
        let result = BatchResult {
            non_compacted: UploadGroupResult { succeeded: 2, failed: 1, cancelled: 1 },
            compacted: UploadGroupResult { succeeded: 1, failed: 0, cancelled: 0 },
        };
        assert_eq!(result.total_uploads(), 5);
        assert_eq!(result.total_succeeded(), 3);
    }

    #[tokio::test]
    async fn test_gate_blocks_new_uploads_until_complete() {
        let (archiver, _) = archiver();
        assert!(archiver.may_begin_uploads());

        // Idle archiver: the semaphore is free, quiescence is immediate.
        assert!(
            archiver
                .prepare_transfer_leadership(Duration::from_secs(1))
                .await
        );
        assert!(!archiver.may_begin_uploads());
        // Paused, but metadata updates themselves are still permitted.
        assert!(archiver.can_update_archival_metadata());

        archiver.complete_transfer_leadership();
        assert!(archiver.may_begin_uploads());
    }

    #[tokio::test]
    async fn test_term_change_fences_metadata_updates() {
        let (archiver, consensus) = archiver();
        assert!(archiver.can_update_archival_metadata());
        consensus.step_down(2);
        assert!(!archiver.can_update_archival_metadata());
        consensus.become_leader(2);
        // Leader again, but in a term newer than the latched one.
        assert!(!archiver.can_update_archival_metadata());
    }

    #[tokio::test]
    async fn test_stop_fences_everything() {
        let (archiver, _) = archiver();
        archiver.stop().await;
        assert!(!archiver.can_update_archival_metadata());
        assert!(!archiver.may_begin_uploads());
    }

    #[tokio::test]
    async fn test_upload_skipped_while_paused() {
        let (archiver, _) = archiver();
        archiver
            .prepare_transfer_leadership(Duration::from_secs(1))
            .await;
        let result = archiver.upload_next_candidates(Some(100)).await.unwrap();
        assert_eq!(result.total_uploads(), 0);
    }
}
