//! Archival Metadata STM
//!
//! [`ManifestStm`] is the replicate-then-apply wrapper around the in-memory
//! [`PartitionManifest`]. All producer-side mutations go through it:
//!
//! 1. The command batch is submitted to consensus under the archiver's
//!    latched term. Consensus rejects stale terms, which fences archivers
//!    that lost leadership between deciding to mutate and submitting.
//! 2. On commit, the batch is applied to the local manifest and the
//!    manifest's insync offset advances to the batch's consensus offset.
//!
//! Read replicas never replicate; they ingest a downloaded manifest through
//! [`ManifestStm::install`], which is idempotent and refuses to move the
//! insync offset backwards.
//!
//! Readers take cheap snapshots between mutations; the archiver's own mutex
//! already serializes mutators.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use streamvault_core::{ManifestCommand, Offset, PartitionManifest, SegmentMeta, Term};

use crate::consensus::Consensus;
use crate::error::Result;

pub struct ManifestStm {
    consensus: Arc<dyn Consensus>,
    manifest: RwLock<PartitionManifest>,
}

impl ManifestStm {
    pub fn new(manifest: PartitionManifest, consensus: Arc<dyn Consensus>) -> Self {
        Self {
            consensus,
            manifest: RwLock::new(manifest),
        }
    }

    /// Snapshot of the current manifest.
    pub async fn manifest(&self) -> PartitionManifest {
        self.manifest.read().await.clone()
    }

    /// Run a closure against the current manifest without cloning it.
    pub async fn with_manifest<R>(&self, f: impl FnOnce(&PartitionManifest) -> R) -> R {
        f(&*self.manifest.read().await)
    }

    /// Replicate and apply an add-segments command.
    pub async fn add_segments(&self, term: Term, segments: Vec<SegmentMeta>) -> Result<()> {
        self.replicate_and_apply(term, ManifestCommand::AddSegments(segments))
            .await
    }

    /// Replicate and apply a start-offset advance.
    pub async fn advance_start_offset(&self, term: Term, offset: Offset) -> Result<()> {
        self.replicate_and_apply(term, ManifestCommand::AdvanceStartOffset(offset))
            .await
    }

    /// Replicate and apply a remove-segments command.
    pub async fn remove_segments(&self, term: Term, keys: Vec<String>) -> Result<()> {
        self.replicate_and_apply(term, ManifestCommand::RemoveSegments(keys))
            .await
    }

    async fn replicate_and_apply(&self, term: Term, command: ManifestCommand) -> Result<()> {
        let insync = self.consensus.replicate(term, vec![command.clone()]).await?;
        let mut manifest = self.manifest.write().await;
        manifest.apply(&command)?;
        manifest.set_insync_offset(insync)?;
        debug!(insync, "applied replicated manifest command");
        Ok(())
    }

    /// Ingest a manifest downloaded from the object store (read-replica
    /// path, or producer bootstrap on an empty local state).
    ///
    /// Returns true when the local manifest changed. Applying the same
    /// manifest twice is a no-op; a remote manifest whose insync offset is
    /// behind the local one is ignored.
    pub async fn install(&self, remote: PartitionManifest) -> bool {
        let mut manifest = self.manifest.write().await;
        let local_empty = manifest.segment_count() == 0 && manifest.insync_offset() == 0;
        if !local_empty && remote.insync_offset() <= manifest.insync_offset() {
            return false;
        }
        if *manifest == remote {
            return false;
        }
        *manifest = remote;
        true
    }
}
