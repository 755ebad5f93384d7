//! StreamVault Archive
//!
//! This crate implements the per-partition cloud archiver: the component
//! responsible for durably tiering a partition's closed log segments, their
//! transaction side-channel metadata, and the partition manifest to an
//! S3-compatible object store while the partition keeps accepting writes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────┐   leadership / terms   ┌───────────────┐
//! │ PartitionArchiver  │◄───────────────────────┤  Consensus    │
//! │  - leadership loop │   replicate commands   │  (external)   │
//! │  - upload schedule │───────────────────────►└───────────────┘
//! │  - housekeeping    │
//! └───┬──────────┬─────┘
//!     │ read     │ put/get/delete
//!     ▼          ▼
//! ┌────────┐ ┌─────────────┐
//! │LocalLog│ │ CloudClient │──► S3 / MinIO / InMemory
//! └────────┘ └─────────────┘
//! ```
//!
//! Each partition hosted on a node gets one [`PartitionArchiver`]. Archivers
//! are independent: no cross-partition coordination happens here. An archiver
//! gates all work on being the replication leader, schedules bounded-parallel
//! uploads selected by the [`ArchivalPolicy`], records results in the
//! manifest through the replicated [`ManifestStm`], and runs housekeeping
//! (retention, garbage collection, adjacent-segment merging) on a jittered
//! schedule.
//!
//! ## Main Components
//!
//! - [`PartitionArchiver`] — the long-lived actor; producer and read-replica
//!   modes
//! - [`ArchivalPolicy`] — picks the next upload candidate under an offset
//!   budget, honoring term boundaries and the target segment size
//! - [`ManifestStm`] — replicate-then-apply wrapper around the manifest
//! - [`CloudClient`] — thin classification layer over `object_store`
//! - [`LocalLog`] / [`Consensus`] — collaborator traits supplied by the log
//!   engine and the replication layer
//! - [`HousekeepingJob`] / [`AdjacentSegmentMerger`] — pluggable maintenance
//!
//! ## Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use object_store::memory::InMemory;
//! use streamvault_archive::{
//!     ArchiveConfig, ArchiverMode, CloudClient, InMemoryLog, LocalConsensus,
//!     PartitionArchiver,
//! };
//! use streamvault_core::{PartitionManifest, TopicPartition};
//!
//! let store = Arc::new(InMemory::new());
//! let client = Arc::new(CloudClient::new(store, Default::default()));
//! let log = Arc::new(InMemoryLog::new());
//! let consensus = Arc::new(LocalConsensus::new());
//!
//! let manifest = PartitionManifest::new(TopicPartition::new("ns", "orders", 0), 21);
//! let archiver = PartitionArchiver::new(
//!     ArchiverMode::Producer,
//!     manifest,
//!     client,
//!     log,
//!     consensus,
//!     ArchiveConfig::default(),
//! );
//! archiver.start();
//! // ... partition serves writes; archiver tiers them in the background ...
//! archiver.stop().await;
//! ```

pub mod archiver;
pub mod config;
pub mod consensus;
pub mod error;
pub mod housekeeping;
pub mod log;
pub mod policy;
pub mod probe;
pub mod remote;
pub mod stm;

pub use archiver::{
    ArchiverMode, BatchResult, PartitionArchiver, SegmentUploadKind, UploadGroupResult,
};
pub use config::{ArchiveBindings, ArchiveConfig, Binding};
pub use consensus::{Consensus, ConsensusError, LocalConsensus};
pub use error::{Error, Result};
pub use housekeeping::{scan_adjacent_run, AdjacentSegmentMerger, HousekeepingJob};
pub use log::{InMemoryLog, LocalLog, LogSegment, SegmentReadLock};
pub use policy::{
    AdjacentSegmentRun, ArchivalPolicy, UploadCandidate, UploadCandidateWithLocks,
};
pub use probe::ArchiverProbe;
pub use remote::{
    CloudClient, CloudStats, DeleteOutcome, DownloadOutcome, ObjectClass, RetryChain,
    RetryPolicy, UploadOutcome,
};
pub use stm::ManifestStm;
