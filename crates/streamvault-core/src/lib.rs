//! StreamVault Core
//!
//! This crate defines the data model shared by the tiered-storage subsystem:
//!
//! 1. **Partition identity**: the namespace/topic/partition triple plus the
//!    initial revision assigned at topic creation
//! 2. **Segment metadata**: one record per object uploaded to the store
//! 3. **Partition manifest**: the authoritative, replicated list of uploaded
//!    segments together with the retention frontier
//! 4. **Object key derivation**: deterministic names for segments, their
//!    transaction side-channel objects, and the manifest itself
//!
//! ## The Manifest
//!
//! The manifest is the source of truth for what has been uploaded. It is
//! mutated only through [`ManifestCommand`]s replicated via consensus, and it
//! has a canonical length-prefixed binary form that survives round-trips
//! byte-for-byte, including fields added by future versions.
//!
//! ## Key Stability
//!
//! Object names derive from the partition's *initial* revision, not its
//! current one. The current revision changes when a partition moves between
//! nodes; the initial revision never does, so object names stay stable in the
//! bucket across reassignments.

pub mod error;
pub mod manifest;
pub mod partition;
pub mod paths;

pub use error::{Error, Result};
pub use manifest::{ManifestCommand, PartitionManifest, SegmentMeta};
pub use partition::{InitialRevision, Offset, Term, TopicPartition};
