//! Object Key Derivation
//!
//! Every object the archiver writes has a deterministic key derived from the
//! partition identity and the segment's offset/term coordinates. Determinism
//! is what makes uploads safe to retry: re-uploading the same candidate
//! produces the same key, so a duplicated `put` overwrites the identical
//! object instead of leaking an orphan.
//!
//! ## Layout
//!
//! ```text
//! {namespace}/{topic}/{partition}_{initial_revision}/
//!     {base}-{committed}-{segment_term}-v{archiver_term}.log      segment body
//!     {base}-{committed}-{segment_term}-v{archiver_term}.log.tx   tx side-channel
//!     manifest.bin                                                partition manifest
//! ```
//!
//! The initial revision in the prefix keeps keys stable across partition
//! moves and lets a scrubber verify that every object under a prefix belongs
//! to the partition that owns it.

use crate::manifest::SegmentMeta;
use crate::partition::{InitialRevision, TopicPartition};

/// Key of an uploaded segment body.
pub fn segment_key(
    partition: &TopicPartition,
    revision: InitialRevision,
    meta: &SegmentMeta,
) -> String {
    format!(
        "{}/{}/{}_{}/{}-{}-{}-v{}.log",
        partition.namespace,
        partition.topic,
        partition.partition,
        revision,
        meta.base_offset,
        meta.committed_offset,
        meta.segment_term,
        meta.archiver_term,
    )
}

/// Key of the transaction side-channel object paired with a segment.
pub fn tx_key(
    partition: &TopicPartition,
    revision: InitialRevision,
    meta: &SegmentMeta,
) -> String {
    format!("{}.tx", segment_key(partition, revision, meta))
}

/// Derive the tx side-channel key from an already-derived segment key.
pub fn tx_key_for(segment_key: &str) -> String {
    format!("{segment_key}.tx")
}

/// Key of the partition manifest. A function of identity and initial
/// revision only, so producers and read replicas agree on the location.
pub fn manifest_key(partition: &TopicPartition, revision: InitialRevision) -> String {
    format!(
        "{}/{}/{}_{}/manifest.bin",
        partition.namespace, partition.topic, partition.partition, revision,
    )
}

/// Key of the topic-level manifest, maintained by partition 0.
pub fn topic_manifest_key(namespace: &str, topic: &str) -> String {
    format!("{namespace}/{topic}/topic_manifest.json")
}

/// Extract the initial revision embedded in an object key, if present.
///
/// Used to verify that an object found under a partition's prefix was
/// actually written for this incarnation of the partition.
pub fn revision_of_key(key: &str) -> Option<InitialRevision> {
    let mut parts = key.split('/');
    let _ns = parts.next()?;
    let _topic = parts.next()?;
    let dir = parts.next()?;
    let (_, rev) = dir.rsplit_once('_')?;
    rev.parse().ok()
}
