//! Partition Identity
//!
//! A partition is identified by the `(namespace, topic, partition)` triple.
//! The triple alone is not enough to name objects in the store: partitions
//! move between nodes and each move bumps the current revision. Object names
//! instead embed the **initial revision**, assigned once at topic creation,
//! so that a moved partition keeps addressing the objects it uploaded before
//! the move.

use serde::{Deserialize, Serialize};

/// Record offset within a partition. Offset ranges on segments are closed:
/// `[base_offset, committed_offset]` includes both ends.
pub type Offset = u64;

/// Leadership epoch assigned by the consensus layer. Monotonically
/// increasing; used to fence stale archivers.
pub type Term = u64;

/// Revision assigned at topic creation. Stable across partition moves.
pub type InitialRevision = u64;

/// Identity of a single replicated partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicPartition {
    /// Namespace the topic lives in.
    pub namespace: String,

    /// Topic name.
    pub topic: String,

    /// Partition index within the topic.
    pub partition: u32,
}

impl TopicPartition {
    pub fn new(
        namespace: impl Into<String>,
        topic: impl Into<String>,
        partition: u32,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.topic, self.partition)
    }
}
