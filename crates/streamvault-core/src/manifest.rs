//! Partition Manifest
//!
//! The manifest is the authoritative record of what a partition has uploaded
//! to the object store: an ordered sequence of segment metadata plus the
//! retention frontier. It lives in memory and is mutated exclusively through
//! [`ManifestCommand`]s that the owning archiver replicates via consensus, so
//! every replica applies the same mutations in the same order.
//!
//! ## Invariants
//!
//! - Segment ranges never overlap and never leave a gap above `start_offset`
//! - `start_offset` never decreases
//! - `insync_offset` never decreases
//! - A compacted re-upload covering already-listed segments replaces them
//!   atomically (removed and added in one command application)
//!
//! Violations are programming errors or corrupted replication state; `apply`
//! reports them as [`Error::InvariantViolation`] and the caller is expected
//! to treat that as fatal.
//!
//! ## Wire Format
//!
//! A length-prefixed big-endian binary record:
//!
//! ```text
//! ┌───────┬─────────┬────────────┬───────────┬──────────┐
//! │ Magic │ Version │ Namespace  │ Topic     │ Partition│
//! │ "SVMF"│ u16     │ u16 + utf8 │ u16 + utf8│ u32      │
//! └───────┴─────────┴────────────┴───────────┴──────────┘
//! ┌──────────────┬───────────────┬──────────────┬──────────────────────┐
//! │ Initial rev  │ Insync offset │ Start offset │ Last compacted offset│
//! │ u64          │ u64           │ u64          │ u64                  │
//! └──────────────┴───────────────┴──────────────┴──────────────────────┘
//! ┌───────────┬──────────────────────┬───────────┬──────────────────────┐
//! │ Seg count │ Segment records      │ Pend count│ Pending records      │
//! │ u32       │ (u32 len + body)...  │ u32       │ (u32 len + body)...  │
//! └───────────┴──────────────────────┴───────────┴──────────────────────┘
//! ```
//!
//! Each segment record is individually length-prefixed. Bytes past the
//! fields a reader understands are preserved verbatim and re-emitted on
//! encode, so a manifest written by a newer version round-trips through an
//! older reader byte-for-byte. The same applies to bytes trailing the
//! pending section.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::partition::{InitialRevision, Offset, Term, TopicPartition};
use crate::paths;

/// Magic bytes identifying a serialized partition manifest.
pub const MANIFEST_MAGIC: [u8; 4] = *b"SVMF";

/// Current wire format version.
pub const MANIFEST_VERSION: u16 = 1;

/// Size of the fixed fields of a segment record (everything except the
/// extension tail).
const SEGMENT_RECORD_SIZE: usize = 8 * 6 + 8 + 1;

/// Metadata of one uploaded segment object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentMeta {
    /// First offset covered by the segment.
    pub base_offset: Offset,

    /// Last offset covered by the segment (inclusive).
    pub committed_offset: Offset,

    /// Count of non-data batches preceding `base_offset`. Consumers use it
    /// to translate between raft offsets and record offsets.
    pub delta_offset: u64,

    /// Size of the uploaded object in bytes.
    pub size_bytes: u64,

    /// Largest record timestamp in the segment, milliseconds since epoch.
    pub max_timestamp: i64,

    /// Term the segment's records were written under.
    pub segment_term: Term,

    /// Leadership term under which the upload was recorded.
    pub archiver_term: Term,

    /// True when the object is a compacted re-upload.
    pub is_compacted: bool,

    /// Unknown trailing fields from a newer writer, preserved on round-trip.
    pub extension: Bytes,
}

impl SegmentMeta {
    /// Number of record offsets covered by the segment.
    pub fn record_span(&self) -> u64 {
        self.committed_offset - self.base_offset + 1
    }

    /// True if the closed offset ranges of `self` and `other` intersect.
    pub fn overlaps(&self, other: &SegmentMeta) -> bool {
        self.base_offset <= other.committed_offset && other.base_offset <= self.committed_offset
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32((SEGMENT_RECORD_SIZE + self.extension.len()) as u32);
        buf.put_u64(self.base_offset);
        buf.put_u64(self.committed_offset);
        buf.put_u64(self.delta_offset);
        buf.put_u64(self.size_bytes);
        buf.put_i64(self.max_timestamp);
        buf.put_u64(self.segment_term);
        buf.put_u64(self.archiver_term);
        buf.put_u8(self.is_compacted as u8);
        buf.put_slice(&self.extension);
    }

    fn decode(buf: &mut Bytes) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(Error::Corrupt("truncated segment record length".into()));
        }
        let len = buf.get_u32() as usize;
        if len < SEGMENT_RECORD_SIZE || buf.remaining() < len {
            return Err(Error::Corrupt(format!(
                "segment record length {len} out of bounds"
            )));
        }
        let mut record = buf.split_to(len);
        let meta = SegmentMeta {
            base_offset: record.get_u64(),
            committed_offset: record.get_u64(),
            delta_offset: record.get_u64(),
            size_bytes: record.get_u64(),
            max_timestamp: record.get_i64(),
            segment_term: record.get_u64(),
            archiver_term: record.get_u64(),
            is_compacted: record.get_u8() != 0,
            extension: record,
        };
        if meta.base_offset > meta.committed_offset {
            return Err(Error::Corrupt(format!(
                "segment base {} above committed {}",
                meta.base_offset, meta.committed_offset
            )));
        }
        Ok(meta)
    }
}

/// Mutation replicated through consensus before being applied to the
/// in-memory manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestCommand {
    /// Append uploaded segments, replacing any they supersede.
    AddSegments(Vec<SegmentMeta>),

    /// Advance the retention frontier. Values at or below the current
    /// frontier are a no-op.
    AdvanceStartOffset(Offset),

    /// Drop segments (live or deletion-pending) whose object keys match,
    /// after the store confirmed their deletion.
    RemoveSegments(Vec<String>),
}

/// The partition manifest: uploaded segments plus retention state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionManifest {
    partition: TopicPartition,
    initial_revision: InitialRevision,
    insync_offset: Offset,
    start_offset: Offset,
    last_uploaded_compacted_offset: Offset,
    segments: BTreeMap<Offset, SegmentMeta>,
    pending_deletion: Vec<SegmentMeta>,
    extension: Bytes,
}

impl PartitionManifest {
    /// Create an empty manifest for a partition.
    pub fn new(partition: TopicPartition, initial_revision: InitialRevision) -> Self {
        Self {
            partition,
            initial_revision,
            insync_offset: 0,
            start_offset: 0,
            last_uploaded_compacted_offset: 0,
            segments: BTreeMap::new(),
            pending_deletion: Vec::new(),
            extension: Bytes::new(),
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn initial_revision(&self) -> InitialRevision {
        self.initial_revision
    }

    /// Consensus offset of the most recent manifest mutation.
    pub fn insync_offset(&self) -> Offset {
        self.insync_offset
    }

    /// Retention frontier: smallest offset still queryable.
    pub fn start_offset(&self) -> Offset {
        self.start_offset
    }

    pub fn last_uploaded_compacted_offset(&self) -> Offset {
        self.last_uploaded_compacted_offset
    }

    /// Live segments in ascending base-offset order.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentMeta> {
        self.segments.values()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segments superseded or retired, awaiting confirmed deletion from the
    /// store.
    pub fn pending_deletion(&self) -> &[SegmentMeta] {
        &self.pending_deletion
    }

    /// Last offset covered by any live segment.
    pub fn last_offset(&self) -> Option<Offset> {
        self.segments.values().next_back().map(|s| s.committed_offset)
    }

    /// Offset the next non-compacted upload must start at.
    pub fn next_offset(&self) -> Offset {
        self.last_offset()
            .map(|o| o + 1)
            .unwrap_or(self.start_offset)
    }

    /// Total bytes across live segments.
    pub fn total_size_bytes(&self) -> u64 {
        self.segments.values().map(|s| s.size_bytes).sum()
    }

    /// Object key of a segment listed in (or produced for) this manifest.
    pub fn segment_key(&self, meta: &SegmentMeta) -> String {
        paths::segment_key(&self.partition, self.initial_revision, meta)
    }

    /// Key of this manifest in the object store.
    pub fn object_key(&self) -> String {
        paths::manifest_key(&self.partition, self.initial_revision)
    }

    /// True when a range `[base, committed]` aligns exactly with a run of
    /// live segments, i.e. a re-upload of that range can replace them
    /// without splitting any.
    pub fn is_replaceable_range(&self, base: Offset, committed: Offset) -> bool {
        let run: Vec<&SegmentMeta> = self
            .segments
            .values()
            .filter(|s| s.base_offset <= committed && base <= s.committed_offset)
            .collect();
        match (run.first(), run.last()) {
            (Some(first), Some(last)) => {
                first.base_offset == base && last.committed_offset == committed
            }
            _ => false,
        }
    }

    /// Record the consensus offset of an applied mutation.
    pub fn set_insync_offset(&mut self, offset: Offset) -> Result<()> {
        if offset < self.insync_offset {
            return Err(Error::InvariantViolation(format!(
                "insync offset moved backwards: {} -> {}",
                self.insync_offset, offset
            )));
        }
        self.insync_offset = offset;
        Ok(())
    }

    /// Apply one replicated command.
    pub fn apply(&mut self, command: &ManifestCommand) -> Result<()> {
        match command {
            ManifestCommand::AddSegments(segments) => {
                for meta in segments {
                    self.add_segment(meta.clone())?;
                }
                Ok(())
            }
            ManifestCommand::AdvanceStartOffset(offset) => {
                if *offset > self.start_offset {
                    self.start_offset = *offset;
                }
                Ok(())
            }
            ManifestCommand::RemoveSegments(keys) => {
                self.segments
                    .retain(|_, meta| !keys.contains(&paths::segment_key(&self.partition, self.initial_revision, meta)));
                self.pending_deletion
                    .retain(|meta| !keys.contains(&paths::segment_key(&self.partition, self.initial_revision, meta)));
                Ok(())
            }
        }
    }

    fn add_segment(&mut self, meta: SegmentMeta) -> Result<()> {
        if meta.base_offset > meta.committed_offset {
            return Err(Error::InvariantViolation(format!(
                "segment base {} above committed {}",
                meta.base_offset, meta.committed_offset
            )));
        }
        // A re-upload whose range fell entirely behind the retention
        // frontier while it was in flight has nothing left to replace.
        if meta.committed_offset < self.start_offset {
            return Ok(());
        }

        let replaced: Vec<Offset> = self
            .segments
            .values()
            .filter(|s| s.overlaps(&meta))
            .map(|s| s.base_offset)
            .collect();

        if replaced.is_empty() {
            if let Some(last) = self.last_offset() {
                if meta.base_offset != last + 1 {
                    return Err(Error::InvariantViolation(format!(
                        "segment [{}, {}] leaves a gap after offset {}",
                        meta.base_offset, meta.committed_offset, last
                    )));
                }
            }
        } else {
            // Replacement: the incoming range must cover whole segments so
            // the manifest never lists a partially superseded object.
            let first = self.segments[&replaced[0]].base_offset;
            let last = self.segments[replaced.last().expect("non-empty")].committed_offset;
            if first != meta.base_offset || last != meta.committed_offset {
                return Err(Error::InvariantViolation(format!(
                    "re-upload [{}, {}] misaligned with replaced run [{}, {}]",
                    meta.base_offset, meta.committed_offset, first, last
                )));
            }
            for base in replaced {
                if let Some(old) = self.segments.remove(&base) {
                    self.pending_deletion.push(old);
                }
            }
        }

        if meta.is_compacted && meta.committed_offset > self.last_uploaded_compacted_offset {
            self.last_uploaded_compacted_offset = meta.committed_offset;
        }
        self.segments.insert(meta.base_offset, meta);
        Ok(())
    }

    /// Encode into the canonical binary form.
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.segments.len() * 64);
        buf.put_slice(&MANIFEST_MAGIC);
        buf.put_u16(MANIFEST_VERSION);
        buf.put_u16(self.partition.namespace.len() as u16);
        buf.put_slice(self.partition.namespace.as_bytes());
        buf.put_u16(self.partition.topic.len() as u16);
        buf.put_slice(self.partition.topic.as_bytes());
        buf.put_u32(self.partition.partition);
        buf.put_u64(self.initial_revision);
        buf.put_u64(self.insync_offset);
        buf.put_u64(self.start_offset);
        buf.put_u64(self.last_uploaded_compacted_offset);
        buf.put_u32(self.segments.len() as u32);
        for meta in self.segments.values() {
            meta.encode(&mut buf);
        }
        buf.put_u32(self.pending_deletion.len() as u32);
        for meta in &self.pending_deletion {
            meta.encode(&mut buf);
        }
        buf.put_slice(&self.extension);
        buf.freeze()
    }

    /// Decode from the canonical binary form.
    pub fn deserialize(mut data: Bytes) -> Result<Self> {
        if data.remaining() < MANIFEST_MAGIC.len() + 2 {
            return Err(Error::Corrupt("manifest too short".into()));
        }
        let mut magic = [0u8; 4];
        data.copy_to_slice(&mut magic);
        if magic != MANIFEST_MAGIC {
            return Err(Error::Corrupt("bad manifest magic".into()));
        }
        let version = data.get_u16();
        if version > MANIFEST_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let namespace = read_string(&mut data)?;
        let topic = read_string(&mut data)?;
        if data.remaining() < 4 + 8 * 4 + 4 {
            return Err(Error::Corrupt("truncated manifest header".into()));
        }
        let partition = data.get_u32();
        let initial_revision = data.get_u64();
        let insync_offset = data.get_u64();
        let start_offset = data.get_u64();
        let last_uploaded_compacted_offset = data.get_u64();

        let segment_count = data.get_u32();
        let mut segments = BTreeMap::new();
        for _ in 0..segment_count {
            let meta = SegmentMeta::decode(&mut data)?;
            segments.insert(meta.base_offset, meta);
        }

        if data.remaining() < 4 {
            return Err(Error::Corrupt("truncated pending-deletion section".into()));
        }
        let pending_count = data.get_u32();
        let mut pending_deletion = Vec::with_capacity(pending_count as usize);
        for _ in 0..pending_count {
            pending_deletion.push(SegmentMeta::decode(&mut data)?);
        }

        Ok(Self {
            partition: TopicPartition::new(namespace, topic, partition),
            initial_revision,
            insync_offset,
            start_offset,
            last_uploaded_compacted_offset,
            segments,
            pending_deletion,
            extension: data,
        })
    }
}

fn read_string(data: &mut Bytes) -> Result<String> {
    if data.remaining() < 2 {
        return Err(Error::Corrupt("truncated string length".into()));
    }
    let len = data.get_u16() as usize;
    if data.remaining() < len {
        return Err(Error::Corrupt("truncated string body".into()));
    }
    let raw = data.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Corrupt("non-utf8 string".into()))
}
