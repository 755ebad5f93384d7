//! Archiver Probe
//!
//! Minimal metrics surface for the archiver, one probe per partition.
//! Counters live in process-wide prometheus vectors labeled by partition
//! identity; [`ArchiverProbe`] binds the label values once and exposes the
//! update methods the archiver calls.

use lazy_static::lazy_static;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use std::sync::Once;

use streamvault_core::TopicPartition;

use crate::archiver::SegmentUploadKind;

static INIT: Once = Once::new();

lazy_static! {
    /// Registry holding all archiver metrics.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Segments uploaded, split by upload kind.
    pub static ref SEGMENTS_UPLOADED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamvault_archive_segments_uploaded_total", "Segments uploaded"),
        &["namespace", "topic", "partition", "kind"]
    ).expect("metric can be created");

    /// Segment uploads that failed, split by upload kind.
    pub static ref SEGMENTS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamvault_archive_segments_failed_total", "Segment uploads failed"),
        &["namespace", "topic", "partition", "kind"]
    ).expect("metric can be created");

    /// Segment uploads cancelled or discarded, split by upload kind.
    pub static ref SEGMENTS_CANCELLED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamvault_archive_segments_cancelled_total", "Segment uploads cancelled"),
        &["namespace", "topic", "partition", "kind"]
    ).expect("metric can be created");

    /// Bytes successfully uploaded.
    pub static ref UPLOADED_BYTES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamvault_archive_uploaded_bytes_total", "Bytes uploaded"),
        &["namespace", "topic", "partition"]
    ).expect("metric can be created");

    /// Manifest uploads.
    pub static ref MANIFEST_UPLOADS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamvault_archive_manifest_uploads_total", "Manifest uploads"),
        &["namespace", "topic", "partition"]
    ).expect("metric can be created");

    /// Objects deleted by garbage collection.
    pub static ref GC_DELETIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("streamvault_archive_gc_deletions_total", "Objects deleted by GC"),
        &["namespace", "topic", "partition"]
    ).expect("metric can be created");

    /// Wall-clock time of the last successful upload batch.
    pub static ref LAST_UPLOAD_TIMESTAMP: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamvault_archive_last_upload_timestamp_ms", "Last upload time, ms since epoch"),
        &["namespace", "topic", "partition"]
    ).expect("metric can be created");

    /// Estimated bytes of local data not yet uploaded.
    pub static ref BACKLOG_BYTES: IntGaugeVec = IntGaugeVec::new(
        Opts::new("streamvault_archive_backlog_bytes", "Estimated upload backlog"),
        &["namespace", "topic", "partition"]
    ).expect("metric can be created");
}

/// Register all archiver metrics with [`struct@REGISTRY`]. Idempotent.
pub fn register_metrics() {
    INIT.call_once(|| {
        let _ = REGISTRY.register(Box::new(SEGMENTS_UPLOADED_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(SEGMENTS_FAILED_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(SEGMENTS_CANCELLED_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(UPLOADED_BYTES_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(MANIFEST_UPLOADS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(GC_DELETIONS_TOTAL.clone()));
        let _ = REGISTRY.register(Box::new(LAST_UPLOAD_TIMESTAMP.clone()));
        let _ = REGISTRY.register(Box::new(BACKLOG_BYTES.clone()));
    });
}

/// Per-partition handle over the shared metric vectors.
#[derive(Debug, Clone)]
pub struct ArchiverProbe {
    namespace: String,
    topic: String,
    partition: String,
}

impl ArchiverProbe {
    pub fn new(partition: &TopicPartition) -> Self {
        register_metrics();
        Self {
            namespace: partition.namespace.clone(),
            topic: partition.topic.clone(),
            partition: partition.partition.to_string(),
        }
    }

    fn labels(&self) -> [&str; 3] {
        [&self.namespace, &self.topic, &self.partition]
    }

    fn kind_labels<'a>(&'a self, kind: &'a str) -> [&'a str; 4] {
        [&self.namespace, &self.topic, &self.partition, kind]
    }

    pub fn segment_uploaded(&self, kind: SegmentUploadKind, bytes: u64) {
        let kind = kind.as_label();
        SEGMENTS_UPLOADED_TOTAL
            .with_label_values(&self.kind_labels(kind))
            .inc();
        UPLOADED_BYTES_TOTAL
            .with_label_values(&self.labels())
            .inc_by(bytes);
    }

    pub fn segment_failed(&self, kind: SegmentUploadKind) {
        SEGMENTS_FAILED_TOTAL
            .with_label_values(&self.kind_labels(kind.as_label()))
            .inc();
    }

    pub fn segment_cancelled(&self, kind: SegmentUploadKind) {
        SEGMENTS_CANCELLED_TOTAL
            .with_label_values(&self.kind_labels(kind.as_label()))
            .inc();
    }

    pub fn manifest_uploaded(&self) {
        MANIFEST_UPLOADS_TOTAL
            .with_label_values(&self.labels())
            .inc();
    }

    pub fn gc_deleted(&self, count: u64) {
        GC_DELETIONS_TOTAL
            .with_label_values(&self.labels())
            .inc_by(count);
    }

    pub fn set_last_upload_time(&self, epoch_ms: i64) {
        LAST_UPLOAD_TIMESTAMP
            .with_label_values(&self.labels())
            .set(epoch_ms);
    }

    pub fn set_backlog_bytes(&self, bytes: u64) {
        BACKLOG_BYTES
            .with_label_values(&self.labels())
            .set(bytes as i64);
    }
}
