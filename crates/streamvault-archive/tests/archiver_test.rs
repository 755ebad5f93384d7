//! End-to-end archiver tests against the in-memory log, single-node
//! consensus, and a fault-injecting object store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::ObjectStore;

use common::FlakyStore;
use streamvault_archive::{
    ArchiveBindings, ArchiveConfig, ArchiverMode, Binding, CloudClient, DownloadOutcome,
    InMemoryLog, LocalConsensus, PartitionArchiver, UploadGroupResult,
};
use streamvault_core::{
    paths, ManifestCommand, PartitionManifest, SegmentMeta, TopicPartition,
};

const REVISION: u64 = 21;

struct Harness {
    archiver: Arc<PartitionArchiver>,
    log: Arc<InMemoryLog>,
    consensus: Arc<LocalConsensus>,
    client: Arc<CloudClient>,
    store: Arc<FlakyStore>,
}

fn partition() -> TopicPartition {
    TopicPartition::new("internal", "orders", 0)
}

fn seg_meta(base: u64, committed: u64, size: u64) -> SegmentMeta {
    SegmentMeta {
        base_offset: base,
        committed_offset: committed,
        delta_offset: 0,
        size_bytes: size,
        max_timestamp: committed as i64,
        segment_term: 1,
        archiver_term: 1,
        is_compacted: false,
        extension: Bytes::new(),
    }
}

fn harness(mode: ArchiverMode, config: ArchiveConfig) -> Harness {
    harness_full(
        mode,
        config,
        PartitionManifest::new(partition(), REVISION),
        Arc::new(LocalConsensus::new()),
    )
}

fn harness_full(
    mode: ArchiverMode,
    config: ArchiveConfig,
    manifest: PartitionManifest,
    consensus: Arc<LocalConsensus>,
) -> Harness {
    let store = Arc::new(FlakyStore::new());
    let client = Arc::new(CloudClient::new(store.clone(), Duration::from_secs(5)));
    let log = Arc::new(InMemoryLog::new());
    let archiver = PartitionArchiver::new(
        mode,
        manifest,
        client.clone(),
        log.clone(),
        consensus.clone(),
        config,
    );
    Harness {
        archiver,
        log,
        consensus,
        client,
        store,
    }
}

fn small_segment_config() -> ArchiveConfig {
    ArchiveConfig {
        target_segment_size: 500,
        ..Default::default()
    }
}

// -------------------------------------------------------------------
// Upload scheduling
// -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_happy_path_uploads_in_target_sized_segments() {
    let h = harness(ArchiverMode::Producer, small_segment_config());
    h.log.append_segment(0, 499, 1, 500, 1000);
    h.log.append_segment(500, 999, 1, 500, 2000);

    let result = h.archiver.upload_next_candidates(Some(999)).await.unwrap();
    assert_eq!(
        result.non_compacted,
        UploadGroupResult { succeeded: 2, failed: 0, cancelled: 0 }
    );
    assert_eq!(result.compacted.total(), 0);

    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest.segment_count(), 2);
    assert_eq!(manifest.start_offset(), 0);
    let ranges: Vec<(u64, u64)> = manifest
        .segments()
        .map(|s| (s.base_offset, s.committed_offset))
        .collect();
    assert_eq!(ranges, vec![(0, 499), (500, 999)]);

    // Two segment objects plus exactly one manifest upload.
    assert_eq!(h.client.stats().puts, 3);
    for meta in manifest.segments() {
        let key = manifest.segment_key(meta);
        assert!(matches!(
            h.client.download(&key).await,
            DownloadOutcome::Found(_)
        ));
    }
}

#[tokio::test(start_paused = true)]
async fn test_new_leader_uploads_only_from_manifest_frontier() {
    // Offsets [0, 600] were written and archived under term 1; the term-2
    // leader picks up at the frontier and uploads [601, 999] only.
    let mut manifest = PartitionManifest::new(partition(), REVISION);
    manifest
        .apply(&ManifestCommand::AddSegments(vec![seg_meta(0, 600, 601)]))
        .unwrap();
    let consensus = Arc::new(LocalConsensus::new());
    consensus.become_leader(2);

    let h = harness_full(ArchiverMode::Producer, small_segment_config(), manifest, consensus);
    h.log.append_segment(0, 600, 1, 601, 1000);
    h.log.append_segment(601, 999, 2, 399, 2000);

    let result = h.archiver.upload_next_candidates(Some(999)).await.unwrap();
    assert_eq!(result.non_compacted.succeeded, 1);

    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest.segment_count(), 2);
    let added = manifest.segments().last().unwrap();
    assert_eq!(added.base_offset, 601);
    assert_eq!(added.committed_offset, 999);
    assert_eq!(added.segment_term, 2);
    assert_eq!(added.archiver_term, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_mid_batch_preserves_no_gap() {
    let config = ArchiveConfig {
        target_segment_size: 100,
        ..Default::default()
    };
    let h = harness(ArchiverMode::Producer, config);
    h.log.append_segment(0, 99, 1, 100, 1);
    h.log.append_segment(100, 199, 1, 100, 2);
    h.log.append_segment(200, 299, 1, 100, 3);

    // The middle upload fails; the last one succeeds at the store level but
    // must be discarded to keep the manifest gapless.
    h.store.fail_puts_matching(Some("100-199"));
    let result = h.archiver.upload_next_candidates(Some(299)).await.unwrap();
    assert_eq!(
        result.non_compacted,
        UploadGroupResult { succeeded: 1, failed: 1, cancelled: 1 }
    );

    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest.segment_count(), 1);
    assert_eq!(manifest.last_offset(), Some(99));

    // The next pass regenerates candidates from the frontier and heals.
    h.store.fail_puts_matching(None);
    let result = h.archiver.upload_next_candidates(Some(299)).await.unwrap();
    assert_eq!(result.non_compacted.succeeded, 2);
    assert_eq!(h.archiver.manifest().await.last_offset(), Some(299));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_uploads_respect_budget() {
    let config = ArchiveConfig {
        target_segment_size: 100,
        ..Default::default()
    };
    let h = harness(ArchiverMode::Producer, config);
    for i in 0..10u64 {
        h.log
            .append_segment(i * 100, i * 100 + 99, 1, 100, i as i64);
    }
    h.store.set_put_latency(Duration::from_millis(50));

    let mut uploaded = 0;
    while uploaded < 10 {
        let result = h.archiver.upload_next_candidates(Some(999)).await.unwrap();
        assert!(result.non_compacted.succeeded <= 4);
        uploaded += result.non_compacted.succeeded;
    }
    assert!(h.store.max_in_flight() <= 4, "max in flight {}", h.store.max_in_flight());
    assert_eq!(h.archiver.manifest().await.segment_count(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_tx_side_channel_uploaded_with_segment() {
    let h = harness(ArchiverMode::Producer, small_segment_config());
    h.log.append_segment(0, 99, 1, 100, 1);
    h.log.set_tx_metadata(0, Bytes::from("tx-ranges"));

    let result = h.archiver.upload_next_candidates(Some(99)).await.unwrap();
    assert_eq!(result.non_compacted.succeeded, 1);

    let manifest = h.archiver.manifest().await;
    let meta = manifest.segments().next().unwrap();
    let tx_key = paths::tx_key(&partition(), REVISION, meta);
    match h.client.download(&tx_key).await {
        DownloadOutcome::Found(bytes) => assert_eq!(bytes, Bytes::from("tx-ranges")),
        other => panic!("expected tx object, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_every_object_carries_initial_revision() {
    let h = harness(ArchiverMode::Producer, small_segment_config());
    h.log.append_segment(0, 499, 1, 500, 1);
    h.log.append_segment(500, 999, 1, 500, 2);
    h.archiver.upload_next_candidates(Some(999)).await.unwrap();

    let objects: Vec<_> = h.store.list(None).try_collect().await.unwrap();
    assert!(!objects.is_empty());
    for object in objects {
        assert_eq!(
            paths::revision_of_key(object.location.as_ref()),
            Some(REVISION),
            "unexpected revision in {}",
            object.location
        );
    }
}

// -------------------------------------------------------------------
// Retention and garbage collection
// -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_retention_advances_then_gc_deletes() {
    let mut manifest = PartitionManifest::new(partition(), REVISION);
    manifest
        .apply(&ManifestCommand::AddSegments(vec![
            seg_meta(0, 499, 500),
            seg_meta(500, 999, 500),
        ]))
        .unwrap();
    let config = ArchiveConfig {
        retention_bytes: Some(500),
        ..Default::default()
    };
    let h = harness_full(
        ArchiverMode::Producer,
        config,
        manifest,
        Arc::new(LocalConsensus::new()),
    );

    // Retention only moves the frontier; nothing is deleted yet.
    h.archiver.apply_retention().await.unwrap();
    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest.start_offset(), 500);
    assert_eq!(manifest.segment_count(), 2);

    // While the store refuses deletes, the manifest keeps listing the
    // segment so the next cycle retries.
    h.store.set_fail_deletes(true);
    h.archiver.garbage_collect().await.unwrap();
    assert_eq!(h.archiver.manifest().await.segment_count(), 2);

    h.store.set_fail_deletes(false);
    h.archiver.garbage_collect().await.unwrap();
    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest.segment_count(), 1);
    assert_eq!(manifest.segments().next().unwrap().base_offset, 500);
    // The frontier never regresses.
    assert_eq!(manifest.start_offset(), 500);
}

#[tokio::test(start_paused = true)]
async fn test_gc_batch_is_bounded() {
    let mut manifest = PartitionManifest::new(partition(), REVISION);
    let segments: Vec<SegmentMeta> = (0..6u64)
        .map(|i| seg_meta(i * 10, i * 10 + 9, 10))
        .collect();
    manifest
        .apply(&ManifestCommand::AddSegments(segments))
        .unwrap();
    manifest
        .apply(&ManifestCommand::AdvanceStartOffset(60))
        .unwrap();

    let config = ArchiveConfig {
        max_segments_pending_deletion: 2,
        ..Default::default()
    };
    let h = harness_full(
        ArchiverMode::Producer,
        config,
        manifest,
        Arc::new(LocalConsensus::new()),
    );

    h.archiver.garbage_collect().await.unwrap();
    assert_eq!(h.archiver.manifest().await.segment_count(), 4);
    h.archiver.garbage_collect().await.unwrap();
    assert_eq!(h.archiver.manifest().await.segment_count(), 2);
    h.archiver.garbage_collect().await.unwrap();
    assert_eq!(h.archiver.manifest().await.segment_count(), 0);
}

// -------------------------------------------------------------------
// Adjacent-segment merging
// -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_adjacent_small_segments_merge_and_gc() {
    let (target_binding, target_handle) = Binding::mutable(100u64);
    let bindings = ArchiveBindings {
        sync_manifest_timeout: Binding::fixed(Duration::from_secs(60)),
        max_segments_pending_deletion: Binding::fixed(5000),
        housekeeping_interval: Binding::fixed(Duration::from_secs(300)),
        segment_merging_enabled: Binding::fixed(true),
        target_segment_size: target_binding,
        retention_bytes: Binding::fixed(None),
        retention_ms: Binding::fixed(None),
    };
    let store = Arc::new(FlakyStore::new());
    let client = Arc::new(CloudClient::new(store.clone(), Duration::from_secs(5)));
    let log = Arc::new(InMemoryLog::new());
    let consensus = Arc::new(LocalConsensus::new());
    let archiver = PartitionArchiver::with_bindings(
        ArchiverMode::Producer,
        PartitionManifest::new(partition(), REVISION),
        client.clone(),
        log.clone(),
        consensus.clone(),
        ArchiveConfig::default(),
        bindings,
    );

    // With a 100-byte target, each small segment uploads on its own.
    for i in 0..3u64 {
        log.append_segment(i * 100, i * 100 + 99, 1, 100, i as i64);
    }
    let result = archiver.upload_next_candidates(Some(299)).await.unwrap();
    assert_eq!(result.non_compacted.succeeded, 3);
    let before = archiver.manifest().await;
    let old_keys: Vec<String> = before.segments().map(|m| before.segment_key(m)).collect();

    // Raise the target: three 100-byte neighbours now qualify for a merge.
    target_handle.send_replace(1000);
    let jobs = archiver.get_housekeeping_jobs();
    assert_eq!(jobs.len(), 1);
    jobs[0]
        .run(tokio::time::Instant::now() + Duration::from_secs(5))
        .await
        .unwrap();

    let merged = archiver.manifest().await;
    assert_eq!(merged.segment_count(), 1);
    let meta = merged.segments().next().unwrap();
    assert_eq!((meta.base_offset, meta.committed_offset), (0, 299));
    assert_eq!(meta.size_bytes, 300);
    assert_eq!(merged.pending_deletion().len(), 3);
    match client.download(&merged.segment_key(meta)).await {
        DownloadOutcome::Found(bytes) => assert_eq!(bytes.len(), 300),
        other => panic!("expected merged object, got {:?}", other),
    }

    // GC reclaims the superseded objects and clears the pending list.
    archiver.garbage_collect().await.unwrap();
    let after = archiver.manifest().await;
    assert!(after.pending_deletion().is_empty());
    for key in old_keys {
        assert_eq!(client.download(&key).await, DownloadOutcome::NotFound);
    }
}

// -------------------------------------------------------------------
// Leadership transfer gate
// -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_transfer_gate_quiesces_uploads() {
    let config = ArchiveConfig {
        target_segment_size: 100,
        ..Default::default()
    };
    let h = harness(ArchiverMode::Producer, config);
    h.log.append_segment(0, 99, 1, 100, 1);
    h.log.append_segment(100, 199, 1, 100, 2);
    h.store.set_put_latency(Duration::from_millis(500));

    h.archiver.start();
    // Let the loop launch both uploads.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(
        h.archiver
            .prepare_transfer_leadership(Duration::from_secs(5))
            .await
    );
    // Both segment uploads and the manifest upload have resolved.
    let quiesced_puts = h.client.stats().puts;
    assert_eq!(quiesced_puts, 3);
    assert_eq!(h.archiver.manifest().await.segment_count(), 2);

    // New data arrives while paused: nothing is uploaded.
    h.log.append_segment(200, 299, 1, 100, 3);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.client.stats().puts, quiesced_puts);

    // Resume: the loop picks the new segment up.
    h.archiver.complete_transfer_leadership();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(h.archiver.manifest().await.last_offset(), Some(299));
    assert!(h.client.stats().puts > quiesced_puts);

    h.archiver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_transfer_gate_times_out_under_load() {
    let config = ArchiveConfig {
        target_segment_size: 100,
        upload_timeout_ms: 60_000,
        ..Default::default()
    };
    let h = harness(ArchiverMode::Producer, config);
    h.log.append_segment(0, 99, 1, 100, 1);
    h.store.set_put_latency(Duration::from_secs(30));

    h.archiver.start();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The in-flight upload takes 30s; a 1s budget is not enough.
    assert!(
        !h.archiver
            .prepare_transfer_leadership(Duration::from_secs(1))
            .await
    );
    h.archiver.complete_transfer_leadership();
    h.archiver.stop().await;
}

// -------------------------------------------------------------------
// Leadership loop
// -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_leadership_churn_gates_uploads() {
    let config = ArchiveConfig {
        target_segment_size: 100,
        ..Default::default()
    };
    let h = harness(ArchiverMode::Producer, config);
    h.log.append_segment(0, 99, 1, 100, 1);

    h.archiver.start();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.archiver.manifest().await.segment_count(), 1);
    let puts_as_leader = h.client.stats().puts;

    // Lose leadership: new data is not uploaded.
    h.consensus.step_down(2);
    h.archiver.notify_leadership();
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.log.append_segment(100, 199, 2, 100, 2);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.client.stats().puts, puts_as_leader);

    // Regain leadership in a later term: uploads resume under it.
    h.consensus.become_leader(3);
    h.archiver.notify_leadership();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest.last_offset(), Some(199));
    let added = manifest.segments().last().unwrap();
    assert_eq!(added.archiver_term, 3);

    h.archiver.stop().await;
}

// -------------------------------------------------------------------
// Manifest recovery and read replicas
// -------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_fresh_archiver_recovers_manifest_from_store() {
    let mut remote = PartitionManifest::new(partition(), REVISION);
    remote
        .apply(&ManifestCommand::AddSegments(vec![
            seg_meta(0, 499, 500),
            seg_meta(500, 999, 500),
        ]))
        .unwrap();
    remote.set_insync_offset(5).unwrap();

    let h = harness(ArchiverMode::Producer, small_segment_config());
    h.store.seed(&remote.object_key(), remote.serialize()).await;

    let recovered = h.archiver.maybe_truncate_manifest().await.unwrap();
    assert!(recovered.is_some());
    let manifest = h.archiver.manifest().await;
    assert_eq!(manifest, remote);
    // Uploads continue from the recovered frontier.
    assert_eq!(manifest.next_offset(), 1000);
}

#[tokio::test(start_paused = true)]
async fn test_ahead_remote_manifest_is_not_merged() {
    // A remote manifest whose insync offset is ahead of local consensus
    // state on a producer archiver: local wins, the archiver warns and
    // keeps going.
    let mut local = PartitionManifest::new(partition(), REVISION);
    local
        .apply(&ManifestCommand::AddSegments(vec![seg_meta(0, 99, 100)]))
        .unwrap();

    let mut remote = PartitionManifest::new(partition(), REVISION);
    remote
        .apply(&ManifestCommand::AddSegments(vec![
            seg_meta(0, 99, 100),
            seg_meta(100, 199, 100),
        ]))
        .unwrap();
    remote.set_insync_offset(7).unwrap();

    let h = harness_full(
        ArchiverMode::Producer,
        small_segment_config(),
        local.clone(),
        Arc::new(LocalConsensus::new()),
    );
    h.store.seed(&remote.object_key(), remote.serialize()).await;

    let observed = h.archiver.maybe_truncate_manifest().await.unwrap();
    assert_eq!(observed, Some(remote));
    // Local state is untouched.
    assert_eq!(h.archiver.manifest().await, local);

    // The archiver stays functional: uploads continue from the local
    // frontier.
    h.log.append_segment(0, 99, 1, 100, 1);
    h.log.append_segment(100, 199, 1, 100, 2);
    let result = h.archiver.upload_next_candidates(Some(199)).await.unwrap();
    assert_eq!(result.non_compacted.succeeded, 1);
    assert_eq!(h.archiver.manifest().await.last_offset(), Some(199));
}

#[tokio::test(start_paused = true)]
async fn test_read_replica_converges_and_never_uploads() {
    let config = ArchiveConfig {
        sync_manifest_timeout_ms: 2000,
        ..Default::default()
    };
    let h = harness(ArchiverMode::ReadReplica, config);

    let mut remote = PartitionManifest::new(partition(), REVISION);
    remote
        .apply(&ManifestCommand::AddSegments(vec![seg_meta(0, 99, 100)]))
        .unwrap();
    remote.set_insync_offset(5).unwrap();
    h.store.seed(&remote.object_key(), remote.serialize()).await;

    h.archiver.start();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.archiver.manifest().await, remote);

    // The remote manifest moves on; the replica converges within the sync
    // interval.
    remote
        .apply(&ManifestCommand::AddSegments(vec![seg_meta(100, 199, 100)]))
        .unwrap();
    remote.set_insync_offset(6).unwrap();
    h.store.seed(&remote.object_key(), remote.serialize()).await;

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.archiver.manifest().await, remote);

    // A read replica never writes to the store.
    assert_eq!(h.client.stats().puts, 0);
    h.archiver.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lso_override_narrows_upload_budget() {
    let h = harness(ArchiverMode::Producer, small_segment_config());
    h.log.append_segment(0, 499, 1, 500, 1);
    h.log.append_segment(500, 999, 1, 500, 2);

    // Only the first segment fits under the override.
    let result = h.archiver.upload_next_candidates(Some(499)).await.unwrap();
    assert_eq!(result.non_compacted.succeeded, 1);
    assert_eq!(h.archiver.manifest().await.last_offset(), Some(499));

    let backlog = h.archiver.estimate_backlog_size().await;
    assert_eq!(backlog, 500);
}
