//! Archiver Configuration
//!
//! Two layers:
//!
//! - [`ArchiveConfig`]: the serde-friendly settings document, with defaults
//!   matching production behavior.
//! - [`ArchiveBindings`]: the subset of settings that may change at runtime,
//!   exposed as [`Binding`]s so a configuration frontend can push updates
//!   into a running archiver without restarting it.
//!
//! ## Usage
//!
//! ```ignore
//! use streamvault_archive::{ArchiveConfig, Binding};
//!
//! // Fixed settings from a config file:
//! let config: ArchiveConfig = serde_json::from_str(raw)?;
//! let bindings = config.bindings();
//!
//! // Or wire a runtime-updatable knob:
//! let (target_size, handle) = Binding::mutable(256 * 1024 * 1024);
//! handle.send_replace(512 * 1024 * 1024);
//! assert_eq!(target_size.get(), 512 * 1024 * 1024);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// A configuration value that may be updated while the archiver runs.
///
/// Wraps a `watch` receiver; `get` always observes the most recent value.
/// Bindings created with [`Binding::fixed`] never change.
#[derive(Debug, Clone)]
pub struct Binding<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> Binding<T> {
    /// A binding that keeps its initial value forever.
    pub fn fixed(value: T) -> Self {
        let (_tx, rx) = watch::channel(value);
        Self { rx }
    }

    /// A binding plus the sender used to update it at runtime.
    pub fn mutable(value: T) -> (Self, watch::Sender<T>) {
        let (tx, rx) = watch::channel(value);
        (Self { rx }, tx)
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }
}

/// Archiver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Interval between remote manifest downloads in read-replica mode
    /// (default: 60s).
    #[serde(default = "default_sync_manifest_timeout_ms")]
    pub sync_manifest_timeout_ms: u64,

    /// Maximum number of objects deleted per garbage-collection cycle
    /// (default: 5000).
    #[serde(default = "default_max_segments_pending_deletion")]
    pub max_segments_pending_deletion: usize,

    /// Base housekeeping period; each cycle is jittered by ~10%
    /// (default: 5 minutes).
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,

    /// Whether the adjacent-segment merge job runs (default: true).
    #[serde(default = "default_segment_merging_enabled")]
    pub segment_merging_enabled: bool,

    /// Preferred size of uploaded segment objects (default: 128MB). The
    /// policy concatenates small adjacent local segments up to this size.
    #[serde(default = "default_target_segment_size")]
    pub target_segment_size: u64,

    /// Size-based retention: keep at most this many bytes of uploaded data.
    /// `None` disables size-based retention.
    #[serde(default)]
    pub retention_bytes: Option<u64>,

    /// Time-based retention: advance the frontier past segments whose
    /// newest record is older than this. `None` disables it.
    #[serde(default)]
    pub retention_ms: Option<i64>,

    /// In-flight upload budget across compacted and non-compacted kinds
    /// combined (default: 4).
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,

    /// Base idle backoff between scheduler passes when there is no work
    /// (default: 100ms). Jitter is applied on top.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Deadline for a single upload attempt chain (default: 30s).
    #[serde(default = "default_upload_timeout_ms")]
    pub upload_timeout_ms: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            sync_manifest_timeout_ms: default_sync_manifest_timeout_ms(),
            max_segments_pending_deletion: default_max_segments_pending_deletion(),
            housekeeping_interval_ms: default_housekeeping_interval_ms(),
            segment_merging_enabled: default_segment_merging_enabled(),
            target_segment_size: default_target_segment_size(),
            retention_bytes: None,
            retention_ms: None,
            upload_concurrency: default_upload_concurrency(),
            idle_backoff_ms: default_idle_backoff_ms(),
            upload_timeout_ms: default_upload_timeout_ms(),
        }
    }
}

impl ArchiveConfig {
    pub fn sync_manifest_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_manifest_timeout_ms)
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_millis(self.upload_timeout_ms)
    }

    /// Snapshot the runtime-updatable settings into fixed bindings.
    ///
    /// A configuration frontend that supports live updates builds the
    /// bindings itself with [`Binding::mutable`] instead.
    pub fn bindings(&self) -> ArchiveBindings {
        ArchiveBindings {
            sync_manifest_timeout: Binding::fixed(self.sync_manifest_timeout()),
            max_segments_pending_deletion: Binding::fixed(self.max_segments_pending_deletion),
            housekeeping_interval: Binding::fixed(self.housekeeping_interval()),
            segment_merging_enabled: Binding::fixed(self.segment_merging_enabled),
            target_segment_size: Binding::fixed(self.target_segment_size),
            retention_bytes: Binding::fixed(self.retention_bytes),
            retention_ms: Binding::fixed(self.retention_ms),
        }
    }
}

/// Runtime-updatable archiver settings.
#[derive(Debug, Clone)]
pub struct ArchiveBindings {
    pub sync_manifest_timeout: Binding<Duration>,
    pub max_segments_pending_deletion: Binding<usize>,
    pub housekeeping_interval: Binding<Duration>,
    pub segment_merging_enabled: Binding<bool>,
    pub target_segment_size: Binding<u64>,
    pub retention_bytes: Binding<Option<u64>>,
    pub retention_ms: Binding<Option<i64>>,
}

fn default_sync_manifest_timeout_ms() -> u64 {
    60_000
}

fn default_max_segments_pending_deletion() -> usize {
    5000
}

fn default_housekeeping_interval_ms() -> u64 {
    5 * 60 * 1000
}

fn default_segment_merging_enabled() -> bool {
    true
}

fn default_target_segment_size() -> u64 {
    128 * 1024 * 1024
}

fn default_upload_concurrency() -> usize {
    4
}

fn default_idle_backoff_ms() -> u64 {
    100
}

fn default_upload_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ArchiveConfig::default();
        assert_eq!(config.upload_concurrency, 4);
        assert_eq!(config.idle_backoff(), Duration::from_millis(100));
        assert_eq!(config.target_segment_size, 128 * 1024 * 1024);
        assert!(config.segment_merging_enabled);
        assert!(config.retention_bytes.is_none());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ArchiveConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.max_segments_pending_deletion, 5000);
        assert_eq!(config.sync_manifest_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_deserialize_overrides() {
        let raw = r#"{"target_segment_size": 1024, "retention_bytes": 4096}"#;
        let config: ArchiveConfig = serde_json::from_str(raw).expect("parse");
        assert_eq!(config.target_segment_size, 1024);
        assert_eq!(config.retention_bytes, Some(4096));
    }

    #[test]
    fn test_fixed_binding_is_stable() {
        let binding = Binding::fixed(42u64);
        assert_eq!(binding.get(), 42);
        assert_eq!(binding.clone().get(), 42);
    }

    #[test]
    fn test_mutable_binding_observes_updates() {
        let (binding, handle) = Binding::mutable(Duration::from_secs(1));
        assert_eq!(binding.get(), Duration::from_secs(1));
        handle.send_replace(Duration::from_secs(9));
        assert_eq!(binding.get(), Duration::from_secs(9));
    }
}
