//! Cloud Storage Client
//!
//! Thin layer over [`object_store::ObjectStore`] that the archiver talks to.
//! It does three things the raw trait does not:
//!
//! 1. **Outcome classification.** Every request collapses into a small enum
//!    (`Success` / `PreconditionFailed` / `TransportError` / `TimedOut` /
//!    `Cancelled` and friends) so the scheduler can count results without
//!    inspecting error chains.
//! 2. **Retry chains.** Uploads run under a [`RetryChain`]: an exponential
//!    backoff policy bounded by a deadline and a cancellation token. The
//!    chain cancels one upload without aborting the archiver.
//! 3. **Object tags.** Each object class (segment, manifest, tx metadata)
//!    carries its tag set so bucket lifecycle rules can tell them apart.
//!
//! The client is shared by all archivers on a node; the underlying store
//! must accept concurrent requests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutOptions, TagSet};
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of a `put` request after the retry chain is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Success,
    /// The store rejected a conditional write; not retried.
    PreconditionFailed,
    TransportError,
    TimedOut,
    /// The retry chain's cancellation token fired.
    Cancelled,
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Success)
    }
}

impl std::fmt::Display for UploadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UploadOutcome::Success => "success",
            UploadOutcome::PreconditionFailed => "precondition-failed",
            UploadOutcome::TransportError => "transport-error",
            UploadOutcome::TimedOut => "timed-out",
            UploadOutcome::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Result of a `get` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Found(Bytes),
    NotFound,
    TransportError,
    TimedOut,
}

/// Result of a `delete` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Success,
    NotFound,
    TransportError,
    TimedOut,
}

impl DeleteOutcome {
    /// The object is gone, whether we deleted it or it never existed.
    pub fn is_gone(&self) -> bool {
        matches!(self, DeleteOutcome::Success | DeleteOutcome::NotFound)
    }
}

/// Object class, selecting the tag set attached on upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClass {
    Segment,
    Manifest,
    TxMetadata,
}

impl ObjectClass {
    fn tag_value(&self) -> &'static str {
        match self {
            ObjectClass::Segment => "segment",
            ObjectClass::Manifest => "manifest",
            ObjectClass::TxMetadata => "tx-metadata",
        }
    }
}

/// Exponential backoff policy for upload retries.
///
/// Backoff grows as `initial * multiplier^attempt`, capped at `max_backoff`,
/// with up to 20% random jitter to avoid synchronized retries across
/// archivers.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);
        let jitter = rand::thread_rng().gen_range(0.0..=0.2);
        Duration::from_millis((capped * (1.0 + jitter)) as u64)
    }
}

/// One upload's retry budget: a policy, a hard deadline, and a cancellation
/// token. Callers that need their own abort semantics supply their own chain;
/// the archiver supplies a default derived from its shutdown token otherwise.
#[derive(Debug, Clone)]
pub struct RetryChain {
    pub policy: RetryPolicy,
    pub deadline: Instant,
    pub token: CancellationToken,
}

impl RetryChain {
    pub fn new(policy: RetryPolicy, timeout: Duration, token: CancellationToken) -> Self {
        Self {
            policy,
            deadline: Instant::now() + timeout,
            token,
        }
    }
}

/// Request counters, readable for probes and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloudStats {
    pub puts: u64,
    pub gets: u64,
    pub deletes: u64,
}

/// Shared object-store client handle.
#[derive(Debug)]
pub struct CloudClient {
    store: Arc<dyn ObjectStore>,
    op_timeout: Duration,
    puts: AtomicU64,
    gets: AtomicU64,
    deletes: AtomicU64,
}

impl CloudClient {
    pub fn new(store: Arc<dyn ObjectStore>, op_timeout: Duration) -> Self {
        let op_timeout = if op_timeout.is_zero() {
            Duration::from_secs(30)
        } else {
            op_timeout
        };
        Self {
            store,
            op_timeout,
            puts: AtomicU64::new(0),
            gets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> CloudStats {
        CloudStats {
            puts: self.puts.load(Ordering::Relaxed),
            gets: self.gets.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
        }
    }

    fn tags(class: ObjectClass) -> TagSet {
        let mut tags = TagSet::default();
        tags.push("sv-object-class", class.tag_value());
        tags
    }

    /// Upload one object under a retry chain.
    pub async fn put(
        &self,
        key: &str,
        payload: Bytes,
        class: ObjectClass,
        rtc: &RetryChain,
    ) -> UploadOutcome {
        let path = Path::from(key);
        let mut attempt: u32 = 0;
        let mut last_timed_out = false;
        loop {
            if rtc.token.is_cancelled() {
                return UploadOutcome::Cancelled;
            }
            if Instant::now() >= rtc.deadline {
                return UploadOutcome::TimedOut;
            }

            self.puts.fetch_add(1, Ordering::Relaxed);
            let mut opts = PutOptions::default();
            opts.tags = Self::tags(class);
            let request = tokio::time::timeout(
                self.op_timeout,
                self.store.put_opts(&path, payload.clone().into(), opts),
            );
            let result = tokio::select! {
                _ = rtc.token.cancelled() => return UploadOutcome::Cancelled,
                result = request => result,
            };

            match result {
                Ok(Ok(_)) => {
                    debug!(key = %key, size = payload.len(), attempt, "uploaded object");
                    return UploadOutcome::Success;
                }
                Ok(Err(object_store::Error::Precondition { .. })) => {
                    warn!(key = %key, "upload rejected by store precondition");
                    return UploadOutcome::PreconditionFailed;
                }
                Ok(Err(e)) => {
                    warn!(key = %key, attempt, error = %e, "upload attempt failed");
                    last_timed_out = false;
                }
                Err(_) => {
                    warn!(key = %key, attempt, "upload attempt timed out");
                    last_timed_out = true;
                }
            }

            if attempt >= rtc.policy.max_retries {
                return if last_timed_out {
                    UploadOutcome::TimedOut
                } else {
                    UploadOutcome::TransportError
                };
            }
            let backoff = rtc.policy.backoff(attempt);
            tokio::select! {
                _ = rtc.token.cancelled() => return UploadOutcome::Cancelled,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    /// Download one object. Single attempt: callers re-poll on their own
    /// schedule, so retrying here would just hide staleness.
    pub async fn download(&self, key: &str) -> DownloadOutcome {
        let path = Path::from(key);
        self.gets.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.op_timeout, self.store.get(&path)).await {
            Ok(Ok(result)) => match result.bytes().await {
                Ok(bytes) => DownloadOutcome::Found(bytes),
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to read object body");
                    DownloadOutcome::TransportError
                }
            },
            Ok(Err(object_store::Error::NotFound { .. })) => DownloadOutcome::NotFound,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "download failed");
                DownloadOutcome::TransportError
            }
            Err(_) => {
                warn!(key = %key, "download timed out");
                DownloadOutcome::TimedOut
            }
        }
    }

    /// Delete one object. Deleting a missing object reports `NotFound`,
    /// which garbage collection treats as already done.
    pub async fn delete(&self, key: &str) -> DeleteOutcome {
        let path = Path::from(key);
        self.deletes.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.op_timeout, self.store.delete(&path)).await {
            Ok(Ok(())) => DeleteOutcome::Success,
            Ok(Err(object_store::Error::NotFound { .. })) => DeleteOutcome::NotFound,
            Ok(Err(e)) => {
                warn!(key = %key, error = %e, "delete failed");
                DeleteOutcome::TransportError
            }
            Err(_) => {
                warn!(key = %key, "delete timed out");
                DeleteOutcome::TimedOut
            }
        }
    }
}
