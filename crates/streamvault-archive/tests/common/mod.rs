//! Shared test helpers: a fault-injecting object store wrapping
//! `object_store::memory::InMemory`, with request latency, targeted put
//! failures, delete failures, and in-flight concurrency tracking.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{
    GetOptions, GetResult, ListResult, MultipartUpload, ObjectMeta, ObjectStore, PutMultipartOpts,
    PutOptions, PutPayload, PutResult,
};

#[derive(Debug)]
pub struct FlakyStore {
    inner: InMemory,
    put_latency_ms: AtomicU64,
    fail_puts_matching: Mutex<Option<String>>,
    fail_deletes: AtomicBool,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for FlakyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: InMemory::new(),
            put_latency_ms: AtomicU64::new(0),
            fail_puts_matching: Mutex::new(None),
            fail_deletes: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Delay every put by this much.
    pub fn set_put_latency(&self, latency: Duration) {
        self.put_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Fail puts whose key contains `pattern`; `None` heals.
    pub fn fail_puts_matching(&self, pattern: Option<&str>) {
        *self.fail_puts_matching.lock().unwrap() = pattern.map(str::to_string);
    }

    /// Fail every delete while set.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Highest number of concurrently in-flight puts observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Place an object directly, bypassing fault injection and counters.
    pub async fn seed(&self, key: &str, payload: Bytes) {
        self.inner
            .put(&Path::from(key), payload.into())
            .await
            .expect("seed object");
    }

    fn injected(&self, what: &str, location: &Path) -> object_store::Error {
        object_store::Error::Generic {
            store: "flaky",
            source: format!("injected {what} failure for {location}").into(),
        }
    }
}

impl fmt::Display for FlakyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FlakyStore({})", self.inner)
    }
}

#[async_trait]
impl ObjectStore for FlakyStore {
    async fn put_opts(
        &self,
        location: &Path,
        bytes: PutPayload,
        opts: PutOptions,
    ) -> object_store::Result<PutResult> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let latency = self.put_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        let pattern = self.fail_puts_matching.lock().unwrap().clone();
        let result = match pattern {
            Some(pattern) if location.as_ref().contains(&pattern) => {
                Err(self.injected("put", location))
            }
            _ => self.inner.put_opts(location, bytes, opts).await,
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn put_multipart(
        &self,
        location: &Path,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart(location).await
    }

    async fn put_multipart_opts(
        &self,
        location: &Path,
        opts: PutMultipartOpts,
    ) -> object_store::Result<Box<dyn MultipartUpload>> {
        self.inner.put_multipart_opts(location, opts).await
    }

    async fn get_opts(
        &self,
        location: &Path,
        options: GetOptions,
    ) -> object_store::Result<GetResult> {
        self.inner.get_opts(location, options).await
    }

    async fn delete(&self, location: &Path) -> object_store::Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(self.injected("delete", location));
        }
        self.inner.delete(location).await
    }

    fn list(&self, prefix: Option<&Path>) -> BoxStream<'_, object_store::Result<ObjectMeta>> {
        self.inner.list(prefix)
    }

    async fn list_with_delimiter(
        &self,
        prefix: Option<&Path>,
    ) -> object_store::Result<ListResult> {
        self.inner.list_with_delimiter(prefix).await
    }

    async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy(from, to).await
    }

    async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
        self.inner.copy_if_not_exists(from, to).await
    }
}
