//! Cache entries and the stream guards that pin them.
//!
//! A [`CacheEntry`] owns one live handle plus its lifecycle metadata. Callers
//! never touch entries directly: they hold a [`Lease`] (one active stream,
//! released on drop) or an [`Instance`] (a non-counting peek).
//!
//! # Drain protocol
//!
//! Removal and stream start race without a shared lock:
//!
//! - a stream starts by incrementing `active_streams`, *then* checking that
//!   the entry is still Ready (backing out if not);
//! - removal flips the state to Removing, *then* checks `active_streams`.
//!
//! With sequentially consistent atomics at least one side observes the
//! other, so a handle is never torn down under a live stream. Whoever brings
//! the count of a Removing entry to zero hands it to the reaper.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::loader::SharedLoader;
use crate::telemetry;
use crate::types::{LoadState, ModelInfo};
use crate::{HuginnError, Result};

use super::CacheKey;

const READY: u8 = 0;
const REMOVING: u8 = 1;
const DESTROYED: u8 = 2;

/// Receives entries whose last stream ended after they were marked Removing.
pub(crate) trait Reaper<H: Send + Sync + 'static>: Send + Sync {
    fn reap(&self, entry: Arc<CacheEntry<H>>);
}

/// Fields needed to install a freshly built entry.
pub(crate) struct EntryInit<H: Send + Sync + 'static> {
    pub id: u64,
    pub key: CacheKey,
    pub handle: H,
    pub info: ModelInfo,
    pub loader: SharedLoader<H>,
    pub ttl: Duration,
    pub stream_limit: Option<usize>,
    pub reaper: Weak<dyn Reaper<H>>,
}

struct Times {
    expires_at: Instant,
    last_used_at: Instant,
}

/// One live instance and its lifecycle metadata.
pub(crate) struct CacheEntry<H: Send + Sync + 'static> {
    id: u64,
    key: CacheKey,
    handle: H,
    info: ModelInfo,
    loader: SharedLoader<H>,
    ttl: Duration,
    stream_limit: Option<usize>,
    reaper: Weak<dyn Reaper<H>>,
    created_at: Instant,
    state: AtomicU8,
    active_streams: AtomicUsize,
    teardown_claimed: AtomicBool,
    times: Mutex<Times>,
}

impl<H: Send + Sync + 'static> CacheEntry<H> {
    pub(crate) fn new(init: EntryInit<H>) -> Self {
        let now = Instant::now();
        Self {
            id: init.id,
            key: init.key,
            handle: init.handle,
            info: init.info,
            loader: init.loader,
            ttl: init.ttl,
            stream_limit: init.stream_limit,
            reaper: init.reaper,
            created_at: now,
            state: AtomicU8::new(READY),
            active_streams: AtomicUsize::new(0),
            teardown_claimed: AtomicBool::new(false),
            times: Mutex::new(Times {
                expires_at: now + init.ttl,
                last_used_at: now,
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn key(&self) -> &CacheKey {
        &self.key
    }

    pub(crate) fn handle(&self) -> &H {
        &self.handle
    }

    pub(crate) fn info(&self) -> &ModelInfo {
        &self.info
    }

    pub(crate) fn loader(&self) -> &SharedLoader<H> {
        &self.loader
    }

    pub(crate) fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn state(&self) -> LoadState {
        match self.state.load(Ordering::SeqCst) {
            READY => LoadState::Ready,
            REMOVING => LoadState::Removing,
            _ => LoadState::Destroyed,
        }
    }

    pub(crate) fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    fn times(&self) -> std::sync::MutexGuard<'_, Times> {
        self.times.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn expires_at(&self) -> Instant {
        self.times().expires_at
    }

    pub(crate) fn last_used_at(&self) -> Instant {
        self.times().last_used_at
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at() <= now
    }

    /// Slide the expiry forward by one TTL from now.
    pub(crate) fn touch(&self) {
        let now = Instant::now();
        let mut times = self.times();
        times.expires_at = now + self.ttl;
        times.last_used_at = now;
    }

    /// Ready → Removing. Returns false if the entry was not Ready.
    pub(crate) fn mark_removing(&self) -> bool {
        self.state
            .compare_exchange(READY, REMOVING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Claim the right to tear this entry down.
    ///
    /// Succeeds once, and only for a Removing entry with no active streams.
    pub(crate) fn claim_teardown(&self) -> bool {
        self.state.load(Ordering::SeqCst) == REMOVING
            && self.active_streams.load(Ordering::SeqCst) == 0
            && !self.teardown_claimed.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn mark_destroyed(&self) {
        let previous = self.state.swap(DESTROYED, Ordering::SeqCst);
        debug_assert_ne!(previous, DESTROYED, "{} destroyed twice", self.key);
    }

    /// Start a stream: increment, then verify the entry may still be served.
    pub(crate) fn begin_stream(self: &Arc<Self>) -> Result<Lease<H>> {
        let previous = self.active_streams.fetch_add(1, Ordering::SeqCst);

        if self.state.load(Ordering::SeqCst) != READY || self.is_expired(Instant::now()) {
            self.release();
            return Err(HuginnError::ModelNotFound(self.key.scoped_id()));
        }
        if let Some(limit) = self.stream_limit {
            if previous >= limit {
                self.release();
                metrics::counter!(telemetry::BUSY_REJECTIONS_TOTAL,
                    "model" => self.key.model_id().to_string())
                .increment(1);
                return Err(HuginnError::busy(
                    self.key.scoped_id(),
                    format!("all {limit} sequence slots are streaming"),
                ));
            }
        }

        self.touch();
        metrics::counter!(telemetry::STREAMS_TOTAL, "model" => self.key.model_id().to_string())
            .increment(1);
        Ok(Lease {
            entry: Arc::clone(self),
        })
    }

    /// End a stream. The caller that drains a Removing entry reaps it.
    fn release(self: &Arc<Self>) {
        let released = self
            .active_streams
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let previous = match released {
            Ok(previous) => previous,
            Err(_) => {
                debug_assert!(false, "active stream count underflow for {}", self.key);
                return;
            }
        };

        self.times().last_used_at = Instant::now();

        if previous == 1 && self.state.load(Ordering::SeqCst) == REMOVING {
            if let Some(reaper) = self.reaper.upgrade() {
                reaper.reap(Arc::clone(self));
            }
        }
    }
}

impl<H: Send + Sync + 'static> fmt::Debug for CacheEntry<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key.to_string())
            .field("id", &self.id)
            .field("state", &self.state())
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

/// An active stream against a resident instance.
///
/// Holding a lease keeps the instance alive: it will not be torn down until
/// every lease is dropped. Dropping the lease (normally, on error, on panic
/// unwind, or by cancelling the future that owns it) releases the stream.
pub struct Lease<H: Send + Sync + 'static> {
    entry: Arc<CacheEntry<H>>,
}

impl<H: Send + Sync + 'static> Lease<H> {
    pub fn handle(&self) -> &H {
        self.entry.handle()
    }

    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    pub fn instance_id(&self) -> u64 {
        self.entry.id()
    }

    pub fn info(&self) -> &ModelInfo {
        self.entry.info()
    }

    /// Refresh the instance's TTL without starting another stream.
    pub fn touch(&self) {
        self.entry.touch();
    }

    /// A non-counting reference to the same instance.
    pub fn instance(&self) -> Instance<H> {
        Instance {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<H: Send + Sync + 'static> Deref for Lease<H> {
    type Target = H;

    fn deref(&self) -> &H {
        self.entry.handle()
    }
}

impl<H: Send + Sync + 'static> Drop for Lease<H> {
    fn drop(&mut self) {
        self.entry.release();
    }
}

impl<H: Send + Sync + 'static> fmt::Debug for Lease<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.entry.key().to_string())
            .field("instance_id", &self.entry.id())
            .finish()
    }
}

/// A resident instance found by
/// [`InstanceCache::get_existing`](super::InstanceCache::get_existing).
///
/// Does not count as a stream and does not refresh the TTL. Call
/// [`begin_stream`](Self::begin_stream) before using the handle for inference.
pub struct Instance<H: Send + Sync + 'static> {
    entry: Arc<CacheEntry<H>>,
}

impl<H: Send + Sync + 'static> Instance<H> {
    pub(crate) fn new(entry: Arc<CacheEntry<H>>) -> Self {
        Self { entry }
    }

    pub fn handle(&self) -> &H {
        self.entry.handle()
    }

    pub fn key(&self) -> &CacheKey {
        self.entry.key()
    }

    pub fn instance_id(&self) -> u64 {
        self.entry.id()
    }

    pub fn info(&self) -> &ModelInfo {
        self.entry.info()
    }

    pub fn state(&self) -> LoadState {
        self.entry.state()
    }

    pub fn active_streams(&self) -> usize {
        self.entry.active_streams()
    }

    pub fn expires_at(&self) -> Instant {
        self.entry.expires_at()
    }

    /// Start a stream against this instance and refresh its TTL.
    ///
    /// Fails with `ModelNotFound` if the instance has been removed or has
    /// expired since the lookup, or `Busy` if all its sequence slots are
    /// streaming.
    pub fn begin_stream(&self) -> Result<Lease<H>> {
        self.entry.begin_stream()
    }
}

impl<H: Send + Sync + 'static> Clone for Instance<H> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
        }
    }
}

impl<H: Send + Sync + 'static> fmt::Debug for Instance<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("key", &self.entry.key().to_string())
            .field("instance_id", &self.entry.id())
            .field("state", &self.entry.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::loader::{LoadRequest, Loader};
    use crate::types::ModelConfig;

    struct NoopLoader;

    #[async_trait]
    impl Loader for NoopLoader {
        type Handle = u32;

        fn name(&self) -> &str {
            "noop"
        }

        async fn build(&self, _request: &LoadRequest) -> Result<u32> {
            Ok(7)
        }

        async fn teardown(&self, _handle: &u32) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingReaper {
        reaped: AtomicUsize,
    }

    impl Reaper<u32> for CountingReaper {
        fn reap(&self, _entry: Arc<CacheEntry<u32>>) {
            self.reaped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn entry(limit: Option<usize>, reaper: &Arc<CountingReaper>) -> Arc<CacheEntry<u32>> {
        let reaper: Arc<dyn Reaper<u32>> = reaper.clone();
        Arc::new(CacheEntry::new(EntryInit {
            id: 1,
            key: CacheKey::new("m", &ModelConfig::new()),
            handle: 7,
            info: ModelInfo::new("m"),
            loader: Arc::new(NoopLoader),
            ttl: Duration::from_secs(60),
            stream_limit: limit,
            reaper: Arc::downgrade(&reaper),
        }))
    }

    #[tokio::test]
    async fn lease_counts_streams() {
        let reaper = Arc::new(CountingReaper::default());
        let entry = entry(None, &reaper);

        let a = entry.begin_stream().unwrap();
        let b = entry.begin_stream().unwrap();
        assert_eq!(entry.active_streams(), 2);
        assert_eq!(*a, 7);

        drop(a);
        drop(b);
        assert_eq!(entry.active_streams(), 0);
        assert_eq!(reaper.reaped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn removing_entry_refuses_streams() {
        let reaper = Arc::new(CountingReaper::default());
        let entry = entry(None, &reaper);
        assert!(entry.mark_removing());
        assert!(!entry.mark_removing());

        let err = entry.begin_stream().unwrap_err();
        assert!(matches!(err, HuginnError::ModelNotFound(_)));
        assert_eq!(entry.active_streams(), 0);
    }

    #[tokio::test]
    async fn last_release_on_removing_entry_reaps() {
        let reaper = Arc::new(CountingReaper::default());
        let entry = entry(None, &reaper);

        let lease = entry.begin_stream().unwrap();
        entry.mark_removing();
        assert!(!entry.claim_teardown(), "must not claim while streaming");

        drop(lease);
        assert_eq!(reaper.reaped.load(Ordering::SeqCst), 1);
        assert!(entry.claim_teardown());
        assert!(!entry.claim_teardown(), "teardown is claimed once");
    }

    #[tokio::test]
    async fn stream_limit_rejects_with_busy() {
        let reaper = Arc::new(CountingReaper::default());
        let entry = entry(Some(1), &reaper);

        let lease = entry.begin_stream().unwrap();
        let err = entry.begin_stream().unwrap_err();
        assert!(err.is_busy());
        assert_eq!(entry.active_streams(), 1);

        drop(lease);
        assert!(entry.begin_stream().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn begin_stream_slides_expiry() {
        let reaper = Arc::new(CountingReaper::default());
        let entry = entry(None, &reaper);
        let first_expiry = entry.expires_at();

        tokio::time::advance(Duration::from_secs(30)).await;
        let _lease = entry.begin_stream().unwrap();
        assert_eq!(entry.expires_at(), first_expiry + Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_refuses_streams() {
        let reaper = Arc::new(CountingReaper::default());
        let entry = entry(None, &reaper);
        let expiry = entry.expires_at();

        tokio::time::advance(Duration::from_secs(61)).await;
        let err = entry.begin_stream().unwrap_err();
        assert!(matches!(err, HuginnError::ModelNotFound(_)));
        assert_eq!(entry.active_streams(), 0);
        assert_eq!(entry.expires_at(), expiry, "a refused stream must not slide the TTL");
    }
}
