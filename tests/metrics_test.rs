//! Tests for metrics integration.
//!
//! Uses `metrics_util::debugging::DebuggingRecorder` to capture and assert
//! on emitted metrics without needing a real exporter. Each test drives its
//! own current-thread runtime inside the local recorder scope so that the
//! cache's spawned build and teardown tasks record on the same thread.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use metrics_util::MetricKind;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

use huginn::telemetry;
use huginn::{CacheConfig, CacheKey, HuginnError, InstanceCache, LoadRequest, Loader, ModelConfig, Result};

// ============================================================================
// Mock loaders
// ============================================================================

struct OkLoader;

#[async_trait]
impl Loader for OkLoader {
    type Handle = ();

    fn name(&self) -> &str {
        "ok"
    }

    async fn build(&self, _request: &LoadRequest) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, _handle: &()) -> Result<()> {
        Ok(())
    }
}

struct FailingLoader;

#[async_trait]
impl Loader for FailingLoader {
    type Handle = ();

    fn name(&self) -> &str {
        "failing"
    }

    async fn build(&self, request: &LoadRequest) -> Result<()> {
        Err(HuginnError::load(&request.model_id, "corrupt file"))
    }

    async fn teardown(&self, _handle: &()) -> Result<()> {
        Ok(())
    }
}

struct BrokenTeardownLoader;

#[async_trait]
impl Loader for BrokenTeardownLoader {
    type Handle = ();

    fn name(&self) -> &str {
        "broken-teardown"
    }

    async fn build(&self, _request: &LoadRequest) -> Result<()> {
        Ok(())
    }

    async fn teardown(&self, _handle: &()) -> Result<()> {
        Err(HuginnError::Teardown {
            model: "m".to_string(),
            message: "device lost".to_string(),
        })
    }
}

// ============================================================================
// Snapshot type alias for readability
// ============================================================================

type SnapshotVec = Vec<(
    metrics_util::CompositeKey,
    Option<metrics::Unit>,
    Option<metrics::SharedString>,
    DebugValue,
)>;

// ============================================================================
// Helpers
// ============================================================================

/// Sum all counter values matching a given metric name.
fn counter_total(snapshot: &SnapshotVec, name: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| key.kind() == MetricKind::Counter && key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Sum counter values for `name` carrying label `label` = `value`.
fn counter_with_label(snapshot: &SnapshotVec, name: &str, label: &str, value: &str) -> u64 {
    snapshot
        .iter()
        .filter(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter
                && key.key().name() == name
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == label && l.value() == value)
        })
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => *v,
            _ => 0,
        })
        .sum()
}

/// Check if any histogram entries exist for a given metric name.
fn has_histogram(snapshot: &SnapshotVec, name: &str) -> bool {
    snapshot
        .iter()
        .any(|(key, _, _, _)| key.kind() == MetricKind::Histogram && key.key().name() == name)
}

/// Run `f` on a fresh current-thread runtime with a local recorder installed.
fn record<F, Fut>(f: F) -> SnapshotVec
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();

    metrics::with_local_recorder(&recorder, || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            f().await;
            // Let spawned teardown tasks finish.
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        });
    });

    snapshotter.snapshot().into_vec()
}

fn key(model: &str) -> CacheKey {
    CacheKey::new(model, &ModelConfig::new())
}

fn request(model: &str) -> LoadRequest {
    LoadRequest::new(model, ModelConfig::new())
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn build_hit_and_miss_are_recorded() {
    let snapshot = record(|| async {
        let cache = InstanceCache::<()>::new(CacheConfig::new(), Arc::new(OkLoader));
        drop(cache.acquire(&key("m"), request("m")).await.unwrap());
        drop(cache.acquire(&key("m"), request("m")).await.unwrap());
    });

    assert_eq!(counter_total(&snapshot, telemetry::CACHE_MISSES_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::CACHE_HITS_TOTAL), 1);
    assert_eq!(counter_total(&snapshot, telemetry::STREAMS_TOTAL), 2);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::BUILDS_TOTAL, "status", "ok"),
        1
    );
    assert!(
        has_histogram(&snapshot, telemetry::BUILD_DURATION_SECONDS),
        "expected a build duration histogram entry"
    );
}

#[test]
fn failed_build_is_recorded_as_error() {
    let snapshot = record(|| async {
        let cache = InstanceCache::<()>::new(CacheConfig::new(), Arc::new(FailingLoader));
        assert!(cache.acquire(&key("m"), request("m")).await.is_err());
    });

    assert_eq!(
        counter_with_label(&snapshot, telemetry::BUILDS_TOTAL, "status", "error"),
        1
    );
    assert_eq!(counter_total(&snapshot, telemetry::STREAMS_TOTAL), 0);
}

#[test]
fn evictions_and_busy_rejections_are_recorded() {
    let snapshot = record(|| async {
        let cache = InstanceCache::<()>::new(CacheConfig::new().max_models(1), Arc::new(OkLoader));

        let lease = cache.acquire(&key("a"), request("a")).await.unwrap();
        assert!(cache.acquire(&key("b"), request("b")).await.unwrap_err().is_busy());
        drop(lease);

        drop(cache.acquire(&key("b"), request("b")).await.unwrap());
        assert!(cache.invalidate(&key("b")).await);
    });

    assert_eq!(counter_total(&snapshot, telemetry::BUSY_REJECTIONS_TOTAL), 1);
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EVICTIONS_TOTAL, "reason", "capacity"),
        1
    );
    assert_eq!(
        counter_with_label(&snapshot, telemetry::EVICTIONS_TOTAL, "reason", "invalidate"),
        1
    );
}

#[test]
fn teardown_failures_are_recorded() {
    let snapshot = record(|| async {
        let cache = InstanceCache::<()>::new(CacheConfig::new(), Arc::new(BrokenTeardownLoader));
        cache.preload(&key("m"), request("m")).await.unwrap();
        assert!(cache.invalidate(&key("m")).await);
        assert!(cache.is_empty());
    });

    assert_eq!(counter_total(&snapshot, telemetry::TEARDOWN_FAILURES_TOTAL), 1);
}

#[tokio::test]
async fn metrics_are_noop_without_recorder() {
    // Verify no panics when no recorder is installed.
    let cache = InstanceCache::<()>::new(CacheConfig::new(), Arc::new(OkLoader));
    let _lease = cache.acquire(&key("m"), request("m")).await.unwrap();
}
