//! Telemetry metric name constants.
//!
//! Centralised metric names for the instance cache. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `model` — model identifier (without session scope)
//! - `status` — outcome: "ok" or "error"
//! - `reason` — eviction reason: "ttl", "capacity", "invalidate" or "shutdown"

/// Acquires served by an already-resident entry.
///
/// Labels: `model`.
pub const CACHE_HITS_TOTAL: &str = "huginn_cache_hits_total";

/// Acquires that had to start or join a build.
///
/// Labels: `model`.
pub const CACHE_MISSES_TOTAL: &str = "huginn_cache_misses_total";

/// Completed loader builds.
///
/// Labels: `model`, `status` ("ok" | "error").
pub const BUILDS_TOTAL: &str = "huginn_builds_total";

/// Loader build duration in seconds.
///
/// Labels: `model`.
pub const BUILD_DURATION_SECONDS: &str = "huginn_build_duration_seconds";

/// Entries retired from the table.
///
/// Labels: `reason`.
pub const EVICTIONS_TOTAL: &str = "huginn_evictions_total";

/// Acquires rejected by admission control.
///
/// Labels: `model`.
pub const BUSY_REJECTIONS_TOTAL: &str = "huginn_busy_rejections_total";

/// Loader teardowns that returned an error.
///
/// Labels: `model`.
pub const TEARDOWN_FAILURES_TOTAL: &str = "huginn_teardown_failures_total";

/// Number of Ready entries in the table.
pub const RESIDENT_MODELS: &str = "huginn_resident_models";

/// Streams started against resident entries.
///
/// Labels: `model`.
pub const STREAMS_TOTAL: &str = "huginn_streams_total";
