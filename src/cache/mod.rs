//! Model instance cache.
//!
//! [`InstanceCache`] keeps a bounded set of live model instances resident,
//! keyed by [`CacheKey`]:
//!
//! - **Singleflight** ([`singleflight`]) — one loader build per key, however
//!   many callers arrive at once. Failed builds are not cached.
//! - **Leases** ([`entry`]) — every caller streaming from an instance holds a
//!   [`Lease`]; an instance is never torn down while a lease is alive.
//! - **Eviction** ([`evictor`]) — sliding TTL plus least-recently-used
//!   capacity eviction, both deferred until an instance has drained.
//! - **Admission** ([`admission`]) — when every slot is held by a busy
//!   instance, new keys are rejected with [`HuginnError::Busy`](crate::HuginnError::Busy)
//!   rather than queued.
//!
//! # Lifecycle
//!
//! ```text
//!   acquire(key) ──► Building ──ok──► Ready ──ttl / lru / invalidate──► Removing
//!                        │                                                 │
//!                        └─err──► (removed, error to all waiters)          │ streams == 0
//!                                                                          ▼
//!                                                              teardown ──► Destroyed
//! ```

pub mod admission;
pub mod entry;
pub mod evictor;
pub mod instance;
pub mod key;
mod singleflight;

pub use admission::AdmissionPolicy;
pub use entry::{Instance, Lease};
pub use evictor::{EvictionReason, EvictorHandle, SweepReport};
pub use instance::InstanceCache;
pub use key::CacheKey;

use std::time::Duration;

/// Default maximum number of distinct resident models.
pub const DEFAULT_MAX_MODELS: usize = 3;

/// Default idle time before a model becomes eligible for removal.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// Default sequence slots reserved by incremental cache mode.
pub const DEFAULT_RESERVED_SLOTS: usize = 1;

/// Default period of the background eviction sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Configuration for the instance cache.
///
/// Zero values fall back to the defaults, so an unset or non-positive
/// setting never disables the cache.
///
/// ```rust
/// # use huginn::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .max_models(2)
///     .ttl(Duration::from_secs(600));
/// assert_eq!(config.max_models, 2);
/// assert_eq!(CacheConfig::new().max_models(0).max_models, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum distinct keys resident or building. Default: 3.
    pub max_models: usize,
    /// Sliding idle TTL. Default: 5 minutes.
    pub ttl: Duration,
    /// Sequence slots held back in incremental cache mode. Default: 1.
    pub reserved_slots: usize,
    /// Background sweep period. Default: 15 seconds.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_models: DEFAULT_MAX_MODELS,
            ttl: DEFAULT_TTL,
            reserved_slots: DEFAULT_RESERVED_SLOTS,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of resident models (0 = default).
    pub fn max_models(mut self, n: usize) -> Self {
        self.max_models = if n == 0 { DEFAULT_MAX_MODELS } else { n };
        self
    }

    /// Set the idle TTL (zero = default).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = if ttl.is_zero() { DEFAULT_TTL } else { ttl };
        self
    }

    /// Set the sequence slots reserved by incremental cache mode.
    pub fn reserved_slots(mut self, n: usize) -> Self {
        self.reserved_slots = n;
        self
    }

    /// Set the background sweep period (zero = default).
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = if interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            interval
        };
        self
    }

    /// The admission policy this config describes.
    pub fn admission_policy(&self) -> AdmissionPolicy {
        AdmissionPolicy::new(self.max_models, self.reserved_slots)
    }
}
