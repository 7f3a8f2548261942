//! Eviction: TTL sweeps, draining and teardown.
//!
//! Retiring an entry (TTL, capacity, invalidate, shutdown) only marks it
//! Removing and parks it on the draining list. Teardown happens later, once,
//! outside the table lock, and only after a final check that nothing is
//! streaming. Whichever of these gets there first does it:
//!
//! - the last [`Lease`](super::Lease) to drop on a Removing entry,
//! - the caller that retired an idle entry,
//! - the periodic sweep started by [`InstanceCache::spawn_evictor`].
//!
//! A failed teardown is logged and the entry is dropped anyway: a leaked
//! handle is recoverable by restarting the backend, a permanently stuck slot
//! is not.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::telemetry;

use super::entry::CacheEntry;
use super::instance::{InstanceCache, Shared};

/// Why an entry left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EvictionReason {
    /// Idle past its TTL.
    Ttl,
    /// Least recently used idle entry, displaced by a new key.
    Capacity,
    /// Explicit invalidation (e.g. session teardown).
    Invalidate,
    /// Cache shutdown.
    Shutdown,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ttl => "ttl",
            Self::Capacity => "capacity",
            Self::Invalidate => "invalidate",
            Self::Shutdown => "shutdown",
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries retired because their TTL passed.
    pub expired: usize,
    /// Drained entries torn down.
    pub destroyed: usize,
}

impl<H: Send + Sync + 'static> Shared<H> {
    /// Tear `entry` down if it is Removing, idle, and not already claimed.
    ///
    /// Returns true if this call performed the teardown.
    pub(crate) async fn finalize(&self, entry: Arc<CacheEntry<H>>) -> bool {
        if !entry.claim_teardown() {
            return false;
        }

        match entry.loader().teardown(entry.handle()).await {
            Ok(()) => info!(
                model = %entry.key(),
                instance = entry.id(),
                lifetime_secs = entry.created_at().elapsed().as_secs(),
                "model unloaded"
            ),
            Err(err) => {
                warn!(
                    model = %entry.key(),
                    instance = entry.id(),
                    error = %err,
                    "teardown failed; releasing the slot anyway"
                );
                metrics::counter!(telemetry::TEARDOWN_FAILURES_TOTAL,
                    "model" => entry.key().model_id().to_string())
                .increment(1);
            }
        }

        entry.mark_destroyed();
        self.table().forget(&entry);
        true
    }

    /// Retire expired entries and tear down everything that has drained.
    pub(crate) async fn sweep(&self) -> SweepReport {
        let (expired, drained) = {
            let mut table = self.table();
            let expired = table.retire_expired(Instant::now()).len();
            let drained: Vec<Arc<CacheEntry<H>>> = table
                .draining()
                .iter()
                .filter(|entry| entry.active_streams() == 0)
                .cloned()
                .collect();
            (expired, drained)
        };

        let mut destroyed = 0;
        for entry in drained {
            if self.finalize(entry).await {
                destroyed += 1;
            }
        }
        SweepReport { expired, destroyed }
    }
}

/// Handle to the background eviction task. Dropping it stops the task.
#[derive(Debug)]
pub struct EvictorHandle {
    task: JoinHandle<()>,
}

impl EvictorHandle {
    /// Stop the task now.
    pub fn stop(self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for EvictorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl<H: Send + Sync + 'static> InstanceCache<H> {
    /// Retire expired instances and unload drained ones, once.
    pub async fn sweep(&self) -> SweepReport {
        self.shared().sweep().await
    }

    /// Start sweeping every `sweep_interval` on the current runtime.
    ///
    /// The task holds only a weak reference: it exits on its own once every
    /// clone of the cache is gone.
    pub fn spawn_evictor(&self) -> EvictorHandle {
        let weak = Arc::downgrade(self.shared());
        let period = self.shared().config().sweep_interval;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(shared) = weak.upgrade() else {
                    debug!("instance cache dropped; evictor exiting");
                    break;
                };
                let report = shared.sweep().await;
                if report != SweepReport::default() {
                    debug!(
                        expired = report.expired,
                        destroyed = report.destroyed,
                        "eviction sweep"
                    );
                }
            }
        });

        EvictorHandle { task }
    }
}
