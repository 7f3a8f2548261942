//! The instance table and its public contract.
//!
//! All structural changes (insert, retire, lookup) happen under one narrow
//! mutex that is held only for map and pointer manipulation. Loader builds,
//! teardowns and inference streams never run while it is held.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::loader::{LoadRequest, SharedLoader};
use crate::telemetry;
use crate::types::{LoadState, ModelStatus};
use crate::{HuginnError, Result};

use super::admission::{Admission, AdmissionPolicy};
use super::entry::{CacheEntry, EntryInit, Instance, Lease, Reaper};
use super::evictor::EvictionReason;
use super::singleflight::{self, BuildLatch, BuildPublisher};
use super::{CacheConfig, CacheKey};

/// A table slot: a build in progress or a resident entry.
pub(crate) enum Slot<H: Send + Sync + 'static> {
    Building {
        latch: BuildLatch<H>,
        /// Set by `invalidate`; the finished instance is unloaded instead of
        /// installed.
        invalidated: bool,
    },
    Ready(Arc<CacheEntry<H>>),
}

/// Key → slot map plus the entries that are draining towards teardown.
pub(crate) struct Table<H: Send + Sync + 'static> {
    slots: HashMap<CacheKey, Slot<H>>,
    draining: Vec<Arc<CacheEntry<H>>>,
}

impl<H: Send + Sync + 'static> Table<H> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            draining: Vec::new(),
        }
    }

    /// Keys that are Ready or Building.
    fn live(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn ready(&self) -> impl Iterator<Item = &Arc<CacheEntry<H>>> {
        self.slots.values().filter_map(|slot| match slot {
            Slot::Ready(entry) => Some(entry),
            Slot::Building { .. } => None,
        })
    }

    fn ready_count(&self) -> usize {
        self.ready().count()
    }

    pub(crate) fn draining(&self) -> &[Arc<CacheEntry<H>>] {
        &self.draining
    }

    /// Move a Ready entry out of the table and into the draining list.
    pub(crate) fn retire(
        &mut self,
        key: &CacheKey,
        reason: EvictionReason,
    ) -> Option<Arc<CacheEntry<H>>> {
        if !matches!(self.slots.get(key), Some(Slot::Ready(_))) {
            return None;
        }
        let Some(Slot::Ready(entry)) = self.slots.remove(key) else {
            return None;
        };

        entry.mark_removing();
        info!(
            model = %key,
            instance = entry.id(),
            reason = reason.as_str(),
            active_streams = entry.active_streams(),
            "retiring model"
        );
        metrics::counter!(telemetry::EVICTIONS_TOTAL, "reason" => reason.as_str()).increment(1);
        self.draining.push(Arc::clone(&entry));
        self.record_resident();
        Some(entry)
    }

    /// Retire every Ready entry whose TTL has passed.
    pub(crate) fn retire_expired(&mut self, now: Instant) -> Vec<Arc<CacheEntry<H>>> {
        let expired: Vec<CacheKey> = self
            .ready()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .iter()
            .filter_map(|key| self.retire(key, EvictionReason::Ttl))
            .collect()
    }

    /// Flag the build in progress for `key` so it is never installed.
    fn invalidate_build(&mut self, key: &CacheKey) -> bool {
        match self.slots.get_mut(key) {
            Some(Slot::Building { invalidated, .. }) => {
                if !*invalidated {
                    *invalidated = true;
                    metrics::counter!(telemetry::EVICTIONS_TOTAL,
                        "reason" => EvictionReason::Invalidate.as_str())
                    .increment(1);
                }
                true
            }
            _ => false,
        }
    }

    /// Drop the Building slot for `key` if it still belongs to `build_id`.
    fn release_build(&mut self, key: &CacheKey, build_id: u64) -> bool {
        let ours = matches!(
            self.slots.get(key),
            Some(Slot::Building { latch, .. }) if latch.id() == build_id
        );
        if ours {
            self.slots.remove(key);
        }
        ours
    }

    pub(crate) fn forget(&mut self, entry: &Arc<CacheEntry<H>>) {
        self.draining.retain(|e| !Arc::ptr_eq(e, entry));
    }

    fn record_resident(&self) {
        metrics::gauge!(telemetry::RESIDENT_MODELS).set(self.ready_count() as f64);
    }
}

/// Frees a build's slot when the build task ends without installing,
/// including by panic or runtime shutdown.
struct BuildSlot<'a, H: Send + Sync + 'static> {
    shared: &'a Shared<H>,
    key: &'a CacheKey,
    build_id: u64,
}

impl<H: Send + Sync + 'static> Drop for BuildSlot<'_, H> {
    fn drop(&mut self) {
        if self.shared.table().release_build(self.key, self.build_id) {
            debug!(model = %self.key, build = self.build_id, "build slot released");
        }
    }
}

/// State shared by every clone of an [`InstanceCache`] and by its build and
/// evictor tasks.
pub(crate) struct Shared<H: Send + Sync + 'static> {
    weak_self: Weak<Shared<H>>,
    table: Mutex<Table<H>>,
    loader: SharedLoader<H>,
    config: CacheConfig,
    policy: AdmissionPolicy,
    next_id: AtomicU64,
}

impl<H: Send + Sync + 'static> Shared<H> {
    pub(crate) fn table(&self) -> MutexGuard<'_, Table<H>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn reaper(&self) -> Weak<dyn Reaper<H>> {
        self.weak_self.clone()
    }

    /// Hand idle entries to the reaper; busy ones are reaped by their last
    /// lease.
    fn reap_idle(&self, entries: Vec<Arc<CacheEntry<H>>>) {
        for entry in entries {
            if entry.active_streams() == 0 {
                self.reap(entry);
            }
        }
    }

    /// Run one loader build and publish its outcome.
    async fn build(
        self: Arc<Self>,
        key: CacheKey,
        build_id: u64,
        request: Arc<LoadRequest>,
        loader: SharedLoader<H>,
        victim: Option<Arc<CacheEntry<H>>>,
        publisher: BuildPublisher<H>,
    ) {
        // Drops before `publisher`: woken waiters never find the dead latch.
        let _slot = BuildSlot {
            shared: &*self,
            key: &key,
            build_id,
        };

        if let Some(victim) = victim {
            debug!(model = %key, evicted = %victim.key(), "freeing a slot before loading");
            self.finalize(victim).await;
        }

        info!(model = %key, loader = loader.name(), "loading model");
        let started = Instant::now();
        let result = loader.build(&request).await;
        let elapsed = started.elapsed();

        let model = key.model_id().to_string();
        metrics::histogram!(telemetry::BUILD_DURATION_SECONDS, "model" => model.clone())
            .record(elapsed.as_secs_f64());
        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::BUILDS_TOTAL, "model" => model, "status" => status)
            .increment(1);

        let outcome = match result {
            Ok(handle) => self.install(&key, build_id, &request, loader, handle).await,
            Err(err) => {
                warn!(model = %key, error = %err, "model load failed");
                self.table().release_build(&key, build_id);
                Err(err)
            }
        };
        publisher.publish(outcome);
    }

    /// Swap the Building latch for a Ready entry.
    ///
    /// If the latch is gone (the cache was shut down mid-build) or the key was
    /// invalidated during the build, the new instance is torn down instead of
    /// installed and waiters receive `BuildAborted`.
    async fn install(
        &self,
        key: &CacheKey,
        build_id: u64,
        request: &LoadRequest,
        loader: SharedLoader<H>,
        handle: H,
    ) -> Result<Arc<CacheEntry<H>>> {
        let info = loader.describe(&handle, request);
        let entry = Arc::new(CacheEntry::new(EntryInit {
            id: build_id,
            key: key.clone(),
            handle,
            info,
            loader,
            ttl: self.config.ttl,
            stream_limit: self.policy.stream_limit(&request.config),
            reaper: self.reaper(),
        }));

        let installed = {
            let mut table = self.table();
            let ours = match table.slots.get(key) {
                Some(Slot::Building { latch, invalidated }) if latch.id() == build_id => {
                    Some(!*invalidated)
                }
                _ => None,
            };
            let install = ours == Some(true);
            if install {
                table
                    .slots
                    .insert(key.clone(), Slot::Ready(Arc::clone(&entry)));
                table.record_resident();
            } else {
                if ours.is_some() {
                    table.slots.remove(key);
                }
                entry.mark_removing();
                table.draining.push(Arc::clone(&entry));
            }
            install
        };

        if installed {
            info!(model = %key, instance = entry.id(), "model ready");
            Ok(entry)
        } else {
            warn!(model = %key, "build finished after its slot was released; unloading");
            self.finalize(entry).await;
            Err(HuginnError::BuildAborted(key.model_id().to_string()))
        }
    }
}

impl<H: Send + Sync + 'static> Reaper<H> for Shared<H> {
    fn reap(&self, entry: Arc<CacheEntry<H>>) {
        let Some(shared) = self.weak_self.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    shared.finalize(entry).await;
                });
            }
            Err(_) => {
                debug!(model = %entry.key(), "no runtime to unload on; leaving for the next sweep");
            }
        }
    }
}

/// Bounded, TTL-aware cache of live model instances.
///
/// Cheap to clone; clones share one table. Construct one per server and pass
/// it to every consumer. Tests can build as many independent caches as they
/// like.
///
/// Requires a tokio runtime: builds run on spawned tasks so that a caller
/// giving up never cancels a build other callers are waiting for.
pub struct InstanceCache<H: Send + Sync + 'static> {
    shared: Arc<Shared<H>>,
}

impl<H: Send + Sync + 'static> InstanceCache<H> {
    /// Create a cache that builds instances with `loader`.
    pub fn new(config: CacheConfig, loader: SharedLoader<H>) -> Self {
        let policy = config.admission_policy();
        let shared = Arc::new_cyclic(|weak_self| Shared {
            weak_self: weak_self.clone(),
            table: Mutex::new(Table::new()),
            loader,
            config,
            policy,
            next_id: AtomicU64::new(1),
        });
        Self { shared }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults(loader: SharedLoader<H>) -> Self {
        Self::new(CacheConfig::default(), loader)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared<H>> {
        &self.shared
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.shared.config
    }

    /// Acquire a stream on the instance for `key`, building it if needed.
    ///
    /// Fails with `Busy` when the table is full of busy instances, or with
    /// the loader's own error when the build fails.
    #[instrument(skip(self, request), fields(model = %key))]
    pub async fn acquire(&self, key: &CacheKey, request: LoadRequest) -> Result<Lease<H>> {
        let loader = Arc::clone(&self.shared.loader);
        self.acquire_with(key, request, loader).await
    }

    /// Like [`acquire`](Self::acquire), but builds with `loader` instead of
    /// the cache's default loader. Table, singleflight and eviction are
    /// shared; the instance is torn down by the loader that built it.
    #[instrument(skip(self, request, loader), fields(model = %key, loader = loader.name()))]
    pub async fn acquire_custom(
        &self,
        key: &CacheKey,
        request: LoadRequest,
        loader: SharedLoader<H>,
    ) -> Result<Lease<H>> {
        self.acquire_with(key, request, loader).await
    }

    async fn acquire_with(
        &self,
        key: &CacheKey,
        request: LoadRequest,
        loader: SharedLoader<H>,
    ) -> Result<Lease<H>> {
        let request = Arc::new(request);
        let model = key.model_id().to_string();

        loop {
            let (latch, retired) = {
                let mut table = self.shared.table();
                let retired = table.retire_expired(Instant::now());

                let hit = match table.slots.get(key) {
                    Some(Slot::Ready(entry)) => Some(Ok(Arc::clone(entry))),
                    Some(Slot::Building { latch, .. }) => Some(Err(latch.clone())),
                    None => None,
                };

                let latch = match hit {
                    Some(Ok(entry)) => {
                        let lease = entry.begin_stream();
                        drop(table);
                        self.shared.reap_idle(retired);
                        metrics::counter!(telemetry::CACHE_HITS_TOTAL, "model" => model.clone())
                            .increment(1);
                        debug!(instance = entry.id(), "cache hit");
                        return lease;
                    }
                    Some(Err(latch)) => latch,
                    None => {
                        let live = table.live();
                        let victim = match self.shared.policy.admit(live, table.ready()) {
                            Admission::Admit => None,
                            Admission::Evict(victim) => {
                                table.retire(victim.key(), EvictionReason::Capacity)
                            }
                            Admission::Busy => {
                                drop(table);
                                self.shared.reap_idle(retired);
                                warn!(live, "all model slots are busy");
                                metrics::counter!(telemetry::BUSY_REJECTIONS_TOTAL,
                                    "model" => model.clone())
                                .increment(1);
                                return Err(HuginnError::busy(
                                    key.scoped_id(),
                                    format!(
                                        "all {} model slots are loading or streaming",
                                        self.shared.policy.max_models
                                    ),
                                ));
                            }
                        };
                        self.start_build(&mut table, key, &request, &loader, victim)
                    }
                };
                (latch, retired)
            };
            self.shared.reap_idle(retired);
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL, "model" => model.clone())
                .increment(1);

            match latch.wait(&model).await {
                Ok(entry) => match entry.begin_stream() {
                    // Removed between install and our first stream; look again.
                    Err(HuginnError::ModelNotFound(_)) => continue,
                    other => return other,
                },
                Err(err) => return Err(err),
            }
        }
    }

    /// Reserve a Building slot for `key` and spawn its build.
    fn start_build(
        &self,
        table: &mut Table<H>,
        key: &CacheKey,
        request: &Arc<LoadRequest>,
        loader: &SharedLoader<H>,
        victim: Option<Arc<CacheEntry<H>>>,
    ) -> BuildLatch<H> {
        let build_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let (publisher, latch) = singleflight::latch(build_id);
        table
            .slots
            .insert(
                key.clone(),
                Slot::Building {
                    latch: latch.clone(),
                    invalidated: false,
                },
            );

        let shared = Arc::clone(&self.shared);
        tokio::spawn(shared.build(
            key.clone(),
            build_id,
            Arc::clone(request),
            Arc::clone(loader),
            victim,
            publisher,
        ));
        latch
    }

    /// Build the instance for `key` if absent and leave it resident.
    pub async fn preload(&self, key: &CacheKey, request: LoadRequest) -> Result<()> {
        let _ = self.acquire(key, request).await?;
        Ok(())
    }

    /// Look up a resident instance without building, counting a stream or
    /// refreshing its TTL.
    pub fn get_existing(&self, key: &CacheKey) -> Option<Instance<H>> {
        let table = self.shared.table();
        match table.slots.get(key) {
            Some(Slot::Ready(entry))
                if entry.state().is_servable() && !entry.is_expired(Instant::now()) =>
            {
                Some(Instance::new(Arc::clone(entry)))
            }
            _ => {
                debug!(model = %key, "no resident instance");
                None
            }
        }
    }

    /// Mark the instance for `key` Removing.
    ///
    /// In-flight streams finish normally against the still-valid handle; the
    /// instance is torn down when the last one ends (immediately if idle).
    /// A build in progress for `key` is unloaded as soon as it finishes, and
    /// its waiters receive `BuildAborted`. Returns false if nothing matched
    /// `key`.
    #[instrument(skip(self), fields(model = %key))]
    pub async fn invalidate(&self, key: &CacheKey) -> bool {
        let (building, retired) = {
            let mut table = self.shared.table();
            if table.invalidate_build(key) {
                (true, None)
            } else {
                (false, table.retire(key, EvictionReason::Invalidate))
            }
        };
        if building {
            debug!("invalidated mid-build; unloading once the build finishes");
            return true;
        }
        match retired {
            Some(entry) => {
                if entry.active_streams() == 0 {
                    self.shared.finalize(entry).await;
                } else {
                    debug!(
                        active_streams = entry.active_streams(),
                        "unload deferred until streams finish"
                    );
                }
                true
            }
            None => {
                debug!("invalidate: no resident or building instance");
                false
            }
        }
    }

    /// Retire everything and unload idle instances.
    ///
    /// Builds in flight are unloaded as soon as they finish and their waiters
    /// receive `BuildAborted`. Returns the number of instances retired.
    pub async fn shutdown(&self) -> usize {
        let retired = {
            let mut table = self.shared.table();
            table
                .slots
                .retain(|_, slot| matches!(slot, Slot::Ready(_)));
            let keys: Vec<CacheKey> = table.slots.keys().cloned().collect();
            keys.iter()
                .filter_map(|key| table.retire(key, EvictionReason::Shutdown))
                .collect::<Vec<_>>()
        };

        let count = retired.len();
        for entry in retired {
            self.shared.finalize(entry).await;
        }
        info!(retired = count, "instance cache shut down");
        count
    }

    /// Snapshot of every Ready or Removing instance, ordered by key.
    pub fn model_status(&self) -> Vec<ModelStatus> {
        let entries: Vec<Arc<CacheEntry<H>>> = {
            let table = self.shared.table();
            table
                .ready()
                .chain(table.draining().iter())
                .cloned()
                .collect()
        };

        let now = Instant::now();
        let wall = SystemTime::now();
        let mut statuses: Vec<ModelStatus> = entries
            .iter()
            .filter(|entry| matches!(entry.state(), LoadState::Ready | LoadState::Removing))
            .map(|entry| snapshot(entry, now, wall))
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key).then(a.instance_id.cmp(&b.instance_id)));
        statuses
    }

    /// Number of Ready instances.
    pub fn len(&self) -> usize {
        self.shared.table().ready_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn snapshot<H: Send + Sync + 'static>(
    entry: &CacheEntry<H>,
    now: Instant,
    wall: SystemTime,
) -> ModelStatus {
    let expires_at = entry.expires_at();
    let remaining = expires_at.saturating_duration_since(now);
    let wall_expiry = if expires_at >= now {
        wall + remaining
    } else {
        wall.checked_sub(now.saturating_duration_since(expires_at))
            .unwrap_or(wall)
    };
    let key = entry.key();
    let info = entry.info();

    ModelStatus {
        key: key.to_string(),
        id: key.model_id().to_string(),
        session: key.session().map(str::to_string),
        owner: info.owner.clone(),
        family: info.family.clone(),
        size_bytes: info.size_bytes,
        vram_total_bytes: info.vram_total_bytes,
        slot_memory_bytes: info.slot_memory_bytes,
        expires_at: wall_expiry,
        expires_in_secs: remaining.as_secs(),
        active_streams: entry.active_streams(),
        state: entry.state(),
        instance_id: entry.id(),
    }
}

impl<H: Send + Sync + 'static> Clone for InstanceCache<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<H: Send + Sync + 'static> fmt::Debug for InstanceCache<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCache")
            .field("config", &self.shared.config)
            .field("loader", &self.shared.loader.name())
            .field("resident", &self.len())
            .finish()
    }
}
