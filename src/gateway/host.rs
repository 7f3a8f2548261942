//! ModelHost - catalog resolution, sessions and the shared instance cache

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, instrument};

use super::HostBuilder;
use crate::cache::{CacheKey, EvictorHandle, InstanceCache, Lease};
use crate::catalog::Cataloger;
use crate::loader::{LoadRequest, SharedLoader};
use crate::types::{ModelConfig, ModelStatus};
use crate::{HuginnError, Result};

/// Front door for request handlers.
///
/// Cheap to clone; clones share the cache and the session registry.
pub struct ModelHost<H: Send + Sync + 'static> {
    cache: InstanceCache<H>,
    catalog: Arc<dyn Cataloger>,
    ignore_integrity_check: bool,
    sessions: Arc<Mutex<HashMap<String, CacheKey>>>,
}

impl<H: Send + Sync + 'static> ModelHost<H> {
    /// Create a new builder for configuring the host.
    pub fn builder() -> HostBuilder<H> {
        HostBuilder::new()
    }

    pub(crate) fn new(
        cache: InstanceCache<H>,
        catalog: Arc<dyn Cataloger>,
        ignore_integrity_check: bool,
    ) -> Self {
        Self {
            cache,
            catalog,
            ignore_integrity_check,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn cache(&self) -> &InstanceCache<H> {
        &self.cache
    }

    pub fn catalog(&self) -> &Arc<dyn Cataloger> {
        &self.catalog
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CacheKey>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `model_id` to its cache key and load request.
    ///
    /// The catalog's config is the base; fields set in `overrides` win.
    pub async fn resolve(
        &self,
        model_id: &str,
        overrides: Option<&ModelConfig>,
    ) -> Result<(CacheKey, LoadRequest)> {
        let base = self.catalog.resolve_config(model_id).await?;
        let config = match overrides {
            Some(overrides) => base.merge(overrides),
            None => base,
        };
        let template = self.catalog.resolve_template(model_id).await?;

        let key = CacheKey::new(model_id, &config);
        let mut request = LoadRequest::new(model_id, config)
            .ignore_integrity_check(self.ignore_integrity_check);
        request.template = template;
        Ok((key, request))
    }

    /// Acquire a stream on the shared-pool instance of `model_id`.
    #[instrument(skip(self, overrides), fields(model = model_id))]
    pub async fn acquire(
        &self,
        model_id: &str,
        overrides: Option<&ModelConfig>,
    ) -> Result<Lease<H>> {
        let (key, request) = self.resolve(model_id, overrides).await?;
        self.cache.acquire(&key, request).await
    }

    /// Build `model_id` ahead of the first request.
    pub async fn preload(&self, model_id: &str) -> Result<()> {
        let (key, request) = self.resolve(model_id, None).await?;
        self.cache.preload(&key, request).await
    }

    /// Open (or re-attach to) a session-scoped instance.
    ///
    /// The instance is private to `session_id`: it never shares a slot with
    /// the shared pool or another session. `loader` overrides the host's
    /// default loader for this instance only. Re-opening a session with a
    /// different configuration retires the old instance.
    #[instrument(skip(self, request, loader), fields(model = %request.model_id))]
    pub async fn open_session(
        &self,
        session_id: &str,
        mut request: LoadRequest,
        loader: Option<SharedLoader<H>>,
    ) -> Result<Lease<H>> {
        if session_id.is_empty() {
            return Err(HuginnError::InvalidInput(
                "session id must not be empty".to_string(),
            ));
        }
        request.ignore_integrity_check |= self.ignore_integrity_check;
        let key = CacheKey::scoped(request.model_id.clone(), session_id, &request.config);

        let previous = self.sessions().insert(session_id.to_string(), key.clone());
        if let Some(previous) = previous.filter(|previous| *previous != key) {
            debug!(session = session_id, previous = %previous, "session reconfigured");
            self.cache.invalidate(&previous).await;
        }

        let result = match loader {
            Some(loader) => self.cache.acquire_custom(&key, request, loader).await,
            None => self.cache.acquire(&key, request).await,
        };
        if result.is_err() {
            let mut sessions = self.sessions();
            if sessions.get(session_id) == Some(&key) {
                sessions.remove(session_id);
            }
        }
        result
    }

    /// Start a stream on an open session's instance. Never builds.
    pub fn session(&self, session_id: &str) -> Result<Lease<H>> {
        let not_found = || HuginnError::SessionNotFound(session_id.to_string());
        let key = self.sessions().get(session_id).cloned().ok_or_else(not_found)?;

        let instance = self.cache.get_existing(&key).ok_or_else(not_found)?;
        instance.begin_stream().map_err(|err| match err {
            HuginnError::ModelNotFound(_) => not_found(),
            other => other,
        })
    }

    /// Close a session and retire its instance once its streams finish.
    ///
    /// Returns false if the session was unknown.
    pub async fn close_session(&self, session_id: &str) -> bool {
        let Some(key) = self.sessions().remove(session_id) else {
            debug!(session = session_id, "close_session: unknown session");
            return false;
        };
        info!(session = session_id, model = %key, "closing session");
        self.cache.invalidate(&key).await;
        true
    }

    /// Ids of the open sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    /// Status of every resident instance.
    pub fn model_status(&self) -> Vec<ModelStatus> {
        self.cache.model_status()
    }

    /// Start the background eviction sweep.
    pub fn spawn_evictor(&self) -> EvictorHandle {
        self.cache.spawn_evictor()
    }

    /// Drop every session and retire every instance.
    pub async fn shutdown(&self) -> usize {
        self.sessions().clear();
        self.cache.shutdown().await
    }
}

impl<H: Send + Sync + 'static> Clone for ModelHost<H> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            catalog: Arc::clone(&self.catalog),
            ignore_integrity_check: self.ignore_integrity_check,
            sessions: Arc::clone(&self.sessions),
        }
    }
}

impl<H: Send + Sync + 'static> std::fmt::Debug for ModelHost<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHost")
            .field("cache", &self.cache)
            .field("catalog", &self.catalog.name())
            .field("sessions", &self.sessions().len())
            .finish()
    }
}
