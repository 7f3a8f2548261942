//! Memoizing catalog decorator.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use tracing::debug;

use crate::types::{ChatTemplate, ModelConfig};
use crate::{HuginnError, Result};

use super::Cataloger;

/// Default lifetime of a memoized catalog lookup.
pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(60);

const MAX_CACHED_MODELS: u64 = 1_024;

/// Wraps a slow [`Cataloger`] (disk, network) and memoizes its answers.
///
/// Only successful lookups are cached; a `ModelNotFound` is asked again next
/// time, so a model added to the backing catalog shows up without a restart.
pub struct CachingCatalog<C> {
    inner: C,
    configs: Cache<String, ModelConfig>,
    templates: Cache<String, Option<ChatTemplate>>,
}

impl<C: Cataloger> CachingCatalog<C> {
    pub fn new(inner: C) -> Self {
        Self::with_ttl(inner, DEFAULT_CATALOG_TTL)
    }

    pub fn with_ttl(inner: C, ttl: Duration) -> Self {
        let configs = Cache::builder()
            .max_capacity(MAX_CACHED_MODELS)
            .time_to_live(ttl)
            .build();
        let templates = Cache::builder()
            .max_capacity(MAX_CACHED_MODELS)
            .time_to_live(ttl)
            .build();
        Self {
            inner,
            configs,
            templates,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    /// Forget everything memoized for `model_id`.
    pub async fn invalidate(&self, model_id: &str) {
        self.configs.invalidate(model_id).await;
        self.templates.invalidate(model_id).await;
    }
}

fn unshare(err: Arc<HuginnError>) -> HuginnError {
    Arc::unwrap_or_clone(err)
}

#[async_trait]
impl<C: Cataloger> Cataloger for CachingCatalog<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn resolve_config(&self, model_id: &str) -> Result<ModelConfig> {
        debug!(model = model_id, catalog = self.inner.name(), "resolving model config");
        self.configs
            .try_get_with(model_id.to_string(), self.inner.resolve_config(model_id))
            .await
            .map_err(unshare)
    }

    async fn resolve_template(&self, model_id: &str) -> Result<Option<ChatTemplate>> {
        self.templates
            .try_get_with(model_id.to_string(), self.inner.resolve_template(model_id))
            .await
            .map_err(unshare)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::catalog::StaticCatalog;

    struct CountingCatalog {
        inner: StaticCatalog,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Cataloger for CountingCatalog {
        fn name(&self) -> &str {
            "counting"
        }

        async fn resolve_config(&self, model_id: &str) -> Result<ModelConfig> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve_config(model_id).await
        }

        async fn resolve_template(&self, model_id: &str) -> Result<Option<ChatTemplate>> {
            self.inner.resolve_template(model_id).await
        }
    }

    fn counting() -> CachingCatalog<CountingCatalog> {
        CachingCatalog::new(CountingCatalog {
            inner: StaticCatalog::new().with_model("a", ModelConfig::new().context_window(512)),
            lookups: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn memoizes_successful_lookups() {
        let catalog = counting();
        for _ in 0..3 {
            let config = catalog.resolve_config("a").await.unwrap();
            assert_eq!(config.context_window, Some(512));
        }
        assert_eq!(catalog.inner().lookups.load(Ordering::SeqCst), 1);

        catalog.invalidate("a").await;
        catalog.resolve_config("a").await.unwrap();
        assert_eq!(catalog.inner().lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_memoize_misses() {
        let catalog = counting();
        let err = catalog.resolve_config("missing").await.unwrap_err();
        assert_eq!(err, HuginnError::ModelNotFound("missing".to_string()));
        catalog.resolve_config("missing").await.unwrap_err();
        assert_eq!(catalog.inner().lookups.load(Ordering::SeqCst), 2);
    }
}
