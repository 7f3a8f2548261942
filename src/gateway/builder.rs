//! Builder for configuring model hosts

use std::sync::Arc;

use super::ModelHost;
use crate::cache::{CacheConfig, InstanceCache};
use crate::catalog::Cataloger;
use crate::config::Config;
use crate::loader::SharedLoader;
use crate::{HuginnError, Result};

/// Builder for configuring [`ModelHost`] instances.
///
/// ```rust,ignore
/// let host = ModelHost::builder()
///     .from_config(&Config::load(None)?)
///     .loader(Arc::new(LlamaLoader::new()))
///     .build()?;
/// ```
pub struct HostBuilder<H: Send + Sync + 'static> {
    cache_config: CacheConfig,
    loader: Option<SharedLoader<H>>,
    catalog: Option<Arc<dyn Cataloger>>,
    ignore_integrity_check: bool,
}

impl<H: Send + Sync + 'static> HostBuilder<H> {
    pub fn new() -> Self {
        Self {
            cache_config: CacheConfig::default(),
            loader: None,
            catalog: None,
            ignore_integrity_check: false,
        }
    }

    /// Take cache settings, loader flags and the `[models]` catalog from a
    /// loaded config file.
    pub fn from_config(mut self, config: &Config) -> Self {
        self.cache_config = config.cache_config();
        self.ignore_integrity_check = config.loader.ignore_integrity_check;
        self.catalog = Some(Arc::new(config.catalog()));
        self
    }

    /// Set the instance cache configuration.
    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = config;
        self
    }

    /// Set the default loader (required).
    pub fn loader(mut self, loader: SharedLoader<H>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Set the model catalog (required).
    pub fn catalog(mut self, catalog: impl Cataloger + 'static) -> Self {
        self.catalog = Some(Arc::new(catalog));
        self
    }

    /// Set an already shared catalog.
    pub fn shared_catalog(mut self, catalog: Arc<dyn Cataloger>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Skip model file checksum verification in every load request.
    pub fn ignore_integrity_check(mut self, ignore: bool) -> Self {
        self.ignore_integrity_check = ignore;
        self
    }

    /// Build the host.
    pub fn build(self) -> Result<ModelHost<H>> {
        let loader = self
            .loader
            .ok_or_else(|| HuginnError::Configuration("no loader configured".to_string()))?;
        let catalog = self
            .catalog
            .ok_or_else(|| HuginnError::Configuration("no catalog configured".to_string()))?;

        let cache = InstanceCache::new(self.cache_config, loader);
        Ok(ModelHost::new(cache, catalog, self.ignore_integrity_check))
    }
}

impl<H: Send + Sync + 'static> Default for HostBuilder<H> {
    fn default() -> Self {
        Self::new()
    }
}
