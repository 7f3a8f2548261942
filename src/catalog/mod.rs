//! Model catalogs: where per-model load configuration comes from.
//!
//! The cache itself never consults a catalog. [`ModelHost`](crate::ModelHost)
//! resolves a model id to a [`ModelConfig`] (and optional [`ChatTemplate`])
//! through a [`Cataloger`], layers request overrides on top, and only then
//! computes the cache key.

mod caching;

pub use caching::{CachingCatalog, DEFAULT_CATALOG_TTL};

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::types::{ChatTemplate, ModelConfig};
use crate::{HuginnError, Result};

/// Resolves model ids to load configuration.
#[async_trait]
pub trait Cataloger: Send + Sync {
    /// Catalog name for logging/debugging.
    fn name(&self) -> &str;

    /// Base configuration for `model_id`.
    ///
    /// Unknown ids fail with [`HuginnError::ModelNotFound`].
    async fn resolve_config(&self, model_id: &str) -> Result<ModelConfig>;

    /// Chat template for `model_id`, if the catalog knows one.
    async fn resolve_template(&self, model_id: &str) -> Result<Option<ChatTemplate>>;
}

/// One `[models."<id>"]` table in the config file.
///
/// ```toml
/// [models."qwen/qwen3-8b"]
/// model_path = "/models/qwen3-8b-q4_k_m.gguf"
/// context_window = 8192
/// parallel_sequences = 4
/// template = { name = "chatml" }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CatalogEntry {
    #[serde(flatten)]
    pub config: ModelConfig,
    #[serde(default)]
    pub template: Option<ChatTemplate>,
}

/// In-memory catalog, usually built from the config file's `[models]` table.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    models: HashMap<String, CatalogEntry>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a map of model id → entry.
    pub fn from_entries(models: HashMap<String, CatalogEntry>) -> Self {
        Self { models }
    }

    /// Register `model_id` with `config`.
    pub fn with_model(mut self, model_id: impl Into<String>, config: ModelConfig) -> Self {
        self.insert(model_id, config);
        self
    }

    /// Attach a chat template to an already registered model.
    pub fn with_template(mut self, model_id: &str, template: ChatTemplate) -> Self {
        if let Some(entry) = self.models.get_mut(model_id) {
            entry.template = Some(template);
        }
        self
    }

    pub fn insert(&mut self, model_id: impl Into<String>, config: ModelConfig) {
        self.models
            .entry(model_id.into())
            .or_default()
            .config = config;
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }

    /// Known model ids, sorted.
    pub fn model_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.models.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    fn entry(&self, model_id: &str) -> Result<&CatalogEntry> {
        self.models
            .get(model_id)
            .ok_or_else(|| HuginnError::ModelNotFound(model_id.to_string()))
    }
}

#[async_trait]
impl Cataloger for StaticCatalog {
    fn name(&self) -> &str {
        "static"
    }

    async fn resolve_config(&self, model_id: &str) -> Result<ModelConfig> {
        self.entry(model_id).map(|entry| entry.config.clone())
    }

    async fn resolve_template(&self, model_id: &str) -> Result<Option<ChatTemplate>> {
        self.entry(model_id).map(|entry| entry.template.clone())
    }
}
