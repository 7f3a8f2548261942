//! Configuration loading.
//!
//! Configuration is loaded from TOML files with the following resolution order:
//! 1. Explicit path (e.g. a `--config <path>` flag in the host binary)
//! 2. `~/.huginn/config.toml` (user)
//! 3. `/etc/huginn/config.toml` (system)
//!
//! ```toml
//! [cache]
//! max_models = 2
//! ttl_secs = 600
//!
//! [loader]
//! ignore_integrity_check = false
//!
//! [models."qwen/qwen3-8b"]
//! model_path = "/models/qwen3-8b.gguf"
//! parallel_sequences = 4
//! ```

use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheConfig;
use crate::catalog::{CatalogEntry, StaticCatalog};
use crate::{HuginnError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub loader: LoaderSection,
    /// Per-model load configuration, keyed by model id.
    #[serde(default)]
    pub models: HashMap<String, CatalogEntry>,
}

/// `[cache]` section.
///
/// Signed so that a zero or negative value in the file means "use the
/// default" instead of failing to parse.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSection {
    /// Maximum resident models (default: 3).
    #[serde(default)]
    pub max_models: Option<i64>,
    /// Idle TTL in seconds (default: 300).
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    /// Sequence slots reserved in incremental cache mode (default: 1).
    #[serde(default)]
    pub reserved_slots: Option<u32>,
    /// Eviction sweep period in seconds (default: 15).
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

/// `[loader]` section. Forwarded to loaders, never read by the cache.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoaderSection {
    /// Skip model file checksum verification.
    #[serde(default)]
    pub ignore_integrity_check: bool,
}

fn positive(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v > 0).map(|v| v as u64)
}

impl CacheSection {
    /// Convert to runtime cache configuration, applying defaults.
    pub fn to_cache_config(&self) -> CacheConfig {
        let mut config = CacheConfig::new();
        if let Some(n) = positive(self.max_models) {
            config = config.max_models(usize::try_from(n).unwrap_or(usize::MAX));
        }
        if let Some(secs) = positive(self.ttl_secs) {
            config = config.ttl(Duration::from_secs(secs));
        }
        if let Some(n) = self.reserved_slots {
            config = config.reserved_slots(n as usize);
        }
        if let Some(secs) = self.sweep_interval_secs {
            config = config.sweep_interval(Duration::from_secs(secs));
        }
        config
    }
}

impl Config {
    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.huginn/config.toml`
    /// 3. `/etc/huginn/config.toml`
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        Self::load_from_file(&path)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            HuginnError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        toml::from_str(&content).map_err(|e| {
            HuginnError::Configuration(format!("Failed to parse config file {path:?}: {e}"))
        })
    }

    /// Resolve the config file path.
    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(HuginnError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        // User config
        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".huginn").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        // System config
        let system_config = PathBuf::from("/etc/huginn/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(HuginnError::Configuration(
            "No config file found. Create ~/.huginn/config.toml or /etc/huginn/config.toml"
                .to_string(),
        ))
    }

    /// Runtime cache configuration.
    pub fn cache_config(&self) -> CacheConfig {
        self.cache.to_cache_config()
    }

    /// A catalog serving the `[models]` table.
    pub fn catalog(&self) -> StaticCatalog {
        StaticCatalog::from_entries(self.models.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{DEFAULT_MAX_MODELS, DEFAULT_TTL};

    #[test]
    fn default_config_has_expected_values() {
        let config = Config::default();
        let cache = config.cache_config();
        assert_eq!(cache.max_models, DEFAULT_MAX_MODELS);
        assert_eq!(cache.ttl, DEFAULT_TTL);
        assert!(!config.loader.ignore_integrity_check);
        assert!(config.models.is_empty());
    }

    #[test]
    fn non_positive_values_fall_back_to_defaults() {
        let toml = r#"
            [cache]
            max_models = 0
            ttl_secs = -5
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let cache = config.cache_config();
        assert_eq!(cache.max_models, 3);
        assert_eq!(cache.ttl, Duration::from_secs(300));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            [cache]
            max_models = 2
            ttl_secs = 600
            reserved_slots = 2
            sweep_interval_secs = 5

            [loader]
            ignore_integrity_check = true

            [models."qwen/qwen3-8b"]
            model_path = "/models/qwen3-8b.gguf"
            parallel_sequences = 4
            incremental_cache = true
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        let cache = config.cache_config();
        assert_eq!(cache.max_models, 2);
        assert_eq!(cache.ttl, Duration::from_secs(600));
        assert_eq!(cache.reserved_slots, 2);
        assert_eq!(cache.sweep_interval, Duration::from_secs(5));
        assert!(config.loader.ignore_integrity_check);

        let catalog = config.catalog();
        assert!(catalog.contains("qwen/qwen3-8b"));
        let model = &config.models["qwen/qwen3-8b"];
        assert_eq!(model.config.parallel_sequences, Some(4));
        assert!(model.config.uses_incremental_cache());
    }

    #[test]
    fn config_not_found_returns_error() {
        let result = Config::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Config file not found"));
    }
}
