//! Effective model load configuration.
//!
//! [`ModelConfig`] is what a catalog resolves for a model id and what the
//! loader receives. Every field is optional: `None` means "loader default".
//! Only the load-relevant fields feed the cache fingerprint; see
//! [`CacheKey`](crate::cache::CacheKey).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// KV cache element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    F32,
    F16,
    Bf16,
    Q8_0,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Iq4Nl,
}

impl CacheType {
    /// Canonical lowercase name (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::Q8_0 => "q8_0",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Iq4Nl => "iq4_nl",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Default sampling parameters.
///
/// Carried alongside the load configuration so the inference layer can pick
/// them up, but never part of the cache fingerprint: two requests differing
/// only in temperature share one loaded instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl SamplingDefaults {
    fn merge(&self, overrides: &SamplingDefaults) -> SamplingDefaults {
        SamplingDefaults {
            temperature: overrides.temperature.or(self.temperature),
            top_p: overrides.top_p.or(self.top_p),
            top_k: overrides.top_k.or(self.top_k),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
        }
    }
}

/// Load configuration for one model instance.
///
/// ```rust
/// # use huginn::{CacheType, ModelConfig};
/// let config = ModelConfig::new()
///     .context_window(8192)
///     .cache_types(CacheType::Q8_0, CacheType::Q8_0)
///     .parallel_sequences(4);
/// assert_eq!(config.context_window, Some(8192));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model file on disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    /// Context window in tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u32>,
    /// Logical batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    /// Physical micro-batch size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ubatch_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_type_k: Option<CacheType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_type_v: Option<CacheType>,
    /// Device name, e.g. "cpu", "cuda0", "metal".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Number of layers offloaded to the GPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_layers: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_attention: Option<bool>,
    /// Maximum concurrent sequences (streams) the instance is built for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_sequences: Option<u32>,
    /// Incremental prompt cache mode. Consumes reserved sequence slots,
    /// see [`AdmissionPolicy`](crate::cache::AdmissionPolicy).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incremental_cache: Option<bool>,
    /// Sampling defaults (not load-relevant).
    #[serde(default)]
    pub sampling: SamplingDefaults,
}

impl ModelConfig {
    /// Create an empty config (all loader defaults).
    pub fn new() -> Self {
        Self::default()
    }

    pub fn model_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.model_path = Some(path.into());
        self
    }

    pub fn context_window(mut self, tokens: u32) -> Self {
        self.context_window = Some(tokens);
        self
    }

    pub fn batch_sizes(mut self, batch: u32, ubatch: u32) -> Self {
        self.batch_size = Some(batch);
        self.ubatch_size = Some(ubatch);
        self
    }

    pub fn cache_types(mut self, k: CacheType, v: CacheType) -> Self {
        self.cache_type_k = Some(k);
        self.cache_type_v = Some(v);
        self
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn gpu_layers(mut self, layers: i32) -> Self {
        self.gpu_layers = Some(layers);
        self
    }

    pub fn flash_attention(mut self, enabled: bool) -> Self {
        self.flash_attention = Some(enabled);
        self
    }

    pub fn parallel_sequences(mut self, n: u32) -> Self {
        self.parallel_sequences = Some(n);
        self
    }

    pub fn incremental_cache(mut self, enabled: bool) -> Self {
        self.incremental_cache = Some(enabled);
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling.temperature = Some(temperature);
        self
    }

    /// Whether incremental cache mode is switched on.
    pub fn uses_incremental_cache(&self) -> bool {
        self.incremental_cache.unwrap_or(false)
    }

    /// Device name trimmed and lower-cased, so "CUDA0 " and "cuda0" are the
    /// same device.
    pub fn canonical_device(&self) -> Option<String> {
        self.device
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_ascii_lowercase)
    }

    /// Layer `overrides` on top of `self`. Fields set in `overrides` win.
    pub fn merge(&self, overrides: &ModelConfig) -> ModelConfig {
        ModelConfig {
            model_path: overrides
                .model_path
                .clone()
                .or_else(|| self.model_path.clone()),
            context_window: overrides.context_window.or(self.context_window),
            batch_size: overrides.batch_size.or(self.batch_size),
            ubatch_size: overrides.ubatch_size.or(self.ubatch_size),
            cache_type_k: overrides.cache_type_k.or(self.cache_type_k),
            cache_type_v: overrides.cache_type_v.or(self.cache_type_v),
            device: overrides.device.clone().or_else(|| self.device.clone()),
            gpu_layers: overrides.gpu_layers.or(self.gpu_layers),
            flash_attention: overrides.flash_attention.or(self.flash_attention),
            parallel_sequences: overrides.parallel_sequences.or(self.parallel_sequences),
            incremental_cache: overrides.incremental_cache.or(self.incremental_cache),
            sampling: self.sampling.merge(&overrides.sampling),
        }
    }
}

/// Chat template used to render messages for a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTemplate {
    /// Template name, e.g. "chatml".
    pub name: String,
    /// Template source, when not built into the loader.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl ChatTemplate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_overrides() {
        let base = ModelConfig::new()
            .model_path("/models/a.gguf")
            .context_window(4096)
            .device("cpu")
            .temperature(0.7);
        let overrides = ModelConfig::new().context_window(8192);

        let merged = base.merge(&overrides);
        assert_eq!(merged.context_window, Some(8192));
        assert_eq!(merged.model_path, Some(PathBuf::from("/models/a.gguf")));
        assert_eq!(merged.device.as_deref(), Some("cpu"));
        assert_eq!(merged.sampling.temperature, Some(0.7));
    }

    #[test]
    fn canonical_device_normalizes() {
        let config = ModelConfig::new().device("  CUDA0 ");
        assert_eq!(config.canonical_device().as_deref(), Some("cuda0"));
        assert_eq!(ModelConfig::new().device("  ").canonical_device(), None);
    }

    #[test]
    fn cache_type_serde_names() {
        let json = serde_json::to_string(&CacheType::Q8_0).unwrap();
        assert_eq!(json, "\"q8_0\"");
        let parsed: CacheType = serde_json::from_str("\"iq4_nl\"").unwrap();
        assert_eq!(parsed, CacheType::Iq4Nl);
        assert_eq!(parsed.as_str(), "iq4_nl");
    }

    #[test]
    fn incremental_cache_defaults_off() {
        assert!(!ModelConfig::new().uses_incremental_cache());
        assert!(ModelConfig::new().incremental_cache(true).uses_incremental_cache());
    }
}
