//! Model information and status types.
//!
//! Types for describing resident model instances and reporting their runtime
//! status to management endpoints.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Static description of a loaded model, supplied by the loader.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier (e.g., "Qwen/Qwen3-8B-GGUF").
    pub id: String,
    /// Publisher, taken from the id prefix when not supplied.
    pub owner: Option<String>,
    /// Architecture family (e.g., "qwen3", "llama").
    pub family: Option<String>,
    /// Model file size in bytes.
    pub size_bytes: u64,
    /// Estimated total VRAM footprint in bytes.
    pub vram_total_bytes: u64,
    /// Estimated VRAM per sequence slot in bytes.
    pub slot_memory_bytes: u64,
}

impl ModelInfo {
    /// Create model info for `id`; `owner` is derived from an
    /// `owner/name` style id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let owner = id
            .split_once('/')
            .map(|(owner, _)| owner.to_string())
            .filter(|o| !o.is_empty());
        Self {
            id,
            owner,
            ..Default::default()
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_size(mut self, bytes: u64) -> Self {
        self.size_bytes = bytes;
        self
    }

    /// Set the VRAM estimates: total footprint and per-slot cost.
    pub fn with_vram(mut self, total_bytes: u64, slot_bytes: u64) -> Self {
        self.vram_total_bytes = total_bytes;
        self.slot_memory_bytes = slot_bytes;
        self
    }
}

/// Lifecycle state of a cache entry.
///
/// `Building` and `Failed` are never stored on an entry: a build in progress
/// is a latch in the instance table, and a failed build leaves nothing
/// behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadState {
    Building,
    Ready,
    Failed,
    Removing,
    Destroyed,
}

impl LoadState {
    /// Whether new callers may be handed this entry.
    pub fn is_servable(&self) -> bool {
        matches!(self, Self::Ready)
    }
}

/// Point-in-time snapshot of one resident entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelStatus {
    /// Display form of the cache key.
    pub key: String,
    /// Model identifier without session scope.
    pub id: String,
    /// Session scope, for ephemeral entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    pub owner: Option<String>,
    pub family: Option<String>,
    pub size_bytes: u64,
    pub vram_total_bytes: u64,
    pub slot_memory_bytes: u64,
    /// Wall-clock expiry.
    pub expires_at: SystemTime,
    /// Seconds until expiry (zero once expired).
    pub expires_in_secs: u64,
    pub active_streams: usize,
    pub state: LoadState,
    /// Per-cache instance number; changes whenever the model is reloaded.
    pub instance_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_info_owner_from_id() {
        let info = ModelInfo::new("Qwen/Qwen3-8B-GGUF");
        assert_eq!(info.owner.as_deref(), Some("Qwen"));

        let bare = ModelInfo::new("llama3");
        assert!(bare.owner.is_none());
    }

    #[test]
    fn model_info_builder() {
        let info = ModelInfo::new("test-model")
            .with_owner("acme")
            .with_family("llama")
            .with_size(4_000)
            .with_vram(6_000, 500);

        assert_eq!(info.owner.as_deref(), Some("acme"));
        assert_eq!(info.family.as_deref(), Some("llama"));
        assert_eq!(info.size_bytes, 4_000);
        assert_eq!(info.vram_total_bytes, 6_000);
        assert_eq!(info.slot_memory_bytes, 500);
    }

    #[test]
    fn load_state_servable() {
        assert!(LoadState::Ready.is_servable());
        assert!(!LoadState::Building.is_servable());
        assert!(!LoadState::Removing.is_servable());
        assert!(!LoadState::Destroyed.is_servable());
    }

    #[test]
    fn load_state_serializes_lowercase() {
        let json = serde_json::to_string(&LoadState::Removing).unwrap();
        assert_eq!(json, "\"removing\"");
    }
}
