//! Cache keys.
//!
//! A [`CacheKey`] identifies one desired live instance: the model id, an
//! optional session scope, and a fingerprint of the load-relevant part of the
//! effective [`ModelConfig`]. Sampling defaults are deliberately left out of
//! the fingerprint.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::types::ModelConfig;

/// Identity of a desired live model instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    model_id: String,
    session: Option<String>,
    fingerprint: u64,
}

impl CacheKey {
    /// Key for the shared pool.
    pub fn new(model_id: impl Into<String>, config: &ModelConfig) -> Self {
        Self {
            model_id: model_id.into(),
            session: None,
            fingerprint: fingerprint(config),
        }
    }

    /// Key scoped to `session`. Never equal to a shared-pool key, nor to the
    /// same model in a different session.
    pub fn scoped(
        model_id: impl Into<String>,
        session: impl Into<String>,
        config: &ModelConfig,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            session: Some(session.into()),
            fingerprint: fingerprint(config),
        }
    }

    /// Model identifier, without the session scope.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn session(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Model id with the session appended (`model/session`), as shown to
    /// operators.
    pub fn scoped_id(&self) -> String {
        match &self.session {
            Some(session) => format!("{}/{}", self.model_id, session),
            None => self.model_id.clone(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{:016x}", self.scoped_id(), self.fingerprint)
    }
}

/// Hash the load-relevant fields of `config`.
///
/// Uses `DefaultHasher` (SipHash with fixed keys), which is deterministic
/// within a process lifetime; keys are never persisted.
fn fingerprint(config: &ModelConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    config.model_path.hash(&mut hasher);
    config.context_window.hash(&mut hasher);
    config.batch_size.hash(&mut hasher);
    config.ubatch_size.hash(&mut hasher);
    config.cache_type_k.hash(&mut hasher);
    config.cache_type_v.hash(&mut hasher);
    config.canonical_device().hash(&mut hasher);
    config.gpu_layers.hash(&mut hasher);
    config.flash_attention.hash(&mut hasher);
    config.parallel_sequences.hash(&mut hasher);
    config.uses_incremental_cache().hash(&mut hasher);
    hasher.finish()
}
