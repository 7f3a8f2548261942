//! Huginn error types

/// Huginn error types
///
/// Errors are `Clone` so that a single failed build can be handed, unchanged,
/// to every caller that was waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HuginnError {
    // Admission errors
    /// Every slot is occupied by an entry with active streams, or the
    /// requested entry has no free sequence. Retry later.
    #[error("server busy for model '{model}': {reason}")]
    Busy { model: String, reason: String },

    // Build errors
    #[error("failed to load model '{model}': {message}")]
    Load { model: String, message: String },

    /// The build task ended without publishing a result (it panicked or the
    /// runtime shut down underneath it).
    #[error("build for model '{0}' was aborted before completing")]
    BuildAborted(String),

    #[error("teardown of model '{model}' failed: {message}")]
    Teardown { model: String, message: String },

    // Lookup errors
    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Data errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

impl HuginnError {
    /// Build a [`HuginnError::Load`] for `model`.
    pub fn load(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Load {
            model: model.into(),
            message: message.into(),
        }
    }

    /// Build a [`HuginnError::Busy`] for `model`.
    pub fn busy(model: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Busy {
            model: model.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is an admission rejection.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy { .. })
    }

    /// Whether the same request may succeed if simply retried later.
    ///
    /// Load errors count as retryable: failed builds are never cached, so a
    /// transient condition (e.g. memory pressure) clears on the next attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Busy { .. } | Self::Load { .. } | Self::BuildAborted(_)
        )
    }
}

impl From<std::io::Error> for HuginnError {
    fn from(err: std::io::Error) -> Self {
        HuginnError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for HuginnError {
    fn from(err: serde_json::Error) -> Self {
        HuginnError::Json(err.to_string())
    }
}

impl From<toml::de::Error> for HuginnError {
    fn from(err: toml::de::Error) -> Self {
        HuginnError::Configuration(err.to_string())
    }
}

/// Result type alias for Huginn operations
pub type Result<T> = std::result::Result<T, HuginnError>;
