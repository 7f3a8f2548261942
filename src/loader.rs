//! Loader trait: the seam between the cache and the inference backend.
//!
//! The cache never knows how a model is loaded. It hands a [`LoadRequest`] to
//! a [`Loader`], owns whatever handle comes back, and gives the handle back to
//! the same loader for teardown once nothing is streaming from it.
//!
//! # Example
//!
//! ```ignore
//! struct LlamaLoader { /* backend state */ }
//!
//! #[async_trait]
//! impl Loader for LlamaLoader {
//!     type Handle = LlamaModel;
//!
//!     fn name(&self) -> &str { "llama" }
//!
//!     async fn build(&self, request: &LoadRequest) -> Result<LlamaModel> {
//!         request.progress.report("mapping model file");
//!         // ... load weights, allocate KV cache
//!     }
//!
//!     async fn teardown(&self, model: &LlamaModel) -> Result<()> {
//!         model.free_context()
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::Result;
use crate::types::{ChatTemplate, ModelConfig, ModelInfo};

/// Shared, type-erased loader producing handles of type `H`.
pub type SharedLoader<H> = Arc<dyn Loader<Handle = H>>;

/// Builds and destroys live model instances.
///
/// `build` may take minutes and gigabytes; the cache calls it outside of any
/// lock and at most once concurrently per cache key. `teardown` is called
/// exactly once per successfully built handle, never while a stream holds it.
#[async_trait]
pub trait Loader: Send + Sync {
    /// The live instance produced by this loader.
    type Handle: Send + Sync + 'static;

    /// Loader name for logging/debugging.
    fn name(&self) -> &str;

    /// Construct a live instance for `request`.
    async fn build(&self, request: &LoadRequest) -> Result<Self::Handle>;

    /// Release everything `handle` holds (memory, VRAM, worker threads).
    async fn teardown(&self, handle: &Self::Handle) -> Result<()>;

    /// Describe a built handle for status reporting.
    ///
    /// Default: model info with only the id filled in.
    fn describe(&self, _handle: &Self::Handle, request: &LoadRequest) -> ModelInfo {
        ModelInfo::new(request.model_id.clone())
    }
}

/// Progress sink for long-running builds.
///
/// Every report is logged at debug level; an optional callback lets a caller
/// forward messages elsewhere (e.g. to a streaming "pulling model" response).
#[derive(Clone, Default)]
pub struct Progress {
    sink: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl Progress {
    /// Progress that only logs.
    pub fn none() -> Self {
        Self::default()
    }

    /// Progress that also forwards each message to `sink`.
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Some(Arc::new(sink)),
        }
    }

    pub fn report(&self, message: &str) {
        debug!(message, "load progress");
        if let Some(sink) = &self.sink {
            sink(message);
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Everything a loader needs to build one instance.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    /// Model identifier, without session scope.
    pub model_id: String,
    /// Effective configuration.
    pub config: ModelConfig,
    pub template: Option<ChatTemplate>,
    /// Skip model file checksum verification. Read by loaders only.
    pub ignore_integrity_check: bool,
    pub progress: Progress,
}

impl LoadRequest {
    pub fn new(model_id: impl Into<String>, config: ModelConfig) -> Self {
        Self {
            model_id: model_id.into(),
            config,
            template: None,
            ignore_integrity_check: false,
            progress: Progress::none(),
        }
    }

    pub fn template(mut self, template: ChatTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn ignore_integrity_check(mut self, ignore: bool) -> Self {
        self.ignore_integrity_check = ignore;
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = progress;
        self
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn progress_forwards_to_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let progress = Progress::new(move |msg| sink.lock().unwrap().push(msg.to_string()));

        progress.report("downloading");
        progress.clone().report("mapping");

        assert_eq!(*seen.lock().unwrap(), vec!["downloading", "mapping"]);
    }

    #[test]
    fn progress_none_is_silent() {
        Progress::none().report("nobody listens");
        assert!(format!("{:?}", Progress::none()).contains("false"));
    }

    #[test]
    fn load_request_builder() {
        let request = LoadRequest::new("m", ModelConfig::new().context_window(2048))
            .template(ChatTemplate::named("chatml"))
            .ignore_integrity_check(true);
        assert_eq!(request.model_id, "m");
        assert_eq!(request.config.context_window, Some(2048));
        assert_eq!(request.template.unwrap().name, "chatml");
        assert!(request.ignore_integrity_check);
    }
}
