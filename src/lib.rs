//! Huginn - model instance cache and admission control for local inference
//!
//! This crate keeps a bounded set of live model instances resident for a
//! local-inference server. Concurrent requests for the same model share one
//! load, instances stay alive while anything streams from them, idle ones
//! expire on a sliding TTL, and when every slot is busy new models are
//! rejected with a retryable [`HuginnError::Busy`] instead of queueing.
//!
//! The backend is pluggable through the [`Loader`] trait; the crate never
//! loads weights itself.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use huginn::{LoadRequest, Loader, ModelConfig, ModelHost, StaticCatalog};
//!
//! struct EchoLoader;
//!
//! #[async_trait]
//! impl Loader for EchoLoader {
//!     type Handle = String;
//!
//!     fn name(&self) -> &str {
//!         "echo"
//!     }
//!
//!     async fn build(&self, request: &LoadRequest) -> huginn::Result<String> {
//!         Ok(request.model_id.clone())
//!     }
//!
//!     async fn teardown(&self, _handle: &String) -> huginn::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> huginn::Result<()> {
//!     let host = ModelHost::<String>::builder()
//!         .loader(Arc::new(EchoLoader))
//!         .catalog(StaticCatalog::new().with_model("qwen/qwen3-8b", ModelConfig::new()))
//!         .build()?;
//!     let _evictor = host.spawn_evictor();
//!
//!     let lease = host.acquire("qwen/qwen3-8b", None).await?;
//!     println!("streaming from {}", *lease);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod loader;
pub mod stream;
pub mod telemetry;
pub mod types;

// Re-export main types at crate root
pub use cache::{
    AdmissionPolicy, CacheConfig, CacheKey, EvictionReason, EvictorHandle, Instance,
    InstanceCache, Lease, SweepReport,
};
pub use catalog::{CatalogEntry, Cataloger, CachingCatalog, StaticCatalog};
pub use config::Config;
pub use error::{HuginnError, Result};
pub use gateway::{HostBuilder, ModelHost};
pub use loader::{LoadRequest, Loader, Progress, SharedLoader};
pub use stream::{DEFAULT_STREAM_BUFFER, LeasedStream, bounded_stream};

// Re-export all types
pub use types::{
    CacheType, ChatTemplate, LoadState, ModelConfig, ModelInfo, ModelStatus, SamplingDefaults,
};
