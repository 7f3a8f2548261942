//! Public types for the Huginn API.

mod config;
mod model;

pub use config::{CacheType, ChatTemplate, ModelConfig, SamplingDefaults};
pub use model::{LoadState, ModelInfo, ModelStatus};
