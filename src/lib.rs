//! Lodestar: a local OpenAI-compatible inference server.
//!
//! The core is four cooperating services:
//!
//! - [`runtime::ModelLoaderFactory`] resolves a model reference, picks a
//!   format-specific loader and registers the resulting handle.
//! - [`runtime::InferenceDispatcher`] runs buffered and streamed generation
//!   against any loaded model through one interface.
//! - [`runtime::KvCacheManager`] keeps per-conversation attention state under
//!   a memory budget with LRU eviction.
//! - [`runtime::WarmupService`] runs synthetic prompts so first real
//!   requests do not pay kernel compilation costs.
//!
//! [`engine::Engine`] wires them together; [`server`] exposes them over HTTP.

pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod integrations;
pub mod models;
pub mod runtime;
pub mod server;

pub use config::ServerConfig;
pub use engine::{Engine, EngineBuilder, ModelLoadRequest};
pub use error::{CacheError, InferenceError, ModelLoadError, RetrievalError};
pub use runtime::{GenerationConfig, GenerationResult, PromptInput};
