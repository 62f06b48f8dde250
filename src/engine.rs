//! Engine: the owned dependency graph behind the server
//!
//! One `Engine` holds the registry, loader factory, dispatcher, KV cache and
//! warmup service, and implements the lifecycle rules that span them
//! (auto-warmup after load, cache and warmup cleanup on unload, load on first
//! request).

use dashmap::DashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ModelLoadError;
use crate::integrations::{
    DirectorySource, ModelSource, OptimizationHint, SysinfoTelemetry, TelemetryProvider,
};
use crate::models::{LoadedModel, ModelDescriptor, ModelRegistry};
use crate::runtime::device::DevicePreference;
use crate::runtime::loaders::default_loaders;
use crate::runtime::{
    InferenceDispatcher, KvCacheManager, LoadOptions, LoadOutcome, ModelLoader,
    ModelLoaderFactory, WarmupMode, WarmupService,
};

/// Parameters of an explicit load
#[derive(Debug, Clone, Default)]
pub struct ModelLoadRequest {
    pub model_id: String,
    pub path: Option<PathBuf>,
    pub options: LoadOptions,
    /// Overrides `warmup.auto_warmup`
    pub auto_warmup: Option<bool>,
    pub warmup_prompts: Option<usize>,
}

impl ModelLoadRequest {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }
}

pub struct EngineBuilder {
    config: ServerConfig,
    loaders: Vec<Arc<dyn ModelLoader>>,
    source: Option<Arc<dyn ModelSource>>,
    telemetry: Option<Arc<dyn TelemetryProvider>>,
    system_telemetry: bool,
}

impl EngineBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            loaders: Vec::new(),
            source: None,
            telemetry: None,
            system_telemetry: true,
        }
    }

    /// Extra loader, tried before the built-in ones
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loaders.push(loader);
        self
    }

    pub fn with_source(mut self, source: Arc<dyn ModelSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryProvider>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Run without any hardware telemetry
    pub fn without_telemetry(mut self) -> Self {
        self.telemetry = None;
        self.system_telemetry = false;
        self
    }

    pub fn build(self) -> Engine {
        let config = self.config;
        let registry = Arc::new(ModelRegistry::new());
        let source = self
            .source
            .unwrap_or_else(|| Arc::new(DirectorySource::new(&config.models_dir)));
        let telemetry = match self.telemetry {
            Some(t) => Some(t),
            None if self.system_telemetry => {
                Some(Arc::new(SysinfoTelemetry::new()) as Arc<dyn TelemetryProvider>)
            }
            None => None,
        };

        let mut loaders = self.loaders;
        loaders.extend(default_loaders(DevicePreference::Auto));
        let mut factory = ModelLoaderFactory::new(Arc::clone(&registry), source)
            .with_loaders(loaders)
            .with_default_context_length(config.default_context_length);
        if let Some(t) = &telemetry {
            factory = factory.with_telemetry(Arc::clone(t));
        }

        let kv_cache = Arc::new(KvCacheManager::new(config.kv_cache.clone()));
        let dispatcher = Arc::new(InferenceDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&kv_cache),
        ));
        let mut warmup = WarmupService::new(Arc::clone(&dispatcher))
            .with_max_tokens(config.warmup.max_tokens);
        if let Some(path) = &config.warmup.history_file {
            warmup = warmup.with_history_file(path);
        }

        info!(
            "Engine ready: loaders [{}], models dir {}",
            factory.loader_names().join(", "),
            config.models_dir.display()
        );
        Engine {
            config,
            registry,
            factory: Arc::new(factory),
            dispatcher,
            kv_cache,
            warmup: Arc::new(warmup),
            telemetry,
            seen: DashSet::new(),
        }
    }
}

pub struct Engine {
    config: ServerConfig,
    registry: Arc<ModelRegistry>,
    factory: Arc<ModelLoaderFactory>,
    dispatcher: Arc<InferenceDispatcher>,
    kv_cache: Arc<KvCacheManager>,
    warmup: Arc<WarmupService>,
    telemetry: Option<Arc<dyn TelemetryProvider>>,
    /// Models that already served a request since they were loaded
    seen: DashSet<String>,
}

impl Engine {
    pub fn new(config: ServerConfig) -> Self {
        EngineBuilder::new(config).build()
    }

    pub fn builder(config: ServerConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<ModelLoaderFactory> {
        &self.factory
    }

    pub fn dispatcher(&self) -> &Arc<InferenceDispatcher> {
        &self.dispatcher
    }

    pub fn kv_cache(&self) -> &Arc<KvCacheManager> {
        &self.kv_cache
    }

    pub fn warmup(&self) -> &Arc<WarmupService> {
        &self.warmup
    }

    pub fn telemetry(&self) -> Option<&Arc<dyn TelemetryProvider>> {
        self.telemetry.as_ref()
    }

    pub fn optimization_hint(&self) -> OptimizationHint {
        self.telemetry
            .as_ref()
            .map(|t| t.hint())
            .unwrap_or_default()
    }

    /// Prompt count used when a warmup request does not name one
    pub fn default_warmup_prompts(&self) -> usize {
        self.config
            .warmup
            .num_prompts
            .unwrap_or_else(|| self.optimization_hint().warmup_prompts())
    }

    pub async fn load_model(&self, request: ModelLoadRequest) -> Result<LoadOutcome, ModelLoadError> {
        let outcome = self
            .factory
            .load(&request.model_id, request.path, request.options)
            .await?;

        let auto_warmup = request.auto_warmup.unwrap_or(self.config.warmup.auto_warmup);
        if outcome.is_new() && auto_warmup {
            if let Some(model) = self.registry.get(&request.model_id) {
                let prompts = request
                    .warmup_prompts
                    .unwrap_or_else(|| self.default_warmup_prompts());
                self.warmup.warmup(model, prompts, WarmupMode::Async).await;
            }
        }
        Ok(outcome)
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<ModelDescriptor, ModelLoadError> {
        let descriptor = self.factory.unload(model_id).await?;
        let cleared = self.kv_cache.clear_model(model_id);
        self.warmup.clear_status(model_id);
        self.seen.remove(model_id);
        debug!("Cleared {cleared} KV entries of {model_id}");
        Ok(descriptor)
    }

    /// The loaded model, loading it from the models directory first when
    /// `auto_load_on_request` allows it.
    pub async fn ensure_loaded(&self, model_id: &str) -> Result<Arc<LoadedModel>, ModelLoadError> {
        if let Some(model) = self.registry.get(model_id) {
            return Ok(model);
        }
        if !self.config.auto_load_on_request || !self.factory.resolves(model_id) {
            return Err(ModelLoadError::NotFound(model_id.to_owned()));
        }
        info!("Auto-loading {model_id} for an incoming request");
        self.load_model(ModelLoadRequest::new(model_id)).await?;
        self.registry
            .get(model_id)
            .ok_or_else(|| ModelLoadError::NotFound(model_id.to_owned()))
    }

    /// Called for every real request; the first one against a cold model
    /// starts a background warmup when `warm_on_first_use` is set.
    pub async fn note_request(&self, model: &Arc<LoadedModel>) {
        if !self.seen.insert(model.id().to_owned()) || !self.config.warmup.warm_on_first_use {
            return;
        }
        if self.warmup.is_warm(model.id()) || self.warmup.is_running(model.id()) {
            return;
        }
        self.warmup
            .warmup(
                Arc::clone(model),
                self.default_warmup_prompts(),
                WarmupMode::Async,
            )
            .await;
    }

    /// Load `preload_models`; failures are logged and skipped
    pub async fn preload(&self) {
        for model_id in &self.config.preload_models {
            match self.load_model(ModelLoadRequest::new(model_id)).await {
                Ok(outcome) => info!("Preloaded {} ({})", model_id, outcome.status()),
                Err(e) => warn!("Failed to preload '{}': {}", model_id, e),
            }
        }
    }

    /// Stop background warmups and unload every model
    pub async fn shutdown(&self) {
        self.warmup.shutdown().await;
        for model_id in self.registry.ids() {
            if let Err(e) = self.unload_model(&model_id).await {
                warn!("Failed to unload {} during shutdown: {}", model_id, e);
            }
        }
        info!("Engine shut down");
    }
}
