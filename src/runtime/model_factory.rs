//! Model loader factory
//!
//! Resolves a model reference to a path, picks the first loader that claims
//! it, runs the (slow, blocking) native load off the async workers and
//! registers the handle. Loads of the same id are serialized by a per-id
//! async mutex, so two concurrent requests produce exactly one native load;
//! loads of different ids never wait on each other.

use chrono::Utc;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use super::device::DevicePreference;
use super::loaders::detect::weight_bytes;
use super::loaders::{default_loaders, probe_descriptor};
use super::{LoadOptions, LoadRequest, ModelLoader};
use crate::error::ModelLoadError;
use crate::integrations::{ModelSource, TelemetryProvider};
use crate::models::{LoadedModel, ModelDescriptor, ModelFormat, ModelRegistry};

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Result of a successful [`ModelLoaderFactory::load`]
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(ModelDescriptor),
    /// Another caller loaded (or was loading) the same id first
    AlreadyLoaded(ModelDescriptor),
}

impl LoadOutcome {
    pub fn descriptor(&self) -> &ModelDescriptor {
        match self {
            LoadOutcome::Loaded(d) | LoadOutcome::AlreadyLoaded(d) => d,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }

    /// Wire status: `success` or `already_loaded`
    pub fn status(&self) -> &'static str {
        match self {
            LoadOutcome::Loaded(_) => "success",
            LoadOutcome::AlreadyLoaded(_) => "already_loaded",
        }
    }
}

pub struct ModelLoaderFactory {
    loaders: Vec<Arc<dyn ModelLoader>>,
    registry: Arc<ModelRegistry>,
    source: Arc<dyn ModelSource>,
    telemetry: Option<Arc<dyn TelemetryProvider>>,
    load_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    default_context_length: usize,
}

impl ModelLoaderFactory {
    pub fn new(registry: Arc<ModelRegistry>, source: Arc<dyn ModelSource>) -> Self {
        Self {
            loaders: default_loaders(DevicePreference::Auto),
            registry,
            source,
            telemetry: None,
            load_locks: DashMap::new(),
            default_context_length: 4096,
        }
    }

    /// Try `loader` before every loader already configured.
    pub fn with_loader(mut self, loader: Arc<dyn ModelLoader>) -> Self {
        self.loaders.insert(0, loader);
        self
    }

    pub fn with_loaders(mut self, loaders: Vec<Arc<dyn ModelLoader>>) -> Self {
        self.loaders = loaders;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryProvider>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_default_context_length(mut self, context_length: usize) -> Self {
        self.default_context_length = context_length;
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn loader_names(&self) -> Vec<&'static str> {
        self.loaders.iter().map(|l| l.name()).collect()
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.registry.contains(model_id)
    }

    /// Whether `model_id` could be loaded without an explicit path
    pub fn resolves(&self, model_id: &str) -> bool {
        self.source.resolve(model_id).is_some()
    }

    fn lock_for(&self, model_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(
            self.load_locks
                .entry(model_id.to_owned())
                .or_default()
                .value(),
        )
    }

    fn release_lock(&self, model_id: &str, lock: Arc<AsyncMutex<()>>) {
        drop(lock);
        self.load_locks
            .remove_if(model_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Load `model_id` from `path`, or from wherever the model source
    /// resolves it. Atomic: on error the registry is unchanged.
    #[instrument(skip(self, path, options), fields(model_id = %model_id))]
    pub async fn load(
        &self,
        model_id: &str,
        path: Option<PathBuf>,
        options: LoadOptions,
    ) -> Result<LoadOutcome, ModelLoadError> {
        if let Some(existing) = self.registry.get(model_id) {
            return Ok(LoadOutcome::AlreadyLoaded(existing.descriptor.clone()));
        }

        let lock = self.lock_for(model_id);
        let result = {
            let _guard = lock.lock().await;
            self.load_serialized(model_id, path, options).await
        };
        self.release_lock(model_id, lock);
        result
    }

    async fn load_serialized(
        &self,
        model_id: &str,
        path: Option<PathBuf>,
        options: LoadOptions,
    ) -> Result<LoadOutcome, ModelLoadError> {
        if let Some(existing) = self.registry.get(model_id) {
            return Ok(LoadOutcome::AlreadyLoaded(existing.descriptor.clone()));
        }

        let path = path
            .or_else(|| self.source.resolve(model_id))
            .filter(|p| p.exists())
            .ok_or_else(|| ModelLoadError::NotFound(model_id.to_owned()))?;

        let loader = self
            .loaders
            .iter()
            .find(|l| l.can_load(&path))
            .cloned()
            .ok_or_else(|| {
                ModelLoadError::UnsupportedFormat(format!(
                    "no loader claims {}",
                    path.display()
                ))
            })?;

        if loader.format() != ModelFormat::Unknown {
            self.check_memory(model_id, &path)?;
        }

        info!("Loading {} with the {} loader", path.display(), loader.name());
        let started = Instant::now();
        let request = LoadRequest {
            model_id: model_id.to_owned(),
            path: path.clone(),
            options,
            default_context_length: self.default_context_length,
        };
        let native_loader = Arc::clone(&loader);
        let loaded = tokio::task::spawn_blocking(move || native_loader.load(&request))
            .await
            .map_err(|e| ModelLoadError::Internal(format!("loader task failed: {e}")))??;

        let mut descriptor = loaded.descriptor;
        descriptor.id = model_id.to_owned();
        descriptor.loaded = true;
        descriptor.load_time = Some(Utc::now());
        if descriptor.memory_usage.is_none() {
            descriptor.memory_usage = Some(weight_bytes(&path)).filter(|b| *b > 0);
        }

        let inserted = self.registry.insert(LoadedModel {
            descriptor: descriptor.clone(),
            backend: Arc::from(loaded.backend),
            loader,
        });
        if !inserted {
            // Only reachable if something bypassed the per-id lock.
            warn!("{model_id} was registered concurrently; keeping the existing handle");
            return match self.registry.get(model_id) {
                Some(existing) => Ok(LoadOutcome::AlreadyLoaded(existing.descriptor.clone())),
                None => Err(ModelLoadError::Internal(format!(
                    "{model_id} vanished during registration"
                ))),
            };
        }

        info!(
            "Loaded {} ({}) in {:.2}s",
            model_id,
            descriptor.format,
            started.elapsed().as_secs_f64()
        );
        Ok(LoadOutcome::Loaded(descriptor))
    }

    fn check_memory(&self, model_id: &str, path: &Path) -> Result<(), ModelLoadError> {
        let Some(snapshot) = self.telemetry.as_ref().and_then(|t| t.snapshot()) else {
            return Ok(());
        };
        let required = weight_bytes(path);
        if required > snapshot.available_memory_bytes {
            return Err(ModelLoadError::InsufficientMemory {
                model_id: model_id.to_owned(),
                required_mb: required.div_ceil(BYTES_PER_MB),
                available_mb: snapshot.available_memory_bytes / BYTES_PER_MB,
            });
        }
        Ok(())
    }

    /// Release native resources and remove the handle. Requests already
    /// holding the handle finish first; the release waits for them.
    #[instrument(skip(self), fields(model_id = %model_id))]
    pub async fn unload(&self, model_id: &str) -> Result<ModelDescriptor, ModelLoadError> {
        let lock = self.lock_for(model_id);
        let result = {
            let _guard = lock.lock().await;
            match self.registry.remove(model_id) {
                None => Err(ModelLoadError::NotFound(model_id.to_owned())),
                Some(model) => {
                    let descriptor = model.descriptor.clone();
                    tokio::task::spawn_blocking(move || {
                        model.loader.unload(model.backend.as_ref())
                    })
                    .await
                    .map_err(|e| ModelLoadError::Internal(format!("unload task failed: {e}")))?;
                    info!("Unloaded {model_id}");
                    Ok(descriptor)
                }
            }
        };
        self.release_lock(model_id, lock);
        result
    }

    /// Lazily scan the model source. Every call starts a fresh scan; loaded
    /// models report their live descriptor.
    pub fn list_available(&self) -> ModelScan<'_> {
        ModelScan {
            candidates: self.source.candidates(),
            registry: &self.registry,
            default_context_length: self.default_context_length,
        }
    }

    /// Loaded models first (including ones loaded by explicit path), then
    /// discovered models that are not loaded.
    pub fn catalog(&self) -> Vec<ModelDescriptor> {
        let mut models = self.registry.descriptors();
        let mut discovered: Vec<ModelDescriptor> = self
            .list_available()
            .filter(|d| !d.loaded)
            .collect();
        discovered.sort_by(|a, b| a.id.cmp(&b.id));
        discovered.dedup_by(|a, b| a.id == b.id);
        models.extend(discovered);
        models
    }
}

/// Lazy, finite scan over a model source
pub struct ModelScan<'a> {
    candidates: Box<dyn Iterator<Item = (String, PathBuf)> + Send + 'a>,
    registry: &'a ModelRegistry,
    default_context_length: usize,
}

impl Iterator for ModelScan<'_> {
    type Item = ModelDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, path) = self.candidates.next()?;
        Some(match self.registry.get(&id) {
            Some(loaded) => loaded.descriptor.clone(),
            None => probe_descriptor(&id, &path, self.default_context_length),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrations::telemetry::{HardwareSnapshot, StaticTelemetry};
    use crate::integrations::DirectorySource;
    use crate::runtime::test_support::{write_mock_model, MockLoader};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn factory(dir: &Path, loader: Arc<MockLoader>) -> ModelLoaderFactory {
        let source = DirectorySource::new(dir).with_extensions(["mock"]);
        ModelLoaderFactory::new(Arc::new(ModelRegistry::new()), Arc::new(source))
            .with_loader(loader)
    }

    #[tokio::test]
    async fn test_load_resolves_from_source_and_registers() {
        let dir = TempDir::new().unwrap();
        write_mock_model(dir.path(), "tiny", 64);
        let loader = Arc::new(MockLoader::default());
        let factory = factory(dir.path(), Arc::clone(&loader));

        let outcome = factory.load("tiny", None, LoadOptions::default()).await.unwrap();
        assert!(outcome.is_new());
        assert_eq!(outcome.status(), "success");
        assert!(outcome.descriptor().loaded);
        assert!(outcome.descriptor().load_time.is_some());
        assert!(factory.is_loaded("tiny"));

        let again = factory.load("tiny", None, LoadOptions::default()).await.unwrap();
        assert_eq!(again.status(), "already_loaded");
        assert_eq!(loader.native_loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_loads_collapse_into_one() {
        let dir = TempDir::new().unwrap();
        write_mock_model(dir.path(), "tiny", 64);
        let loader = Arc::new(MockLoader::default());
        let factory = Arc::new(factory(dir.path(), Arc::clone(&loader)));

        let (a, b) = tokio::join!(
            factory.load("tiny", None, LoadOptions::default()),
            factory.load("tiny", None, LoadOptions::default())
        );
        let statuses = [a.unwrap().status(), b.unwrap().status()];
        assert!(statuses.contains(&"success"));
        assert!(statuses.contains(&"already_loaded"));
        assert_eq!(loader.native_loads.load(Ordering::SeqCst), 1);
        assert_eq!(factory.registry().len(), 1);
        assert!(factory.load_locks.is_empty());
    }

    #[tokio::test]
    async fn test_unresolvable_model_is_not_found() {
        let dir = TempDir::new().unwrap();
        let factory = factory(dir.path(), Arc::new(MockLoader::default()));
        let err = factory
            .load("ghost", None, LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::NotFound(_)));
        assert!(factory.registry().is_empty());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_registry_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.mock");
        std::fs::write(&path, b"not json").unwrap();
        let factory = factory(dir.path(), Arc::new(MockLoader::default()));

        let err = factory
            .load("broken", Some(path), LoadOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelLoadError::CorruptFile { .. }));
        assert!(factory.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unload_unknown_is_not_found() {
        let dir = TempDir::new().unwrap();
        let factory = factory(dir.path(), Arc::new(MockLoader::default()));
        assert!(matches!(
            factory.unload("ghost").await,
            Err(ModelLoadError::NotFound(_))
        ));
        assert!(factory.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unload_releases_backend() {
        let dir = TempDir::new().unwrap();
        write_mock_model(dir.path(), "tiny", 64);
        let loader = Arc::new(MockLoader::default());
        let factory = factory(dir.path(), Arc::clone(&loader));
        factory.load("tiny", None, LoadOptions::default()).await.unwrap();

        factory.unload("tiny").await.unwrap();
        assert!(!factory.is_loaded("tiny"));
        assert_eq!(loader.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_insufficient_memory_is_reported() {
        let dir = TempDir::new().unwrap();
        write_mock_model(dir.path(), "tiny", 64);
        let telemetry = StaticTelemetry(Some(HardwareSnapshot {
            cpu_usage_percent: 0.0,
            memory_used_percent: 99.0,
            available_memory_bytes: 1,
        }));
        let factory =
            factory(dir.path(), Arc::new(MockLoader::default())).with_telemetry(Arc::new(telemetry));
        assert!(matches!(
            factory.load("tiny", None, LoadOptions::default()).await,
            Err(ModelLoadError::InsufficientMemory { .. })
        ));
        assert!(factory.registry().is_empty());
    }

    #[tokio::test]
    async fn test_unclaimed_path_registers_as_pass_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("encoder.onnx");
        std::fs::write(&path, b"onnx").unwrap();
        let factory = factory(dir.path(), Arc::new(MockLoader::default()));

        let outcome = factory.load("encoder", None, LoadOptions::default()).await.unwrap();
        assert_eq!(outcome.descriptor().format, ModelFormat::Onnx);
        assert!(factory.is_loaded("encoder"));
    }

    #[tokio::test]
    async fn test_list_available_rescans_each_call() {
        let dir = TempDir::new().unwrap();
        write_mock_model(dir.path(), "a", 64);
        let factory = factory(dir.path(), Arc::new(MockLoader::default()));
        assert_eq!(factory.list_available().count(), 1);

        write_mock_model(dir.path(), "b", 64);
        assert_eq!(factory.list_available().count(), 2);

        factory.load("a", None, LoadOptions::default()).await.unwrap();
        let loaded: Vec<_> = factory.list_available().filter(|d| d.loaded).collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "a");
        assert_eq!(factory.catalog().len(), 2);
    }
}
