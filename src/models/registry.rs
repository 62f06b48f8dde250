//! Registry of loaded model handles
//!
//! The registry is the only owner of [`LoadedModel`] handles. In-flight
//! requests hold an `Arc` clone for the duration of a generation, so removing
//! an entry never pulls weights out from under a running request.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::ModelDescriptor;
use crate::runtime::{ModelBackend, ModelLoader};

/// A model whose native weights and tokenizer are resident.
pub struct LoadedModel {
    pub descriptor: ModelDescriptor,
    pub backend: Arc<dyn ModelBackend>,
    /// Loader that produced the backend; used to release it on unload.
    pub loader: Arc<dyn ModelLoader>,
}

impl LoadedModel {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("id", &self.descriptor.id)
            .field("format", &self.descriptor.format)
            .field("loader", &self.loader.name())
            .finish()
    }
}

#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<LoadedModel>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model_id: &str) -> Option<Arc<LoadedModel>> {
        self.models.read().get(model_id).cloned()
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.models.read().contains_key(model_id)
    }

    /// Insert a handle. Returns `false` and leaves the registry untouched if
    /// the id is already present.
    pub fn insert(&self, model: LoadedModel) -> bool {
        let mut models = self.models.write();
        if models.contains_key(model.id()) {
            return false;
        }
        models.insert(model.id().to_owned(), Arc::new(model));
        true
    }

    pub fn remove(&self, model_id: &str) -> Option<Arc<LoadedModel>> {
        self.models.write().remove(model_id)
    }

    /// Snapshot of loaded descriptors, sorted by id.
    pub fn descriptors(&self) -> Vec<ModelDescriptor> {
        let mut list: Vec<_> = self
            .models
            .read()
            .values()
            .map(|m| m.descriptor.clone())
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.models.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }
}
