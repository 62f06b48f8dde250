//! Pass-through loader for formats without a native backend
//!
//! Registers the model so it shows up in listings and can be unloaded, but
//! every inference call fails with a descriptive error.

use std::path::Path;
use tracing::warn;

use super::detect::{detect_format, weight_bytes};
use crate::error::{InferenceError, ModelLoadError};
use crate::models::{ModelDescriptor, ModelFormat};
use crate::runtime::{
    BackendOutput, GenerationConfig, LoadRequest, LoadedBackend, ModelBackend, ModelLoader,
    TokenSink,
};

pub struct PassThroughBackend {
    format: ModelFormat,
    context_length: usize,
}

impl PassThroughBackend {
    pub fn new(format: ModelFormat, context_length: usize) -> Self {
        Self {
            format,
            context_length,
        }
    }

    fn unavailable(&self) -> InferenceError {
        InferenceError::GenerationFailed(format!(
            "no inference backend for format '{}'",
            self.format
        ))
    }
}

impl ModelBackend for PassThroughBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn encode(&self, _text: &str) -> Result<Vec<u32>, InferenceError> {
        Err(self.unavailable())
    }

    fn generate(
        &self,
        _prompt: &[u32],
        _config: &GenerationConfig,
        _sink: &mut dyn TokenSink,
    ) -> Result<BackendOutput, InferenceError> {
        Err(self.unavailable())
    }

    fn release(&self) {}
}

#[derive(Debug, Default)]
pub struct GenericLoader;

impl GenericLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for GenericLoader {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::Unknown
    }

    fn can_load(&self, path: &Path) -> bool {
        path.exists()
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError> {
        if !request.path.exists() {
            return Err(ModelLoadError::NotFound(request.path.display().to_string()));
        }
        let format = detect_format(&request.path);
        warn!(
            "Registering {} ({}) without a native backend; inference will fail",
            request.model_id, format
        );
        let context_length = request
            .options
            .context_length
            .unwrap_or(request.default_context_length);
        let mut descriptor = ModelDescriptor::new(&request.model_id, &request.path, format)
            .with_context_length(context_length);
        descriptor.memory_usage = Some(weight_bytes(&request.path)).filter(|b| *b > 0);
        Ok(LoadedBackend {
            descriptor,
            backend: Box::new(PassThroughBackend {
                format,
                context_length,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_onnx_registers_but_cannot_generate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("encoder.onnx");
        std::fs::write(&path, b"onnx").unwrap();
        let loader = GenericLoader::new();
        assert!(loader.can_load(&path));

        let loaded = loader
            .load(&LoadRequest {
                model_id: "encoder".to_owned(),
                path,
                options: Default::default(),
                default_context_length: 1024,
            })
            .unwrap();
        assert_eq!(loaded.descriptor.format, ModelFormat::Onnx);
        assert!(loaded.descriptor.capabilities.is_empty());
        assert!(matches!(
            loaded.backend.encode("hi"),
            Err(InferenceError::GenerationFailed(_))
        ));
    }

    #[test]
    fn test_missing_path_is_not_claimed() {
        assert!(!GenericLoader::new().can_load(Path::new("/no/such/model.bin")));
    }
}
