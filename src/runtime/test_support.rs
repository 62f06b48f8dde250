//! Deterministic loader/backend used by the runtime's unit tests

use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{InferenceError, ModelLoadError};
use crate::models::{generation_capabilities, Capability, ModelDescriptor, ModelFormat};
use crate::runtime::{
    BackendOutput, ContinueGeneration, FinishReason, GenerationConfig, KvGeometry, LoadRequest,
    LoadedBackend, ModelBackend, ModelLoader, TokenSink,
};

const WORDS: &[&str] = &["alpha", "beta", "gamma", "delta", "epsilon", "zeta", "eta"];

#[derive(Deserialize)]
struct MockManifest {
    context_length: usize,
    #[serde(default)]
    fail_generation: bool,
}

pub(crate) fn write_mock_model(dir: &Path, id: &str, context_length: usize) {
    std::fs::write(
        dir.join(format!("{id}.mock")),
        format!(r#"{{"context_length": {context_length}}}"#),
    )
    .unwrap();
}

pub(crate) fn write_failing_mock_model(dir: &Path, id: &str) {
    std::fs::write(
        dir.join(format!("{id}.mock")),
        r#"{"context_length": 64, "fail_generation": true}"#,
    )
    .unwrap();
}

pub(crate) struct MockBackend {
    context_length: usize,
    fail_generation: bool,
}

impl MockBackend {
    pub(crate) fn new(context_length: usize) -> Self {
        Self {
            context_length,
            fail_generation: false,
        }
    }
}

impl ModelBackend for MockBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
        Ok(text
            .split_whitespace()
            .map(|w| w.len() as u32)
            .collect())
    }

    fn kv_geometry(&self) -> Option<KvGeometry> {
        Some(KvGeometry {
            layers: 2,
            kv_heads: 2,
            head_dim: 4,
        })
    }

    fn generate(
        &self,
        prompt: &[u32],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<BackendOutput, InferenceError> {
        if self.fail_generation {
            return Err(InferenceError::GenerationFailed("mock failure".to_owned()));
        }
        let mut generated = 0;
        while generated < config.max_tokens {
            if sink.is_cancelled() {
                return Ok(BackendOutput {
                    tokens_generated: generated,
                    finish_reason: FinishReason::Cancelled,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
            let word = WORDS[(prompt.len() + generated) % WORDS.len()];
            generated += 1;
            if sink.on_token(&format!(" {word}")) == ContinueGeneration::Stop {
                return Ok(BackendOutput {
                    tokens_generated: generated,
                    finish_reason: FinishReason::StopSequence,
                });
            }
        }
        Ok(BackendOutput {
            tokens_generated: generated,
            finish_reason: FinishReason::MaxTokens,
        })
    }

    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        Ok(inputs
            .iter()
            .map(|text| {
                let mut v = vec![0f32; 8];
                for (i, b) in text.bytes().enumerate() {
                    v[i % 8] += b as f32;
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-12);
                v.iter().map(|x| x / norm).collect()
            })
            .collect())
    }

    fn release(&self) {}
}

#[derive(Default)]
pub(crate) struct MockLoader {
    pub native_loads: AtomicUsize,
    pub releases: AtomicUsize,
}

impl ModelLoader for MockLoader {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::SafeTensors
    }

    fn can_load(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("mock")
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError> {
        let bytes = std::fs::read(&request.path)
            .map_err(|e| ModelLoadError::NotFound(e.to_string()))?;
        let manifest: MockManifest =
            serde_json::from_slice(&bytes).map_err(|e| ModelLoadError::corrupt(&request.path, e))?;
        self.native_loads.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));

        let mut capabilities = generation_capabilities(&request.model_id);
        capabilities.insert(Capability::Embedding);
        let descriptor =
            ModelDescriptor::new(&request.model_id, &request.path, ModelFormat::SafeTensors)
                .with_context_length(manifest.context_length)
                .with_capabilities(capabilities);
        Ok(LoadedBackend {
            descriptor,
            backend: Box::new(MockBackend {
                context_length: manifest.context_length,
                fail_generation: manifest.fail_generation,
            }),
        })
    }

    fn unload(&self, backend: &dyn ModelBackend) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        backend.release();
    }
}
