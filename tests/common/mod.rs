//! Common test utilities: a deterministic in-process model format and a
//! router wired to it.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use lodestar_core::config::{ServerConfig, ServerConfigBuilder};
use lodestar_core::error::{InferenceError, ModelLoadError};
use lodestar_core::integrations::DirectorySource;
use lodestar_core::models::{generation_capabilities, Capability, ModelDescriptor, ModelFormat};
use lodestar_core::runtime::{
    BackendOutput, ContinueGeneration, FinishReason, GenerationConfig, KvGeometry, LoadRequest,
    LoadedBackend, ModelBackend, ModelLoader, TokenSink,
};
use lodestar_core::server::{create_app, state::ServerState};
use lodestar_core::Engine;
use serde_json::Value;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

const WORDS: &[&str] = &["north", "star", "quiet", "river", "stone", "light", "cedar"];

/// Whitespace tokenizer; emits a fixed word cycle seeded by prompt length
pub struct WordBackend {
    context_length: usize,
}

impl ModelBackend for WordBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
        Ok(text.split_whitespace().map(|w| w.len() as u32).collect())
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
                v
            })
            .collect())
    }

    fn release(&self) {}
}

/// Loads `<id>.word` files whose body is the context length
#[derive(Default)]
pub struct WordLoader {
    pub native_loads: AtomicUsize,
}

impl ModelLoader for WordLoader {
    fn name(&self) -> &'static str {
        "word"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::SafeTensors
    }

    fn can_load(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("word")
    }

    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError> {
        let body = std::fs::read_to_string(&request.path)
            .map_err(|_| ModelLoadError::NotFound(request.model_id.clone()))?;
        let context_length: usize = body
            .trim()
            .parse()
            .map_err(|e| ModelLoadError::corrupt(&request.path, e))?;
        self.native_loads.fetch_add(1, Ordering::SeqCst);

        let mut capabilities = generation_capabilities(&request.model_id);
        capabilities.insert(Capability::Embedding);
        Ok(LoadedBackend {
            descriptor: ModelDescriptor::new(&request.model_id, &request.path, ModelFormat::SafeTensors)
                .with_context_length(context_length)
                .with_capabilities(capabilities),
            backend: Box::new(WordBackend { context_length }),
        })
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: ServerState,
    pub engine: Arc<Engine>,
    pub loader: Arc<WordLoader>,
    _models: TempDir,
}

/// Models on disk: `tiny-test` (context 256) and `small-ctx` (context 8).
/// Warmups only run when a test asks for one.
pub fn test_app(customize: impl FnOnce(ServerConfigBuilder) -> ServerConfigBuilder) -> TestApp {
    let models = TempDir::new().unwrap();
    std::fs::write(models.path().join("tiny-test.word"), "256").unwrap();
    std::fs::write(models.path().join("small-ctx.word"), "8").unwrap();

    let builder = ServerConfig::builder()
        .models_dir(models.path())
        .auto_warmup(false)
        .warm_on_first_use(false);
    let config = customize(builder).build();

    let loader = Arc::new(WordLoader::default());
    let source = DirectorySource::new(models.path()).with_extensions(["word"]);
    let engine = Arc::new(
        Engine::builder(config)
            .with_loader(loader.clone())
            .with_source(Arc::new(source))
            .without_telemetry()
            .build(),
    );
    let state = ServerState::new(Arc::clone(&engine));
    let app = create_app(state.clone());

    TestApp {
        app,
        state,
        engine,
        loader,
        _models: models,
    }
}

pub struct TestResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub text: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap_or_else(|e| panic!("{e}: {}", self.text))
    }

    /// `data:` payloads of an SSE body, in order
    pub fn sse_payloads(&self) -> Vec<String> {
        self.text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.trim_start().to_string())
            .collect()
    }
}

impl TestApp {
    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        api_key: Option<&str>,
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        TestResponse {
            status,
            content_type,
            text: String::from_utf8(bytes.to_vec()).unwrap(),
        }
    }

    pub async fn get(&self, uri: &str) -> TestResponse {
        self.request(Method::GET, uri, None, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> TestResponse {
        self.request(Method::POST, uri, Some(body), None).await
    }

    pub async fn load(&self, model_id: &str) -> TestResponse {
        self.post("/api/models/load", serde_json::json!({ "model_id": model_id }))
            .await
    }
}
