//! Unified inference dispatcher
//!
//! One code path for chat, text and embedding requests regardless of the
//! backend format. Buffered and streamed generation share the same
//! preparation (tokenize, context check, token budget) and the same sink,
//! so the streamed deltas always concatenate to the buffered text.

use candle_core::{DType, Device, Tensor};
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::kv_cache::KvCacheManager;
use super::prompt::PromptInput;
use super::stop::StopSequenceFilter;
use super::{
    ContinueGeneration, FinishReason, GenerationConfig, GenerationResult, KvGeometry, TokenSink,
};
use crate::error::{CacheError, InferenceError};
use crate::models::{Capability, LoadedModel, ModelRegistry};

const DEFAULT_STREAM_BUFFER: usize = 64;

/// One item of a streamed generation
#[derive(Debug)]
pub enum StreamEvent {
    Delta(String),
    Finished(GenerationResult),
    Failed(InferenceError),
}

/// Lazy, finite, non-restartable sequence of generation events.
///
/// Dropping the stream cancels the generation at the next token boundary.
pub struct GenerationStream {
    inner: ReceiverStream<StreamEvent>,
    cancel: CancellationToken,
    prompt_tokens: usize,
    cached_tokens: usize,
}

impl GenerationStream {
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    pub fn cached_tokens(&self) -> usize {
        self.cached_tokens
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Stream for GenerationStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl Drop for GenerationStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Embedding vectors plus the number of tokens consumed
#[derive(Debug, Clone)]
pub struct EmbeddingOutput {
    pub embeddings: Vec<Vec<f32>>,
    pub prompt_tokens: usize,
}

struct PreparedRequest {
    model: Arc<LoadedModel>,
    prompt_ids: Vec<u32>,
    config: GenerationConfig,
    conversation_id: Option<String>,
    cached_tokens: usize,
}

/// Sink that runs text through the stop filter before handing it to `emit`.
/// `emit` returns `false` once nobody is listening any more.
struct DispatchSink<F> {
    filter: StopSequenceFilter,
    emit: F,
    text: String,
    cancel: Option<CancellationToken>,
    closed: bool,
}

impl<F: FnMut(&str) -> bool + Send> DispatchSink<F> {
    fn new(stops: &[String], emit: F, cancel: Option<CancellationToken>) -> Self {
        Self {
            filter: StopSequenceFilter::new(stops),
            emit,
            text: String::new(),
            cancel,
            closed: false,
        }
    }

    fn deliver(&mut self, ready: &str) {
        if ready.is_empty() || self.closed {
            return;
        }
        self.text.push_str(ready);
        if !(self.emit)(ready) {
            self.closed = true;
        }
    }

    fn flush(&mut self) {
        let rest = self.filter.finish();
        self.deliver(&rest);
    }
}

impl<F: FnMut(&str) -> bool + Send> TokenSink for DispatchSink<F> {
    fn on_token(&mut self, text: &str) -> ContinueGeneration {
        let out = self.filter.push(text);
        self.deliver(&out.ready);
        if out.stopped || self.closed {
            ContinueGeneration::Stop
        } else {
            ContinueGeneration::Continue
        }
    }

    fn is_cancelled(&self) -> bool {
        self.closed || self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

fn join_failure(err: JoinError) -> InferenceError {
    InferenceError::GenerationFailed(format!("generation task failed: {err}"))
}

/// Blocking: runs the backend's token loop through a [`DispatchSink`].
fn run_generation<F>(
    prepared: &PreparedRequest,
    emit: F,
    cancel: Option<CancellationToken>,
) -> Result<GenerationResult, InferenceError>
where
    F: FnMut(&str) -> bool + Send,
{
    let mut sink = DispatchSink::new(&prepared.config.stop_sequences, emit, cancel);
    let started = Instant::now();
    let output = prepared
        .model
        .backend
        .generate(&prepared.prompt_ids, &prepared.config, &mut sink)?;

    let stop_matched = sink.filter.matched().is_some();
    let finish_reason = if sink.is_cancelled() && !stop_matched {
        FinishReason::Cancelled
    } else {
        output.finish_reason
    };
    if finish_reason != FinishReason::Cancelled {
        sink.flush();
    }

    let generation_time = started.elapsed();
    let secs = generation_time.as_secs_f64();
    let tokens_per_second = if secs > 0.0 {
        output.tokens_generated as f64 / secs
    } else {
        0.0
    };
    Ok(GenerationResult {
        text: sink.text,
        finish_reason,
        tokens_generated: output.tokens_generated,
        prompt_tokens: prepared.prompt_ids.len(),
        cached_tokens: prepared.cached_tokens,
        generation_time,
        tokens_per_second,
    })
}

fn blank_turn(
    geometry: KvGeometry,
    positions: usize,
) -> Result<(Vec<Tensor>, Vec<Tensor>), CacheError> {
    let shape = (1, geometry.kv_heads, positions, geometry.head_dim);
    let blank = || Tensor::zeros(shape, DType::F32, &Device::Cpu);
    let mut keys = Vec::with_capacity(geometry.layers);
    let mut values = Vec::with_capacity(geometry.layers);
    for _ in 0..geometry.layers {
        keys.push(blank()?);
        values.push(blank()?);
    }
    Ok((keys, values))
}

/// Record this turn's attention positions and prompt tokens for the
/// conversation. A prompt that diverges from the recorded history starts
/// the entry over. Failures are logged; they never fail the request.
fn record_turn(kv_cache: &KvCacheManager, prepared: &PreparedRequest, result: &GenerationResult) {
    let Some(conversation_id) = prepared.conversation_id.as_deref() else {
        return;
    };
    let Some(geometry) = prepared.model.backend.kv_geometry() else {
        return;
    };
    if !kv_cache.is_enabled() || result.finish_reason == FinishReason::Cancelled {
        return;
    }
    let model_id = prepared.model.id();
    let total = result.prompt_tokens + result.tokens_generated;
    let context_length = prepared.model.backend.context_length();

    let existing = kv_cache.get(model_id, conversation_id);
    let diverged = existing
        .as_ref()
        .is_some_and(|entry| prepared.cached_tokens < entry.tokens.len());
    let outcome = match existing {
        Some(entry) if !diverged => {
            let new_positions = total.saturating_sub(entry.sequence_length);
            if new_positions == 0 {
                Ok(())
            } else {
                blank_turn(geometry, new_positions).and_then(|(keys, values)| {
                    kv_cache
                        .update(model_id, conversation_id, keys, values, Some(context_length))
                        .map(|_| ())
                })
            }
        }
        _ => {
            if diverged {
                debug!("Prompt diverged from cached history of {conversation_id}; rebuilding");
            }
            kv_cache
                .create(
                    model_id,
                    conversation_id,
                    geometry.layers,
                    geometry.kv_heads,
                    geometry.head_dim,
                    total.min(context_length),
                )
                .map(|_| ())
        }
    }
    .and_then(|()| kv_cache.record_tokens(model_id, conversation_id, &prepared.prompt_ids));
    if let Err(e) = outcome {
        warn!("KV cache bookkeeping for {model_id}/{conversation_id} failed: {e}");
    }
}

pub struct InferenceDispatcher {
    registry: Arc<ModelRegistry>,
    kv_cache: Arc<KvCacheManager>,
    stream_buffer: usize,
}

impl InferenceDispatcher {
    pub fn new(registry: Arc<ModelRegistry>, kv_cache: Arc<KvCacheManager>) -> Self {
        Self {
            registry,
            kv_cache,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    pub fn with_stream_buffer(mut self, capacity: usize) -> Self {
        self.stream_buffer = capacity.max(1);
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn kv_cache(&self) -> &Arc<KvCacheManager> {
        &self.kv_cache
    }

    fn model(&self, model_id: &str) -> Result<Arc<LoadedModel>, InferenceError> {
        self.registry
            .get(model_id)
            .ok_or_else(|| InferenceError::NotLoaded(model_id.to_owned()))
    }

    /// Tokenize, check the context window and cap the token budget. Fails
    /// before the backend runs when the prompt leaves no room to generate.
    async fn prepare(
        &self,
        model: Arc<LoadedModel>,
        input: &PromptInput,
        config: GenerationConfig,
        conversation_id: Option<String>,
    ) -> Result<PreparedRequest, InferenceError> {
        let descriptor = &model.descriptor;
        if descriptor.supports(Capability::Embedding)
            && !descriptor.supports(Capability::TextGeneration)
        {
            return Err(InferenceError::Unsupported(format!(
                "'{}' is an embedding model",
                descriptor.id
            )));
        }

        let prompt = input.to_prompt();
        let backend = Arc::clone(&model.backend);
        let prompt_ids = tokio::task::spawn_blocking(move || backend.encode(&prompt))
            .await
            .map_err(join_failure)??;

        let context_length = model.backend.context_length();
        if prompt_ids.len() >= context_length {
            return Err(InferenceError::ContextExceeded {
                prompt_tokens: prompt_ids.len(),
                context_length,
            });
        }

        let mut config = config.clamped();
        config.max_tokens = config.max_tokens.min(context_length - prompt_ids.len());

        let cached_tokens = conversation_id
            .as_deref()
            .map(|conv| self.kv_cache.reusable_prefix(model.id(), conv, &prompt_ids))
            .unwrap_or(0);

        debug!(
            "Prepared {} prompt tokens ({} cached), max_tokens={}",
            prompt_ids.len(),
            cached_tokens,
            config.max_tokens
        );
        Ok(PreparedRequest {
            model,
            prompt_ids,
            config,
            conversation_id,
            cached_tokens,
        })
    }

    pub async fn generate(
        &self,
        model_id: &str,
        input: PromptInput,
        config: GenerationConfig,
    ) -> Result<GenerationResult, InferenceError> {
        self.generate_for(model_id, input, config, None).await
    }

    /// Buffered generation, optionally tracked under a conversation id
    #[instrument(skip(self, input, config), fields(model_id = %model_id))]
    pub async fn generate_for(
        &self,
        model_id: &str,
        input: PromptInput,
        config: GenerationConfig,
        conversation_id: Option<&str>,
    ) -> Result<GenerationResult, InferenceError> {
        let model = self.model(model_id)?;
        self.run_buffered(model, input, config, conversation_id.map(str::to_owned))
            .await
    }

    /// Buffered generation on a handle the caller already holds
    pub async fn generate_on(
        &self,
        model: Arc<LoadedModel>,
        input: PromptInput,
        config: GenerationConfig,
    ) -> Result<GenerationResult, InferenceError> {
        self.run_buffered(model, input, config, None).await
    }

    async fn run_buffered(
        &self,
        model: Arc<LoadedModel>,
        input: PromptInput,
        config: GenerationConfig,
        conversation_id: Option<String>,
    ) -> Result<GenerationResult, InferenceError> {
        let prepared = self.prepare(model, &input, config, conversation_id).await?;
        let kv_cache = Arc::clone(&self.kv_cache);
        // Dropping this future (client went away) cancels the token loop.
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();

        let result = tokio::task::spawn_blocking(move || {
            let result = run_generation(&prepared, |_| true, Some(cancel))?;
            record_turn(&kv_cache, &prepared, &result);
            Ok::<_, InferenceError>(result)
        })
        .await
        .map_err(join_failure)??;

        info!(
            "Generated {} tokens in {:.1} ms ({:.1} tok/s, {:?})",
            result.tokens_generated,
            result.generation_time_ms(),
            result.tokens_per_second,
            result.finish_reason
        );
        Ok(result)
    }

    /// Streamed generation. Preparation errors (not loaded, context
    /// exceeded) are returned before any event is produced.
    #[instrument(skip(self, input, config, conversation_id), fields(model_id = %model_id))]
    pub async fn generate_stream(
        &self,
        model_id: &str,
        input: PromptInput,
        config: GenerationConfig,
        conversation_id: Option<String>,
    ) -> Result<GenerationStream, InferenceError> {
        let model = self.model(model_id)?;
        let prepared = self.prepare(model, &input, config, conversation_id).await?;
        let prompt_tokens = prepared.prompt_ids.len();
        let cached_tokens = prepared.cached_tokens;

        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let kv_cache = Arc::clone(&self.kv_cache);
        let events = tx.clone();

        let task = tokio::task::spawn_blocking(move || {
            let deltas = events.clone();
            let emit = move |text: &str| deltas.blocking_send(StreamEvent::Delta(text.to_owned())).is_ok();
            let event = match run_generation(&prepared, emit, Some(token)) {
                Ok(result) => {
                    record_turn(&kv_cache, &prepared, &result);
                    debug!(
                        "Stream finished: {} tokens ({:?})",
                        result.tokens_generated, result.finish_reason
                    );
                    StreamEvent::Finished(result)
                }
                Err(e) => StreamEvent::Failed(e),
            };
            let _ = events.blocking_send(event);
        });
        tokio::spawn(async move {
            if let Err(e) = task.await {
                let _ = tx.send(StreamEvent::Failed(join_failure(e))).await;
            }
        });

        Ok(GenerationStream {
            inner: ReceiverStream::new(rx),
            cancel,
            prompt_tokens,
            cached_tokens,
        })
    }

    #[instrument(skip(self, inputs), fields(model_id = %model_id, inputs = inputs.len()))]
    pub async fn embed(
        &self,
        model_id: &str,
        inputs: Vec<String>,
    ) -> Result<EmbeddingOutput, InferenceError> {
        let model = self.model(model_id)?;
        if !model.descriptor.supports(Capability::Embedding) {
            return Err(InferenceError::Unsupported(format!(
                "'{model_id}' does not produce embeddings"
            )));
        }
        let backend = Arc::clone(&model.backend);
        tokio::task::spawn_blocking(move || {
            let mut prompt_tokens = 0;
            for text in &inputs {
                prompt_tokens += backend.encode(text)?.len();
            }
            let embeddings = backend.embed(&inputs)?;
            Ok(EmbeddingOutput {
                embeddings,
                prompt_tokens,
            })
        })
        .await
        .map_err(join_failure)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ModelDescriptor, ModelFormat};
    use crate::runtime::kv_cache::KvCacheSettings;
    use crate::runtime::test_support::{MockBackend, MockLoader};
    use crate::runtime::ChatTurn;
    use futures::StreamExt;

    fn dispatcher_with(context_length: usize) -> InferenceDispatcher {
        let registry = Arc::new(ModelRegistry::new());
        let descriptor = ModelDescriptor::new("tiny", "/models/tiny.mock", ModelFormat::SafeTensors)
            .with_context_length(context_length)
            .with_capabilities([Capability::TextGeneration, Capability::Chat]);
        registry.insert(LoadedModel {
            descriptor,
            backend: Arc::new(MockBackend::new(context_length)),
            loader: Arc::new(MockLoader::default()),
        });
        InferenceDispatcher::new(registry, Arc::new(KvCacheManager::default()))
    }

    fn greedy(max_tokens: usize) -> GenerationConfig {
        GenerationConfig {
            max_tokens,
            temperature: 0.0,
            ..Default::default()
        }
    }

    fn chat(text: &str) -> PromptInput {
        PromptInput::Chat(vec![ChatTurn::user(text)])
    }

    #[tokio::test]
    async fn test_not_loaded() {
        let dispatcher = dispatcher_with(64);
        let err = dispatcher
            .generate("ghost", chat("hi"), greedy(4))
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::NotLoaded(_)));
    }

    #[tokio::test]
    async fn test_respects_max_tokens() {
        let dispatcher = dispatcher_with(64);
        let result = dispatcher.generate("tiny", chat("Hello"), greedy(10)).await.unwrap();
        assert_eq!(result.tokens_generated, 10);
        assert_eq!(result.finish_reason, FinishReason::MaxTokens);
        assert!(!result.text.is_empty());
    }

    #[tokio::test]
    async fn test_context_exceeded_before_generation() {
        let dispatcher = dispatcher_with(4);
        let err = dispatcher
            .generate("tiny", PromptInput::Text("a b c d e f".to_owned()), greedy(4))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            InferenceError::ContextExceeded {
                prompt_tokens: 6,
                context_length: 4
            }
        ));
    }

    #[tokio::test]
    async fn test_budget_capped_by_context() {
        let dispatcher = dispatcher_with(8);
        let result = dispatcher
            .generate("tiny", PromptInput::Text("one two three".to_owned()), greedy(100))
            .await
            .unwrap();
        assert_eq!(result.tokens_generated, 5);
    }

    #[tokio::test]
    async fn test_stop_sequence_truncates_text() {
        let dispatcher = dispatcher_with(64);
        // Prompt of one word: the mock emits " beta gamma delta ..."
        let config = GenerationConfig {
            stop_sequences: vec![" delta".to_owned()],
            ..greedy(10)
        };
        let result = dispatcher
            .generate("tiny", PromptInput::Text("x".to_owned()), config)
            .await
            .unwrap();
        assert_eq!(result.text, " beta gamma");
        assert_eq!(result.finish_reason, FinishReason::StopSequence);
    }

    #[tokio::test]
    async fn test_stream_concatenation_matches_buffered() {
        let dispatcher = dispatcher_with(64);
        let config = GenerationConfig {
            stop_sequences: vec!["zeta".to_owned()],
            ..greedy(12)
        };
        let buffered = dispatcher
            .generate("tiny", chat("Write a haiku"), config.clone())
            .await
            .unwrap();

        let mut stream = dispatcher
            .generate_stream("tiny", chat("Write a haiku"), config, None)
            .await
            .unwrap();
        let mut streamed = String::new();
        let mut finished = None;
        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Delta(text) => streamed.push_str(&text),
                StreamEvent::Finished(result) => finished = Some(result),
                StreamEvent::Failed(e) => panic!("stream failed: {e}"),
            }
        }
        assert_eq!(streamed, buffered.text);
        assert_eq!(finished.unwrap().text, buffered.text);
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_generation() {
        let dispatcher = dispatcher_with(100_000);
        let mut stream = dispatcher
            .generate_stream("tiny", chat("go"), greedy(50_000), None)
            .await
            .unwrap();
        assert!(matches!(stream.next().await, Some(StreamEvent::Delta(_))));
        let token = stream.cancel.clone();
        drop(stream);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_conversation_turns_are_tracked_in_kv_cache() {
        let dispatcher = dispatcher_with(64);
        let first = dispatcher
            .generate_for("tiny", PromptInput::Text("a b c".to_owned()), greedy(2), Some("c1"))
            .await
            .unwrap();
        assert_eq!(first.cached_tokens, 0);
        assert_eq!(dispatcher.kv_cache().sequence_length("tiny", "c1"), Some(5));

        let second = dispatcher
            .generate_for(
                "tiny",
                PromptInput::Text("a b c d e f g".to_owned()),
                greedy(3),
                Some("c1"),
            )
            .await
            .unwrap();
        assert_eq!(second.cached_tokens, 3);
        assert_eq!(dispatcher.kv_cache().sequence_length("tiny", "c1"), Some(10));
    }

    #[tokio::test]
    async fn test_edited_history_reports_no_cached_tokens() {
        let dispatcher = dispatcher_with(64);
        dispatcher
            .generate_for("tiny", PromptInput::Text("a b c".to_owned()), greedy(2), Some("c1"))
            .await
            .unwrap();

        let edited = dispatcher
            .generate_for(
                "tiny",
                PromptInput::Text("abc b c d".to_owned()),
                greedy(2),
                Some("c1"),
            )
            .await
            .unwrap();
        assert_eq!(edited.cached_tokens, 0);
        // rebuilt from this turn alone: 4 prompt + 2 generated
        assert_eq!(dispatcher.kv_cache().sequence_length("tiny", "c1"), Some(6));
        let entry = dispatcher.kv_cache().get("tiny", "c1").unwrap();
        assert_eq!(entry.tokens, vec![3, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_disabled_kv_cache_reports_no_cached_tokens() {
        let dispatcher = dispatcher_with(64);
        dispatcher.kv_cache().update_settings(KvCacheSettings {
            enabled: false,
            ..Default::default()
        });
        let result = dispatcher
            .generate_for("tiny", chat("hi"), greedy(2), Some("c1"))
            .await
            .unwrap();
        assert_eq!(result.cached_tokens, 0);
        assert!(dispatcher.kv_cache().is_empty());
    }

    #[tokio::test]
    async fn test_embedding_requires_capability() {
        let dispatcher = dispatcher_with(64);
        let err = dispatcher
            .embed("tiny", vec!["text".to_owned()])
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::Unsupported(_)));
    }
}
