//! OpenAI-compatible API endpoints

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{header, HeaderValue},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use crate::api::openai_compat::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    CompletionChoice, CompletionChunk, CompletionRequest, CompletionResponse, Delta,
    EmbeddingData, EmbeddingRequest, EmbeddingResponse, EmbeddingUsage, EmbeddingVector,
    EncodingFormat, ListModelsResponse, Model, RequestExtensions, StreamChoice, Usage,
};
use crate::integrations::{augment_prompt, retrieval_query};
use crate::runtime::{
    FinishReason, GenerationConfig, GenerationResult, GenerationStream, PromptInput, StreamEvent,
};
use crate::server::error::ApiError;
use crate::server::state::ServerState;

const OWNER: &str = "lodestar";

/// Create OpenAI-compatible router
pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/completions", post(completions))
        .route("/embeddings", post(embeddings))
        .route("/models", get(list_models))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompletionKind {
    Chat,
    Text,
}

/// Identity shared by every frame of one completion
struct Completion {
    kind: CompletionKind,
    id: String,
    created: i64,
    model: String,
}

impl Completion {
    fn new(kind: CompletionKind, model: &str) -> Self {
        let prefix = match kind {
            CompletionKind::Chat => "chatcmpl",
            CompletionKind::Text => "cmpl",
        };
        Self {
            kind,
            id: format!("{prefix}-{}", uuid::Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: model.to_owned(),
        }
    }

    fn response(&self, result: GenerationResult) -> Response {
        let usage = Usage::from_result(&result);
        let finish_reason = Some(result.finish_reason.as_openai_str().to_string());
        match self.kind {
            CompletionKind::Chat => Json(ChatCompletionResponse {
                id: self.id.clone(),
                object: "chat.completion".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![ChatChoice {
                    index: 0,
                    message: ChatMessage::assistant(result.text),
                    finish_reason,
                }],
                usage,
            })
            .into_response(),
            CompletionKind::Text => Json(CompletionResponse {
                id: self.id.clone(),
                object: "text_completion".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: vec![CompletionChoice {
                    text: result.text,
                    index: 0,
                    finish_reason,
                }],
                usage,
            })
            .into_response(),
        }
    }

    /// Opening frame of a chat stream: the role and nothing else
    fn role_frame(&self) -> Option<Event> {
        (self.kind == CompletionKind::Chat).then(|| {
            self.chat_frame(
                Delta {
                    role: Some("assistant".to_string()),
                    content: None,
                },
                None,
            )
        })
    }

    fn content_frame(&self, text: String) -> Event {
        match self.kind {
            CompletionKind::Chat => self.chat_frame(
                Delta {
                    role: None,
                    content: Some(text),
                },
                None,
            ),
            CompletionKind::Text => self.text_frame(text, None),
        }
    }

    fn finish_frame(&self, reason: FinishReason) -> Event {
        let reason = Some(reason.as_openai_str().to_string());
        match self.kind {
            CompletionKind::Chat => self.chat_frame(Delta::default(), reason),
            CompletionKind::Text => self.text_frame(String::new(), reason),
        }
    }

    fn chat_frame(&self, delta: Delta, finish_reason: Option<String>) -> Event {
        json_event(&ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        })
    }

    fn text_frame(&self, text: String, finish_reason: Option<String>) -> Event {
        json_event(&CompletionChunk {
            id: self.id.clone(),
            object: "text_completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                text,
                index: 0,
                finish_reason,
            }],
        })
    }
}

fn json_event<T: Serialize>(value: &T) -> Event {
    match serde_json::to_string(value) {
        Ok(json) => Event::default().data(json),
        Err(e) => {
            error!("Failed to serialize stream frame: {}", e);
            Event::default().data("{}")
        }
    }
}

/// Handle chat completion requests
#[instrument(skip_all, fields(model = tracing::field::Empty))]
async fn chat_completions(
    State(state): State<ServerState>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    tracing::Span::current().record("model", request.model.as_str());
    request.validate()?;

    let config = request
        .sampling
        .resolve(&state.config.sampling_defaults, state.config.max_tokens_limit);
    let input = PromptInput::Chat(request.turns());
    let stream = request.stream.unwrap_or(false);
    complete(
        &state,
        CompletionKind::Chat,
        &request.model,
        input,
        config,
        request.extensions,
        stream,
    )
    .await
}

/// Handle text completion requests
#[instrument(skip_all, fields(model = tracing::field::Empty))]
async fn completions(
    State(state): State<ServerState>,
    payload: Result<Json<CompletionRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = payload?;
    tracing::Span::current().record("model", request.model.as_str());
    let prompt = request.prompt_text()?;

    let config = request
        .sampling
        .resolve(&state.config.sampling_defaults, state.config.max_tokens_limit);
    let stream = request.stream.unwrap_or(false);
    complete(
        &state,
        CompletionKind::Text,
        &request.model,
        PromptInput::Text(prompt),
        config,
        request.extensions,
        stream,
    )
    .await
}

async fn complete(
    state: &ServerState,
    kind: CompletionKind,
    model_id: &str,
    input: PromptInput,
    config: GenerationConfig,
    extensions: RequestExtensions,
    stream: bool,
) -> Result<Response, ApiError> {
    let model = state.engine.ensure_loaded(model_id).await?;
    state.engine.note_request(&model).await;

    let input = with_retrieval(state, input, &extensions).await;
    let dispatcher = state.engine.dispatcher();
    let completion = Completion::new(kind, model_id);

    if stream {
        let generation = dispatcher
            .generate_stream(model_id, input, config, extensions.conversation_id)
            .await?;
        return Ok(stream_response(state, completion, generation));
    }

    let _guard = state.metrics.begin();
    let result = dispatcher
        .generate_for(model_id, input, config, extensions.conversation_id.as_deref())
        .await?;
    state.metrics.record_tokens(result.tokens_generated);
    Ok(completion.response(result))
}

/// Prepend retrieved passages when the request opted into RAG. Retrieval
/// problems degrade to the unmodified prompt.
async fn with_retrieval(
    state: &ServerState,
    input: PromptInput,
    extensions: &RequestExtensions,
) -> PromptInput {
    if !extensions.use_rag {
        return input;
    }
    let Some(store) = &state.vector_store else {
        warn!("use_rag requested but retrieval is disabled");
        return input;
    };
    let query = retrieval_query(&input).to_owned();
    let top_k = extensions
        .rag_top_k
        .unwrap_or(state.config.rag.default_top_k)
        .max(1);
    let found = store.search(&query, top_k).await;
    match found {
        Ok(passages) => {
            debug!("Retrieved {} passages", passages.len());
            augment_prompt(input, &passages)
        }
        Err(e) => {
            warn!("Retrieval failed, continuing without context: {:#}", e);
            input
        }
    }
}

/// Forward generation events as SSE frames. Dropping the generation stream
/// (client disconnected) cancels the token loop.
fn stream_response(
    state: &ServerState,
    completion: Completion,
    mut generation: GenerationStream,
) -> Response {
    let guard = state.metrics.begin();
    let metrics = Arc::clone(&state.metrics);
    let (tx, rx) = mpsc::channel::<Event>(32);

    tokio::spawn(async move {
        let _guard = guard;

        if let Some(frame) = completion.role_frame() {
            if tx.send(frame).await.is_err() {
                return;
            }
        }

        while let Some(event) = generation.next().await {
            let frame = match event {
                StreamEvent::Delta(text) => completion.content_frame(text),
                StreamEvent::Finished(result) => {
                    metrics.record_tokens(result.tokens_generated);
                    info!(
                        "Streamed {} tokens ({:.1} tok/s)",
                        result.tokens_generated, result.tokens_per_second
                    );
                    completion.finish_frame(result.finish_reason)
                }
                StreamEvent::Failed(e) => {
                    error!("Generation failed mid-stream: {}", e);
                    json_event(&ApiError::from(e).body())
                }
            };
            if tx.send(frame).await.is_err() {
                info!("Client disconnected, stopping stream");
                return;
            }
        }

        let _ = tx.send(Event::default().data("[DONE]")).await;
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new())
        .into_response();
    add_no_cache_headers(&mut response);
    response
}

fn add_no_cache_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
}

/// Handle embedding requests
#[instrument(skip_all, fields(model = tracing::field::Empty))]
async fn embeddings(
    State(state): State<ServerState>,
    payload: Result<Json<EmbeddingRequest>, JsonRejection>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    let Json(request) = payload?;
    tracing::Span::current().record("model", request.model.as_str());
    let inputs = request.inputs()?;
    let encoding = request.encoding()?;

    let model = state.engine.ensure_loaded(&request.model).await?;
    let _guard = state.metrics.begin();
    let output = state.engine.dispatcher().embed(model.id(), inputs).await?;

    let data = output
        .embeddings
        .into_iter()
        .enumerate()
        .map(|(index, mut vector)| {
            if let Some(dimensions) = request.dimensions {
                vector.truncate(dimensions);
            }
            let embedding = match encoding {
                EncodingFormat::Float => EmbeddingVector::Float(vector),
                EncodingFormat::Base64 => EmbeddingVector::Base64(encode_base64(&vector)),
            };
            EmbeddingData {
                object: "embedding".to_string(),
                embedding,
                index,
            }
        })
        .collect();

    Ok(Json(EmbeddingResponse {
        object: "list".to_string(),
        data,
        model: request.model,
        usage: EmbeddingUsage {
            prompt_tokens: output.prompt_tokens,
            total_tokens: output.prompt_tokens,
        },
    }))
}

/// Little-endian f32 bytes, base64 encoded
fn encode_base64(vector: &[f32]) -> String {
    let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
    BASE64.encode(bytes)
}

/// List loaded and discoverable models
async fn list_models(State(state): State<ServerState>) -> Result<Json<ListModelsResponse>, ApiError> {
    let factory = Arc::clone(state.engine.factory());
    let catalog = tokio::task::spawn_blocking(move || factory.catalog())
        .await
        .map_err(|e| ApiError::internal(format!("Model scan failed: {e}")))?;

    let data = catalog
        .into_iter()
        .map(|descriptor| Model {
            created: descriptor.load_time.map(|t| t.timestamp()).unwrap_or(0),
            id: descriptor.id,
            object: "model".to_string(),
            owned_by: OWNER.to_string(),
        })
        .collect();

    Ok(Json(ListModelsResponse {
        object: "list".to_string(),
        data,
    }))
}
