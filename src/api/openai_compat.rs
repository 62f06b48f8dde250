//! OpenAI API compatibility layer

use serde::{Deserialize, Serialize};

use crate::config::SamplingParamDefaults;
use crate::error::ValidationError;
use crate::runtime::{ChatTurn, GenerationConfig, GenerationResult};

/// `stop` accepts a single string or a list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    Single(String),
    Many(Vec<String>),
}

impl StopSequences {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopSequences::Single(s) => vec![s],
            StopSequences::Many(v) => v,
        }
    }
}

/// Sampling fields shared by chat and text completions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub top_k: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub stop: Option<StopSequences>,
    pub seed: Option<u64>,
}

impl SamplingParams {
    /// Fill gaps from the server defaults; `max_tokens` is capped at `limit`
    pub fn resolve(&self, defaults: &SamplingParamDefaults, limit: usize) -> GenerationConfig {
        let mut config = defaults.to_generation_config();
        config.max_tokens = self.max_tokens.unwrap_or(config.max_tokens).min(limit.max(1));
        if let Some(t) = self.temperature {
            config.temperature = t;
        }
        if let Some(p) = self.top_p {
            config.top_p = p;
        }
        if let Some(k) = self.top_k {
            config.top_k = k;
        }
        if let Some(r) = self.repetition_penalty {
            config.repetition_penalty = r;
        }
        config.stop_sequences = self.stop.clone().map(StopSequences::into_vec).unwrap_or_default();
        config.seed = self.seed;
        config.clamped()
    }
}

/// Non-standard request fields understood by this server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestExtensions {
    /// Track KV state for this conversation across requests
    pub conversation_id: Option<String>,
    /// Prepend passages from the configured vector store
    #[serde(default)]
    pub use_rag: bool,
    pub rag_top_k: Option<usize>,
}

/// OpenAI Chat Completion Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    pub n: Option<u32>,
    pub stream: Option<bool>,
    pub user: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(flatten)]
    pub extensions: RequestExtensions,
}

impl ChatCompletionRequest {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::missing("model"));
        }
        if self.messages.is_empty() {
            return Err(ValidationError::missing("messages"));
        }
        validate_n(self.n)
    }

    pub fn turns(&self) -> Vec<ChatTurn> {
        self.messages
            .iter()
            .map(|m| ChatTurn::new(&m.role, m.content.clone().unwrap_or_default()))
            .collect()
    }
}

fn validate_n(n: Option<u32>) -> Result<(), ValidationError> {
    match n {
        Some(n) if n != 1 => Err(ValidationError::out_of_range(
            "n",
            "only a single choice per request is supported",
        )),
        _ => Ok(()),
    }
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.into()),
        }
    }
}

/// Chat Completion Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

/// Chat choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// `prompt` accepts a string or a single-element list
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptField {
    Text(String),
    Batch(Vec<String>),
}

/// Text Completion Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: String,
    pub prompt: Option<PromptField>,
    pub n: Option<u32>,
    pub stream: Option<bool>,
    pub user: Option<String>,
    #[serde(flatten)]
    pub sampling: SamplingParams,
    #[serde(flatten)]
    pub extensions: RequestExtensions,
}

impl CompletionRequest {
    /// The single prompt string, validated
    pub fn prompt_text(&self) -> Result<String, ValidationError> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::missing("model"));
        }
        validate_n(self.n)?;
        match &self.prompt {
            None => Err(ValidationError::missing("prompt")),
            Some(PromptField::Text(text)) => Ok(text.clone()),
            Some(PromptField::Batch(batch)) => match batch.as_slice() {
                [] => Err(ValidationError::missing("prompt")),
                [single] => Ok(single.clone()),
                _ => Err(ValidationError::out_of_range(
                    "prompt",
                    "batched prompts are not supported",
                )),
            },
        }
    }
}

/// Completion Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

/// Completion choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: u32,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    Single(String),
    Many(Vec<String>),
}

/// Embedding Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    #[serde(default)]
    pub model: String,
    pub input: Option<EmbeddingInput>,
    /// Truncate every vector to this many dimensions
    pub dimensions: Option<usize>,
    /// `float` (default) or `base64`
    pub encoding_format: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    Float,
    Base64,
}

impl EmbeddingRequest {
    pub fn inputs(&self) -> Result<Vec<String>, ValidationError> {
        if self.model.trim().is_empty() {
            return Err(ValidationError::missing("model"));
        }
        let inputs = match &self.input {
            None => Vec::new(),
            Some(EmbeddingInput::Single(s)) => vec![s.clone()],
            Some(EmbeddingInput::Many(v)) => v.clone(),
        };
        if inputs.is_empty() {
            return Err(ValidationError::missing("input"));
        }
        if self.dimensions == Some(0) {
            return Err(ValidationError::out_of_range("dimensions", "must be at least 1"));
        }
        Ok(inputs)
    }

    pub fn encoding(&self) -> Result<EncodingFormat, ValidationError> {
        match self.encoding_format.as_deref() {
            None | Some("float") => Ok(EncodingFormat::Float),
            Some("base64") => Ok(EncodingFormat::Base64),
            Some(other) => Err(ValidationError::out_of_range(
                "encoding_format",
                format!("unknown encoding '{other}'"),
            )),
        }
    }
}

/// Embedding Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: EmbeddingUsage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingVector {
    Float(Vec<f32>),
    Base64(String),
}

/// Embedding data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub object: String,
    pub embedding: EmbeddingVector,
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    pub prompt_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    pub cached_tokens: usize,
}

/// Usage statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
}

impl Usage {
    pub fn from_result(result: &GenerationResult) -> Self {
        Self {
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.tokens_generated,
            total_tokens: result.prompt_tokens + result.tokens_generated,
            prompt_tokens_details: Some(PromptTokensDetails {
                cached_tokens: result.cached_tokens,
            }),
        }
    }
}

/// List Models Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListModelsResponse {
    pub object: String,
    pub data: Vec<Model>,
}

/// Model information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Streaming chunk of a chat completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

/// Streaming choice
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

/// Delta content for streaming
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Streaming chunk of a text completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

/// Error detail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
}
