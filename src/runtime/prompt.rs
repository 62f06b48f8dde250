//! Prompt normalization
//!
//! Chat message lists are flattened into a single prompt with a fixed
//! role-prefix convention. The conversion is a pure function: identical
//! messages always produce an identical prompt.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// Raw text or a chat transcript
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Text(String),
    Chat(Vec<ChatTurn>),
}

impl PromptInput {
    /// The single prompt string handed to the tokenizer
    pub fn to_prompt(&self) -> String {
        match self {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Chat(turns) => flatten_messages(turns),
        }
    }
}

pub const ASSISTANT_CUE: &str = "Assistant:";

fn role_prefix(role: &str) -> &'static str {
    match role.to_ascii_lowercase().as_str() {
        "system" | "developer" => "System:",
        "assistant" => ASSISTANT_CUE,
        _ => "User:",
    }
}

/// Flatten chat turns into `System:`/`User:`/`Assistant:` lines ending with
/// an `Assistant:` continuation cue.
pub fn flatten_messages(turns: &[ChatTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str(role_prefix(&turn.role));
        let content = turn.content.trim();
        if !content.is_empty() {
            prompt.push(' ');
            prompt.push_str(content);
        }
        prompt.push('\n');
    }
    prompt.push_str(ASSISTANT_CUE);
    prompt
}
