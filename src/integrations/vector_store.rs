//! Retrieval hook for prompt augmentation
//!
//! The completion layer asks a [`VectorStore`] for passages and prepends
//! them to the prompt before tokenization. The dispatcher never sees the
//! store.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::RetrievalError;
use crate::runtime::{ChatTurn, PromptInput};

pub type Result<T> = std::result::Result<T, RetrievalError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn ingest(&self, text: &str) -> Result<()>;

    /// Best `top_k` passages for `query`, highest score first
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>>;
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
        .collect()
}

/// Term-overlap store kept in memory. Good enough for small document sets
/// and for exercising the retrieval path without an external service.
#[derive(Default)]
pub struct InMemoryVectorStore {
    documents: RwLock<Vec<(String, HashSet<String>)>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ingest(&self, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RetrievalError::EmptyDocument);
        }
        self.documents.write().push((text.to_owned(), terms(text)));
        Ok(())
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<Passage>> {
        let query_terms = terms(query);
        if query_terms.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let documents = self.documents.read();
        let mut scored: Vec<Passage> = documents
            .iter()
            .enumerate()
            .filter_map(|(index, (text, doc_terms))| {
                let shared = query_terms.intersection(doc_terms).count();
                (shared > 0).then(|| Passage {
                    text: text.clone(),
                    score: shared as f32 / query_terms.len() as f32,
                    source: Some(format!("doc-{index}")),
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(top_k);
        Ok(scored)
    }
}

fn is_document(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("txt") || e.eq_ignore_ascii_case("md"))
}

/// Ingest every `*.txt` / `*.md` file directly under `dir`, in name order.
/// Blank files are skipped. Returns how many documents were stored.
pub async fn ingest_dir(store: &dyn VectorStore, dir: &Path) -> Result<usize> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| RetrievalError::io(dir, e))?;
    let mut paths: Vec<PathBuf> = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| RetrievalError::io(dir, e))?
    {
        let path = entry.path();
        if is_document(&path) {
            paths.push(path);
        }
    }
    paths.sort();

    let mut stored = 0;
    for path in paths {
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| RetrievalError::io(&path, e))?;
        match store.ingest(&text).await {
            Ok(()) => stored += 1,
            Err(RetrievalError::EmptyDocument) => debug!("Skipping blank {}", path.display()),
            Err(e) => return Err(e),
        }
    }
    Ok(stored)
}

fn context_block(passages: &[Passage]) -> String {
    let mut block = String::from("Use the following context to answer.\n");
    for (i, passage) in passages.iter().enumerate() {
        block.push_str(&format!("[{}] {}\n", i + 1, passage.text.trim()));
    }
    block
}

/// Prepend retrieved passages: a leading system turn for chat, a context
/// preamble for raw text. No passages means no change.
pub fn augment_prompt(input: PromptInput, passages: &[Passage]) -> PromptInput {
    if passages.is_empty() {
        return input;
    }
    let context = context_block(passages);
    match input {
        PromptInput::Chat(mut turns) => {
            turns.insert(0, ChatTurn::system(context.trim_end()));
            PromptInput::Chat(turns)
        }
        PromptInput::Text(text) => PromptInput::Text(format!("{context}\n{text}")),
    }
}

/// The text a retrieval query is built from: the last user turn, or the
/// whole text prompt.
pub fn retrieval_query(input: &PromptInput) -> &str {
    match input {
        PromptInput::Text(text) => text,
        PromptInput::Chat(turns) => turns
            .iter()
            .rev()
            .find(|t| t.role.eq_ignore_ascii_case("user"))
            .map(|t| t.content.as_str())
            .unwrap_or(""),
    }
}
