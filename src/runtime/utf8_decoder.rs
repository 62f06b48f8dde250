//! Incremental UTF-8 decoder for byte-level tokenizers
//!
//! A single token may carry only part of a multi-byte character. Decoding
//! each token on its own would emit replacement characters, and re-decoding
//! the whole sequence every step is quadratic. The decoder keeps a short
//! window of undelivered tokens and only releases text once it ends on a
//! complete character.

use crate::error::InferenceError;

#[derive(Debug, Clone, Default)]
pub struct IncrementalUtf8Decoder {
    tokens: Vec<u32>,
    /// Start of the window that produced the last delivered text
    prev_index: usize,
    /// End of that window
    current_index: usize,
    emitted: String,
}

impl IncrementalUtf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token and return newly completed text (possibly empty).
    pub fn push_token<F>(&mut self, token: u32, decode: F) -> Result<String, InferenceError>
    where
        F: Fn(&[u32]) -> Result<String, InferenceError>,
    {
        let prev_text = if self.current_index > self.prev_index {
            decode(&self.tokens[self.prev_index..self.current_index])?
        } else {
            String::new()
        };
        self.tokens.push(token);
        let text = decode(&self.tokens[self.prev_index..])?;

        if text.len() > prev_text.len()
            && !text.ends_with('\u{FFFD}')
            && text.is_char_boundary(prev_text.len())
        {
            let delta = text[prev_text.len()..].to_owned();
            self.prev_index = self.current_index;
            self.current_index = self.tokens.len();
            self.emitted.push_str(&delta);
            Ok(delta)
        } else {
            Ok(String::new())
        }
    }

    /// Flush whatever is left once generation ends
    pub fn finish<F>(&mut self, decode: F) -> Result<String, InferenceError>
    where
        F: Fn(&[u32]) -> Result<String, InferenceError>,
    {
        if self.tokens.len() <= self.current_index {
            return Ok(String::new());
        }
        let prev_text = decode(&self.tokens[self.prev_index..self.current_index])?;
        let text = decode(&self.tokens[self.prev_index..])?;
        let rest = text
            .get(prev_text.len()..)
            .unwrap_or_default()
            .trim_end_matches('\u{FFFD}')
            .to_owned();
        self.current_index = self.tokens.len();
        self.prev_index = self.current_index;
        self.emitted.push_str(&rest);
        Ok(rest)
    }

    pub fn text(&self) -> &str {
        &self.emitted
    }

    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }
}
