//! Token loop shared by the candle-backed decoders

use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::utils::apply_repeat_penalty;
use std::collections::HashSet;
use tokenizers::Tokenizer;

use super::utf8_decoder::IncrementalUtf8Decoder;
use super::{BackendOutput, ContinueGeneration, FinishReason, GenerationConfig, TokenSink};
use crate::error::InferenceError;

/// Window of recent tokens the repetition penalty looks at
pub const REPEAT_LAST_N: usize = 64;

pub fn sampling_for(config: &GenerationConfig) -> Sampling {
    if config.is_greedy() {
        return Sampling::ArgMax;
    }
    let temperature = config.temperature as f64;
    let top_p = config.top_p as f64;
    let use_top_p = top_p > 0.0 && top_p < 1.0;
    match (config.top_k, use_top_p) {
        (1, _) => Sampling::ArgMax,
        (k, true) => Sampling::TopKThenTopP {
            k,
            p: top_p,
            temperature,
        },
        (k, false) => Sampling::TopK { k, temperature },
    }
}

pub fn logits_processor(config: &GenerationConfig) -> LogitsProcessor {
    let seed = config.seed.unwrap_or_else(rand::random);
    LogitsProcessor::from_sampling(seed, sampling_for(config))
}

pub fn decode_with(tokenizer: &Tokenizer, ids: &[u32]) -> Result<String, InferenceError> {
    tokenizer
        .decode(ids, true)
        .map_err(|e| InferenceError::GenerationFailed(format!("detokenization failed: {e}")))
}

pub fn encode_with(tokenizer: &Tokenizer, text: &str) -> Result<Vec<u32>, InferenceError> {
    tokenizer
        .encode(text, true)
        .map(|encoding| encoding.get_ids().to_vec())
        .map_err(|e| InferenceError::GenerationFailed(format!("tokenization failed: {e}")))
}

/// Autoregressive decoding around a `forward(input, index_pos)` closure.
///
/// The first call feeds the whole prompt at position 0 (which resets any
/// internal cache of the model); every later call feeds one token.
pub fn decode_loop<F>(
    prompt: &[u32],
    config: &GenerationConfig,
    tokenizer: &Tokenizer,
    eos_tokens: &HashSet<u32>,
    device: &Device,
    sink: &mut dyn TokenSink,
    mut forward: F,
) -> Result<BackendOutput, InferenceError>
where
    F: FnMut(&Tensor, usize) -> candle_core::Result<Tensor>,
{
    if prompt.is_empty() {
        return Err(InferenceError::GenerationFailed(
            "prompt produced no tokens".to_owned(),
        ));
    }

    let mut processor = logits_processor(config);
    let mut decoder = IncrementalUtf8Decoder::new();
    let mut history = prompt.to_vec();
    let mut input: Vec<u32> = prompt.to_vec();
    let mut index_pos = 0usize;
    let mut generated = 0usize;
    let mut finish_reason = FinishReason::MaxTokens;

    while generated < config.max_tokens {
        if sink.is_cancelled() {
            finish_reason = FinishReason::Cancelled;
            break;
        }

        let input_tensor = Tensor::new(input.as_slice(), device)?.unsqueeze(0)?;
        let logits = forward(&input_tensor, index_pos)?;
        let logits = logits.flatten_all()?.to_dtype(DType::F32)?;
        let logits = if (config.repetition_penalty - 1.0).abs() > f32::EPSILON {
            let start = history.len().saturating_sub(REPEAT_LAST_N);
            apply_repeat_penalty(&logits, config.repetition_penalty, &history[start..])?
        } else {
            logits
        };

        let next = processor.sample(&logits)?;
        index_pos += input.len();
        generated += 1;
        history.push(next);

        if eos_tokens.contains(&next) {
            finish_reason = FinishReason::EndOfSequence;
            break;
        }

        let text = decoder.push_token(next, |ids| decode_with(tokenizer, ids))?;
        if !text.is_empty() && sink.on_token(&text) == ContinueGeneration::Stop {
            finish_reason = FinishReason::StopSequence;
            break;
        }
        input.clear();
        input.push(next);
    }

    if finish_reason != FinishReason::StopSequence && finish_reason != FinishReason::Cancelled {
        let rest = decoder.finish(|ids| decode_with(tokenizer, ids))?;
        if !rest.is_empty() && sink.on_token(&rest) == ContinueGeneration::Stop {
            finish_reason = FinishReason::StopSequence;
        }
    }

    Ok(BackendOutput {
        tokens_generated: generated,
        finish_reason,
    })
}
