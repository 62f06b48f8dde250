//! GGUF loader backed by candle's quantized llama/qwen2 implementations

use candle_core::quantized::{gguf_file, GgmlDType};
use candle_core::{Device, Tensor};
use candle_transformers::models::{quantized_llama, quantized_qwen2};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument};

use super::detect::{detect_format, gguf_files};
use super::{eos_tokens, load_tokenizer};
use crate::error::{InferenceError, ModelLoadError};
use crate::models::{generation_capabilities, ModelDescriptor, ModelFormat};
use crate::runtime::device::{device_label, select_device, DevicePreference};
use crate::runtime::generation::{decode_loop, encode_with};
use crate::runtime::{
    BackendOutput, GenerationConfig, KvGeometry, LoadRequest, LoadedBackend, ModelBackend,
    ModelLoader, TokenSink,
};

/// Header facts read without materializing any tensor
#[derive(Debug, Clone)]
pub struct GgufSummary {
    pub architecture: String,
    pub name: Option<String>,
    pub context_length: Option<usize>,
    pub parameter_count: u64,
    pub quantization: Option<String>,
    pub geometry: Option<KvGeometry>,
    pub eos_token_id: Option<u32>,
}

fn meta_usize(metadata: &HashMap<String, gguf_file::Value>, key: &str) -> Option<usize> {
    let value = metadata.get(key)?;
    value
        .to_u32()
        .map(|v| v as usize)
        .or_else(|_| value.to_u64().map(|v| v as usize))
        .or_else(|_| value.to_i32().map(|v| v.max(0) as usize))
        .ok()
}

fn dtype_label(dtype: GgmlDType) -> String {
    match dtype {
        GgmlDType::F32 => "f32".to_owned(),
        GgmlDType::F16 => "f16".to_owned(),
        GgmlDType::Q4_0 => "q4_0".to_owned(),
        GgmlDType::Q4_1 => "q4_1".to_owned(),
        GgmlDType::Q5_0 => "q5_0".to_owned(),
        GgmlDType::Q5_1 => "q5_1".to_owned(),
        GgmlDType::Q8_0 => "q8_0".to_owned(),
        GgmlDType::Q2K => "q2_k".to_owned(),
        GgmlDType::Q3K => "q3_k".to_owned(),
        GgmlDType::Q4K => "q4_k".to_owned(),
        GgmlDType::Q5K => "q5_k".to_owned(),
        GgmlDType::Q6K => "q6_k".to_owned(),
        other => format!("{other:?}").to_ascii_lowercase(),
    }
}

fn summarize(content: &gguf_file::Content) -> GgufSummary {
    let md = &content.metadata;
    let architecture = md
        .get("general.architecture")
        .and_then(|v| v.to_string().ok())
        .cloned()
        .unwrap_or_else(|| "unknown".to_owned());
    let name = md
        .get("general.name")
        .and_then(|v| v.to_string().ok())
        .cloned();

    let parameter_count = content
        .tensor_infos
        .values()
        .map(|info| info.shape.elem_count() as u64)
        .sum();

    // The dominant dtype among matrices is what people call "the quantization".
    let mut counts: HashMap<String, u64> = HashMap::new();
    for info in content.tensor_infos.values() {
        if info.shape.rank() >= 2 {
            *counts.entry(dtype_label(info.ggml_dtype)).or_default() +=
                info.shape.elem_count() as u64;
        }
    }
    let quantization = counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(label, _)| label);

    let layers = meta_usize(md, &format!("{architecture}.block_count"));
    let heads = meta_usize(md, &format!("{architecture}.attention.head_count"));
    let kv_heads = meta_usize(md, &format!("{architecture}.attention.head_count_kv")).or(heads);
    let embedding = meta_usize(md, &format!("{architecture}.embedding_length"));
    let geometry = match (layers, heads, kv_heads, embedding) {
        (Some(layers), Some(heads), Some(kv_heads), Some(embedding)) if heads > 0 => {
            Some(KvGeometry {
                layers,
                kv_heads,
                head_dim: embedding / heads,
            })
        }
        _ => None,
    };

    GgufSummary {
        context_length: meta_usize(md, &format!("{architecture}.context_length")),
        eos_token_id: meta_usize(md, "tokenizer.ggml.eos_token_id").map(|v| v as u32),
        architecture,
        name,
        parameter_count,
        quantization,
        geometry,
    }
}

/// Parse only the GGUF header of `path`.
pub fn inspect(path: &Path) -> Result<GgufSummary, ModelLoadError> {
    let mut file = File::open(path)
        .map_err(|e| ModelLoadError::NotFound(format!("{}: {e}", path.display())))?;
    let content =
        gguf_file::Content::read(&mut file).map_err(|e| ModelLoadError::corrupt(path, e))?;
    Ok(summarize(&content))
}

/// Longest sequence the quantized model can attend over. candle's llama
/// precomputes rotary tables for `MAX_SEQ_LEN` positions whatever the file
/// declares; qwen2 sizes them from the declared context.
fn usable_context(
    architecture: &str,
    declared: Option<usize>,
    requested: Option<usize>,
    default: usize,
) -> usize {
    let wanted = requested.unwrap_or(default);
    let limit = match architecture {
        "llama" | "mistral" => Some(quantized_llama::MAX_SEQ_LEN),
        "qwen2" => declared,
        _ => None,
    };
    match limit {
        Some(limit) if wanted > limit => {
            debug!("Capping {architecture} context {wanted} to {limit}");
            limit
        }
        _ => wanted,
    }
}

enum QuantizedWeights {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl QuantizedWeights {
    fn forward(&mut self, input: &Tensor, index_pos: usize) -> candle_core::Result<Tensor> {
        match self {
            Self::Llama(model) => model.forward(input, index_pos),
            Self::Qwen2(model) => model.forward(input, index_pos),
        }
    }
}

pub struct GgufBackend {
    weights: Mutex<Option<QuantizedWeights>>,
    tokenizer: Tokenizer,
    eos: HashSet<u32>,
    device: Device,
    context_length: usize,
    geometry: Option<KvGeometry>,
}

impl ModelBackend for GgufBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
        encode_with(&self.tokenizer, text)
    }

    fn kv_geometry(&self) -> Option<KvGeometry> {
        self.geometry
    }

    fn generate(
        &self,
        prompt: &[u32],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<BackendOutput, InferenceError> {
        let mut guard = self.weights.lock();
        let weights = guard.as_mut().ok_or_else(|| {
            InferenceError::GenerationFailed("model weights were released".to_owned())
        })?;
        decode_loop(
            prompt,
            config,
            &self.tokenizer,
            &self.eos,
            &self.device,
            sink,
            |input, pos| weights.forward(input, pos),
        )
    }

    fn release(&self) {
        if self.weights.lock().take().is_some() {
            debug!("Released GGUF weights on {}", device_label(&self.device));
        }
    }
}

pub struct GgufLoader {
    preference: DevicePreference,
}

impl GgufLoader {
    pub fn new(preference: DevicePreference) -> Self {
        Self { preference }
    }

    /// The single `.gguf` file a path refers to
    fn resolve_file(path: &Path) -> Result<PathBuf, ModelLoadError> {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        let mut files = gguf_files(path);
        match files.len() {
            0 => Err(ModelLoadError::NotFound(format!(
                "no .gguf file in {}",
                path.display()
            ))),
            1 => Ok(files.remove(0)),
            n => Err(ModelLoadError::UnsupportedFormat(format!(
                "{} contains {n} .gguf files; load one of them by path",
                path.display()
            ))),
        }
    }
}

impl ModelLoader for GgufLoader {
    fn name(&self) -> &'static str {
        "gguf"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::Gguf
    }

    fn can_load(&self, path: &Path) -> bool {
        detect_format(path) == ModelFormat::Gguf
    }

    #[instrument(skip(self, request), fields(model_id = %request.model_id))]
    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError> {
        let file_path = Self::resolve_file(&request.path)?;
        let mut file = File::open(&file_path)
            .map_err(|e| ModelLoadError::NotFound(format!("{}: {e}", file_path.display())))?;
        let content =
            gguf_file::Content::read(&mut file).map_err(|e| ModelLoadError::corrupt(&file_path, e))?;
        let summary = summarize(&content);

        let tokenizer_path = file_path
            .parent()
            .map(|dir| dir.join("tokenizer.json"))
            .unwrap_or_else(|| PathBuf::from("tokenizer.json"));
        let tokenizer = load_tokenizer(&tokenizer_path)?;

        let device = if request.options.cpu_only {
            Device::Cpu
        } else {
            select_device(self.preference)
        };

        let weights = match summary.architecture.as_str() {
            "llama" | "mistral" => {
                quantized_llama::ModelWeights::from_gguf(content, &mut file, &device)
                    .map(QuantizedWeights::Llama)
            }
            "qwen2" => quantized_qwen2::ModelWeights::from_gguf(content, &mut file, &device)
                .map(QuantizedWeights::Qwen2),
            other => {
                return Err(ModelLoadError::UnsupportedFormat(format!(
                    "GGUF architecture '{other}' has no native backend"
                )))
            }
        }
        .map_err(|e| ModelLoadError::corrupt(&file_path, e))?;

        let declared_eos: Vec<u32> = summary.eos_token_id.into_iter().collect();
        let eos = eos_tokens(&tokenizer, &declared_eos);
        let context_length = usable_context(
            &summary.architecture,
            summary.context_length,
            request.options.context_length.or(summary.context_length),
            request.default_context_length,
        );

        info!(
            "Loaded GGUF {} ({}, {:?}) on {} with context {}",
            file_path.display(),
            summary.architecture,
            summary.quantization,
            device_label(&device),
            context_length
        );

        let mut descriptor =
            ModelDescriptor::new(&request.model_id, &request.path, ModelFormat::Gguf)
                .with_context_length(context_length);
        descriptor.capabilities =
            generation_capabilities(summary.name.as_deref().unwrap_or(&request.model_id));
        descriptor.parameter_count = Some(summary.parameter_count);
        descriptor.quantization = summary.quantization.clone();

        Ok(LoadedBackend {
            descriptor,
            backend: Box::new(GgufBackend {
                weights: Mutex::new(Some(weights)),
                tokenizer,
                eos,
                device,
                context_length,
                geometry: summary.geometry,
            }),
        })
    }
}
