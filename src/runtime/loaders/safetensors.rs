//! SafeTensors loader: llama-family decoders for generation, BERT encoders
//! for embeddings

use candle_core::{DType, Device, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use candle_transformers::models::llama::{
    Cache, Config as LlamaRuntimeConfig, Llama, LlamaConfig, LlamaEosToks,
};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;
use tracing::{debug, info, instrument};

use super::detect::{detect_format, model_dir, parse_metadata, safetensors_files, ModelMetadata};
use super::{eos_tokens, load_tokenizer};
use crate::error::{InferenceError, ModelLoadError};
use crate::models::{generation_capabilities, Capability, ModelDescriptor, ModelFormat};
use crate::runtime::device::{compute_dtype, device_label, select_device, DevicePreference};
use crate::runtime::generation::{decode_loop, encode_with};
use crate::runtime::{
    BackendOutput, GenerationConfig, KvGeometry, LoadRequest, LoadedBackend, ModelBackend,
    ModelLoader, TokenSink,
};

pub struct LlamaBackend {
    model: Mutex<Option<Llama>>,
    config: LlamaRuntimeConfig,
    tokenizer: Tokenizer,
    eos: HashSet<u32>,
    device: Device,
    dtype: DType,
    context_length: usize,
}

impl ModelBackend for LlamaBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
        encode_with(&self.tokenizer, text)
    }

    fn kv_geometry(&self) -> Option<KvGeometry> {
        Some(KvGeometry {
            layers: self.config.num_hidden_layers,
            kv_heads: self.config.num_key_value_heads,
            head_dim: self.config.hidden_size / self.config.num_attention_heads.max(1),
        })
    }

    fn generate(
        &self,
        prompt: &[u32],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<BackendOutput, InferenceError> {
        let guard = self.model.lock();
        let llama = guard.as_ref().ok_or_else(|| {
            InferenceError::GenerationFailed("model weights were released".to_owned())
        })?;
        let mut cache = Cache::new(true, self.dtype, &self.config, &self.device)?;
        decode_loop(
            prompt,
            config,
            &self.tokenizer,
            &self.eos,
            &self.device,
            sink,
            |input, pos| llama.forward(input, pos, &mut cache),
        )
    }

    fn release(&self) {
        if self.model.lock().take().is_some() {
            debug!("Released llama weights on {}", device_label(&self.device));
        }
    }
}

pub struct BertBackend {
    model: Mutex<Option<BertModel>>,
    tokenizer: Tokenizer,
    device: Device,
    context_length: usize,
}

impl BertBackend {
    fn embed_one(&self, model: &BertModel, text: &str) -> Result<Vec<f32>, InferenceError> {
        let ids = encode_with(&self.tokenizer, text)?;
        if ids.len() > self.context_length {
            return Err(InferenceError::ContextExceeded {
                prompt_tokens: ids.len(),
                context_length: self.context_length,
            });
        }
        let input_ids = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = input_ids.zeros_like()?;
        let attention_mask = input_ids.ones_like()?;
        let hidden = model.forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        // Mean pool over the sequence, then L2-normalize.
        let pooled = hidden.mean(1)?.to_dtype(DType::F32)?;
        let norm = pooled.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
        let normalized = pooled.broadcast_div(&norm.maximum(1e-12)?)?;
        Ok(normalized.squeeze(0)?.to_vec1::<f32>()?)
    }
}

impl ModelBackend for BertBackend {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>, InferenceError> {
        encode_with(&self.tokenizer, text)
    }

    fn generate(
        &self,
        _prompt: &[u32],
        _config: &GenerationConfig,
        _sink: &mut dyn TokenSink,
    ) -> Result<BackendOutput, InferenceError> {
        Err(InferenceError::Unsupported(
            "embedding models cannot generate text".to_owned(),
        ))
    }

    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, InferenceError> {
        let guard = self.model.lock();
        let model = guard.as_ref().ok_or_else(|| {
            InferenceError::GenerationFailed("model weights were released".to_owned())
        })?;
        inputs.iter().map(|text| self.embed_one(model, text)).collect()
    }

    fn release(&self) {
        self.model.lock().take();
    }
}

/// Everything needed to build a backend from an already-open `VarBuilder`
pub(crate) struct BuildContext<'a> {
    pub request: &'a LoadRequest,
    pub config_json: &'a [u8],
    pub metadata: &'a ModelMetadata,
    pub tokenizer: Tokenizer,
    pub device: Device,
    pub dtype: DType,
    pub format: ModelFormat,
}

/// Build a llama-family decoder or BERT encoder from a var builder. Shared
/// with the accelerator-native loader, which produces its var builder from
/// dequantized tensors.
pub(crate) fn build_backend(
    ctx: BuildContext<'_>,
    vb: VarBuilder<'_>,
) -> Result<LoadedBackend, ModelLoadError> {
    let path = ctx.request.path.display().to_string();
    let corrupt = |e: candle_core::Error| ModelLoadError::CorruptFile {
        path: path.clone(),
        detail: e.to_string(),
    };

    if ctx.metadata.is_decoder_llama_family() {
        let llama_config: LlamaConfig = serde_json::from_slice(ctx.config_json)
            .map_err(|e| ModelLoadError::corrupt(&ctx.request.path, e))?;
        let declared_eos: Vec<u32> = match &llama_config.eos_token_id {
            Some(LlamaEosToks::Single(id)) => vec![*id],
            Some(LlamaEosToks::Multiple(ids)) => ids.clone(),
            None => Vec::new(),
        };
        let config = llama_config.into_config(false);
        let llama = Llama::load(vb, &config).map_err(corrupt)?;
        let context_length = ctx
            .request
            .options
            .context_length
            .unwrap_or(config.max_position_embeddings)
            .min(config.max_position_embeddings);

        let mut descriptor =
            ModelDescriptor::new(&ctx.request.model_id, &ctx.request.path, ctx.format)
                .with_context_length(context_length);
        descriptor.capabilities = generation_capabilities(&ctx.request.model_id);

        let eos = eos_tokens(&ctx.tokenizer, &declared_eos);
        return Ok(LoadedBackend {
            descriptor,
            backend: Box::new(LlamaBackend {
                model: Mutex::new(Some(llama)),
                config,
                tokenizer: ctx.tokenizer,
                eos,
                device: ctx.device,
                dtype: ctx.dtype,
                context_length,
            }),
        });
    }

    if ctx.metadata.model_type.as_deref() == Some("bert") {
        let bert_config: BertConfig = serde_json::from_slice(ctx.config_json)
            .map_err(|e| ModelLoadError::corrupt(&ctx.request.path, e))?;
        let model = BertModel::load(vb, &bert_config).map_err(corrupt)?;
        let context_length = ctx
            .metadata
            .context_length
            .unwrap_or(ctx.request.default_context_length);
        let descriptor =
            ModelDescriptor::new(&ctx.request.model_id, &ctx.request.path, ctx.format)
                .with_context_length(context_length)
                .with_capabilities(BTreeSet::from([Capability::Embedding]));
        return Ok(LoadedBackend {
            descriptor,
            backend: Box::new(BertBackend {
                model: Mutex::new(Some(model)),
                tokenizer: ctx.tokenizer,
                device: ctx.device,
                context_length,
            }),
        });
    }

    Err(ModelLoadError::UnsupportedFormat(format!(
        "model_type '{}' has no native backend",
        ctx.metadata.model_type.as_deref().unwrap_or("unspecified")
    )))
}

/// Read `config.json` and the tokenizer from a model directory
pub(crate) fn read_sidecars(
    dir: &Path,
) -> Result<(Vec<u8>, ModelMetadata, Tokenizer), ModelLoadError> {
    let config_path = dir.join("config.json");
    let config_json = std::fs::read(&config_path).map_err(|e| {
        ModelLoadError::corrupt(&config_path, format!("config.json unreadable: {e}"))
    })?;
    let metadata = parse_metadata(&config_json)
        .ok_or_else(|| ModelLoadError::corrupt(&config_path, "config.json is not valid JSON"))?;
    let tokenizer = load_tokenizer(&dir.join("tokenizer.json"))?;
    Ok((config_json, metadata, tokenizer))
}

pub(crate) fn parameter_count(files: &[PathBuf]) -> Result<u64, ModelLoadError> {
    // SAFETY: the files are only read; callers must not truncate them while loaded.
    let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::multi(files) }.map_err(
        |e| {
            let first = files.first().map(PathBuf::as_path).unwrap_or(Path::new(""));
            ModelLoadError::corrupt(first, e)
        },
    )?;
    Ok(tensors
        .tensors()
        .iter()
        .map(|(_, view)| view.shape().iter().product::<usize>() as u64)
        .sum())
}

pub struct SafeTensorsLoader {
    preference: DevicePreference,
}

impl SafeTensorsLoader {
    pub fn new(preference: DevicePreference) -> Self {
        Self { preference }
    }
}

impl ModelLoader for SafeTensorsLoader {
    fn name(&self) -> &'static str {
        "safetensors"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::SafeTensors
    }

    fn can_load(&self, path: &Path) -> bool {
        detect_format(path) == ModelFormat::SafeTensors
    }

    #[instrument(skip(self, request), fields(model_id = %request.model_id))]
    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError> {
        let dir = model_dir(&request.path);
        let (config_json, metadata, tokenizer) = read_sidecars(dir)?;
        let files = safetensors_files(&request.path);
        if files.is_empty() {
            return Err(ModelLoadError::NotFound(format!(
                "no .safetensors weights in {}",
                request.path.display()
            )));
        }
        let parameters = parameter_count(&files)?;

        let device = if request.options.cpu_only {
            Device::Cpu
        } else {
            select_device(self.preference)
        };
        let dtype = compute_dtype(&device);
        // SAFETY: weights are memory-mapped read-only for the lifetime of the backend.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files, dtype, &device) }
            .map_err(|e| ModelLoadError::corrupt(&request.path, e))?;

        let mut loaded = build_backend(
            BuildContext {
                request,
                config_json: &config_json,
                metadata: &metadata,
                tokenizer,
                device: device.clone(),
                dtype,
                format: ModelFormat::SafeTensors,
            },
            vb,
        )?;
        loaded.descriptor.parameter_count = Some(parameters);
        info!(
            "Loaded safetensors model {} ({} shards, {} params) on {}",
            request.model_id,
            files.len(),
            parameters,
            device_label(&device)
        );
        Ok(loaded)
    }
}
