//! Model format detection
//!
//! Extension first. Directories are ambiguous, so their metadata (a
//! `config.json`) is inspected for the declared model type and for MLX
//! quantization markers.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ModelLoadError;
use crate::models::{generation_capabilities, Capability, ModelDescriptor, ModelFormat};

/// The parts of a HuggingFace-style `config.json` detection cares about
#[derive(Debug, Clone, Default)]
pub struct ModelMetadata {
    pub model_type: Option<String>,
    pub architectures: Vec<String>,
    pub context_length: Option<usize>,
    /// MLX writes a top-level `quantization: {group_size, bits}` block
    pub mlx_quantization: Option<MlxQuantization>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MlxQuantization {
    pub group_size: usize,
    pub bits: usize,
}

impl ModelMetadata {
    pub fn is_embedding_model(&self) -> bool {
        let encoder_types = ["bert", "roberta", "xlm-roberta", "distilbert", "nomic_bert"];
        self.model_type
            .as_deref()
            .map(|t| encoder_types.contains(&t))
            .unwrap_or(false)
            || self
                .architectures
                .iter()
                .any(|a| a.ends_with("Model") && !a.ends_with("ForCausalLM"))
    }

    pub fn is_decoder_llama_family(&self) -> bool {
        matches!(self.model_type.as_deref(), Some("llama" | "mistral"))
    }
}

pub fn parse_metadata(bytes: &[u8]) -> Option<ModelMetadata> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    let model_type = value
        .get("model_type")
        .and_then(Value::as_str)
        .map(str::to_owned);
    let architectures = value
        .get("architectures")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    let context_length = ["max_position_embeddings", "n_positions", "max_seq_len"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_u64))
        .map(|n| n as usize);
    let mlx_quantization = value.get("quantization").and_then(|q| {
        Some(MlxQuantization {
            group_size: q.get("group_size")?.as_u64()? as usize,
            bits: q.get("bits")?.as_u64()? as usize,
        })
    });
    Some(ModelMetadata {
        model_type,
        architectures,
        context_length,
        mlx_quantization,
    })
}

/// Read `config.json` from a model directory
pub fn read_metadata(dir: &Path) -> Option<ModelMetadata> {
    let bytes = fs::read(dir.join("config.json")).ok()?;
    parse_metadata(&bytes)
}

/// Directory holding the model's sidecar files
pub fn model_dir(path: &Path) -> &Path {
    if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or(path)
    }
}

fn files_with_extension(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && has_extension(p, ext))
                .collect()
        })
        .unwrap_or_default();
    files.sort();
    files
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

pub fn gguf_files(dir: &Path) -> Vec<PathBuf> {
    files_with_extension(dir, "gguf")
}

/// Weight shards: a single file, or every `*.safetensors` in a directory
/// (covers both `model.safetensors` and `model-0000X-of-0000N.safetensors`).
pub fn safetensors_files(path: &Path) -> Vec<PathBuf> {
    if path.is_file() {
        return vec![path.to_path_buf()];
    }
    files_with_extension(path, "safetensors")
}

/// Tensor names from a safetensors file; the data section is mapped, not read
pub fn safetensors_tensor_names(path: &Path) -> Result<Vec<String>, ModelLoadError> {
    // SAFETY: the file is only read while the mapping is alive.
    let tensors = unsafe { candle_core::safetensors::MmapedSafetensors::new(path) }
        .map_err(|e| ModelLoadError::corrupt(path, e))?;
    Ok(tensors
        .tensors()
        .into_iter()
        .map(|(name, _)| name)
        .collect())
}

/// MLX layout: `weights.npz`, a `quantization` block, or packed
/// `*.scales`/`*.biases` tensors.
pub fn is_mlx_layout(dir: &Path, metadata: Option<&ModelMetadata>) -> bool {
    if dir.join("weights.npz").is_file() {
        return true;
    }
    if metadata.and_then(|m| m.mlx_quantization).is_some() {
        return true;
    }
    safetensors_files(dir)
        .first()
        .and_then(|f| safetensors_tensor_names(f).ok())
        .map(|names| names.iter().any(|n| n.ends_with(".scales")))
        .unwrap_or(false)
}

pub fn detect_format(path: &Path) -> ModelFormat {
    if !path.exists() {
        return ModelFormat::Unknown;
    }

    if path.is_file() {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        return match ext.as_str() {
            "gguf" => ModelFormat::Gguf,
            "safetensors" => {
                let dir = model_dir(path);
                if is_mlx_layout(dir, read_metadata(dir).as_ref()) {
                    ModelFormat::AcceleratorNative
                } else {
                    ModelFormat::SafeTensors
                }
            }
            "npz" => ModelFormat::AcceleratorNative,
            "bin" | "pt" | "pth" => ModelFormat::PyTorch,
            "onnx" => ModelFormat::Onnx,
            _ => ModelFormat::Unknown,
        };
    }

    if !gguf_files(path).is_empty() {
        return ModelFormat::Gguf;
    }

    let metadata = read_metadata(path);
    if metadata.is_some() && is_mlx_layout(path, metadata.as_ref()) {
        return ModelFormat::AcceleratorNative;
    }
    if !safetensors_files(path).is_empty() {
        return ModelFormat::SafeTensors;
    }
    if !files_with_extension(path, "onnx").is_empty() {
        return ModelFormat::Onnx;
    }
    if !files_with_extension(path, "bin").is_empty() || !files_with_extension(path, "pt").is_empty()
    {
        return ModelFormat::PyTorch;
    }
    ModelFormat::Unknown
}

/// Bytes of weight data a load would bring into memory
pub fn weight_bytes(path: &Path) -> u64 {
    if path.is_file() {
        return path.metadata().map(|m| m.len()).unwrap_or(0);
    }
    fs::read_dir(path)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    let p = e.path();
                    ["gguf", "safetensors", "bin", "pt", "pth", "onnx", "npz"]
                        .iter()
                        .any(|ext| has_extension(&p, ext))
                })
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum()
        })
        .unwrap_or(0)
}

/// Model id derived from a path: directory name, or file stem for files
pub fn model_id_for(path: &Path) -> Option<String> {
    let name = if path.is_dir() {
        path.file_name()?.to_str()?
    } else {
        path.file_stem()?.to_str()?
    };
    if name.starts_with('.') {
        return None;
    }
    Some(name.to_owned())
}

/// Cheap descriptor for a discovered (not loaded) model.
pub fn probe_descriptor(id: &str, path: &Path, default_context_length: usize) -> ModelDescriptor {
    let format = detect_format(path);
    let mut descriptor = ModelDescriptor::new(id, path, format);

    match format {
        ModelFormat::Gguf => {
            let file = if path.is_file() {
                Some(path.to_path_buf())
            } else {
                gguf_files(path).into_iter().next()
            };
            let summary = file.and_then(|f| super::gguf::inspect(&f).ok());
            descriptor.capabilities = generation_capabilities(id);
            descriptor.context_length = summary
                .as_ref()
                .and_then(|s| s.context_length)
                .unwrap_or(default_context_length);
            descriptor.quantization = summary.as_ref().and_then(|s| s.quantization.clone());
            descriptor.parameter_count = summary.map(|s| s.parameter_count);
        }
        ModelFormat::SafeTensors | ModelFormat::AcceleratorNative => {
            let metadata = read_metadata(model_dir(path)).unwrap_or_default();
            descriptor.capabilities = if metadata.is_embedding_model() {
                [Capability::Embedding].into_iter().collect()
            } else {
                generation_capabilities(id)
            };
            descriptor.context_length = metadata.context_length.unwrap_or(default_context_length);
            descriptor.quantization = metadata
                .mlx_quantization
                .map(|q| format!("mlx-{}bit-g{}", q.bits, q.group_size));
        }
        _ => {
            descriptor.context_length = default_context_length;
        }
    }

    descriptor.memory_usage = Some(weight_bytes(path)).filter(|b| *b > 0);
    descriptor
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_safetensors_header(path: &Path, names: &[&str]) {
        let tensors: HashMap<String, Tensor> = names
            .iter()
            .map(|name| {
                let t = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
                (name.to_string(), t)
            })
            .collect();
        candle_core::safetensors::save(&tensors, path).unwrap();
    }

    #[test]
    fn test_extension_detection() {
        let dir = TempDir::new().unwrap();
        for (name, expected) in [
            ("m.gguf", ModelFormat::Gguf),
            ("m.onnx", ModelFormat::Onnx),
            ("m.pt", ModelFormat::PyTorch),
            ("m.txt", ModelFormat::Unknown),
        ] {
            let path = dir.path().join(name);
            fs::write(&path, b"x").unwrap();
            assert_eq!(detect_format(&path), expected, "{name}");
        }
    }

    #[test]
    fn test_missing_path_is_unknown() {
        assert_eq!(
            detect_format(Path::new("/definitely/not/here.gguf")),
            ModelFormat::Unknown
        );
    }

    #[test]
    fn test_directory_with_config_and_safetensors() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            br#"{"model_type":"llama","max_position_embeddings":2048}"#,
        )
        .unwrap();
        write_safetensors_header(&dir.path().join("model.safetensors"), &["a.weight"]);

        assert_eq!(detect_format(dir.path()), ModelFormat::SafeTensors);
        let meta = read_metadata(dir.path()).unwrap();
        assert!(meta.is_decoder_llama_family());
        assert_eq!(meta.context_length, Some(2048));
    }

    #[test]
    fn test_mlx_quantization_block_marks_accelerator_native() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("config.json"),
            br#"{"model_type":"llama","quantization":{"group_size":64,"bits":4}}"#,
        )
        .unwrap();
        write_safetensors_header(&dir.path().join("model.safetensors"), &["a.weight"]);
        assert_eq!(detect_format(dir.path()), ModelFormat::AcceleratorNative);
    }

    #[test]
    fn test_packed_scales_mark_accelerator_native() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("config.json"), br#"{"model_type":"llama"}"#).unwrap();
        write_safetensors_header(
            &dir.path().join("model.safetensors"),
            &["q.weight", "q.scales", "q.biases"],
        );
        assert_eq!(detect_format(dir.path()), ModelFormat::AcceleratorNative);
    }

    #[test]
    fn test_tensor_names_come_from_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        write_safetensors_header(&path, &["q.weight", "q.scales"]);
        let mut names = safetensors_tensor_names(&path).unwrap();
        names.sort();
        assert_eq!(names, vec!["q.scales".to_string(), "q.weight".to_string()]);
    }

    #[test]
    fn test_truncated_safetensors_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.safetensors");
        fs::write(&path, [0xffu8; 6]).unwrap();
        assert!(matches!(
            safetensors_tensor_names(&path),
            Err(ModelLoadError::CorruptFile { .. })
        ));
        assert_eq!(detect_format(&path), ModelFormat::SafeTensors);
    }

    #[test]
    fn test_bert_metadata_is_embedding() {
        let meta = parse_metadata(br#"{"model_type":"bert","architectures":["BertModel"]}"#)
            .unwrap();
        assert!(meta.is_embedding_model());
        let meta =
            parse_metadata(br#"{"model_type":"llama","architectures":["LlamaForCausalLM"]}"#)
                .unwrap();
        assert!(!meta.is_embedding_model());
    }

    #[test]
    fn test_model_id_for_strips_extension() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("tinyllama-q4.gguf");
        fs::write(&file, b"x").unwrap();
        assert_eq!(model_id_for(&file).as_deref(), Some("tinyllama-q4"));
    }
}
