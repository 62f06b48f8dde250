//! Accelerator-native (MLX) checkpoints
//!
//! MLX stores affine-quantized linear layers as packed `u32` words plus
//! per-group `scales` and `biases`. The loader unpacks those into dense
//! weights and then hands off to the same decoder/encoder builders the
//! plain SafeTensors loader uses, preferring the Metal device.

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, instrument};

use super::detect::{detect_format, model_dir, safetensors_files};
use super::safetensors::{build_backend, parameter_count, read_sidecars, BuildContext};
use crate::error::ModelLoadError;
use crate::models::ModelFormat;
use crate::runtime::device::{compute_dtype, device_label, select_device, DevicePreference};
use crate::runtime::{LoadRequest, LoadedBackend, ModelLoader};

const DEFAULT_GROUP_SIZE: usize = 64;
const DEFAULT_BITS: usize = 4;

/// Unpack one affine-quantized matrix.
///
/// `packed` is row-major `[rows, packed_cols]`; each word holds `32 / bits`
/// values, lowest bits first. `scales` and `biases` are `[rows, groups]`.
pub fn dequantize_affine(
    packed: &[u32],
    scales: &[f32],
    biases: &[f32],
    rows: usize,
    packed_cols: usize,
    bits: usize,
    group_size: usize,
) -> Result<Vec<f32>, String> {
    if !matches!(bits, 2 | 4 | 8) {
        return Err(format!("{bits}-bit packing is not supported"));
    }
    if group_size == 0 {
        return Err("group_size must be positive".to_owned());
    }
    let per_word = 32 / bits;
    let cols = packed_cols * per_word;
    if cols % group_size != 0 {
        return Err(format!(
            "{cols} columns do not divide into groups of {group_size}"
        ));
    }
    let groups = cols / group_size;
    if packed.len() != rows * packed_cols
        || scales.len() != rows * groups
        || biases.len() != rows * groups
    {
        return Err("packed weight, scales and biases disagree on shape".to_owned());
    }

    let mask = (1u32 << bits) - 1;
    let mut out = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        let words = &packed[row * packed_cols..(row + 1) * packed_cols];
        for col in 0..cols {
            let word = words[col / per_word];
            let q = (word >> ((col % per_word) * bits)) & mask;
            let g = row * groups + col / group_size;
            out.push(scales[g] * q as f32 + biases[g]);
        }
    }
    Ok(out)
}

fn to_f32_matrix(tensor: &Tensor) -> candle_core::Result<Vec<f32>> {
    tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
}

/// Replace every `<prefix>.weight` that has sibling scales/biases with its
/// dense form; the scales and biases themselves are dropped.
fn dequantize_checkpoint(
    mut tensors: HashMap<String, Tensor>,
    bits: usize,
    group_size: usize,
) -> Result<HashMap<String, Tensor>, String> {
    let prefixes: Vec<String> = tensors
        .keys()
        .filter_map(|k| k.strip_suffix(".scales"))
        .map(str::to_owned)
        .collect();

    for prefix in prefixes {
        let scales = tensors.remove(&format!("{prefix}.scales"));
        let biases = tensors.remove(&format!("{prefix}.biases"));
        let weight_key = format!("{prefix}.weight");
        let (Some(scales), Some(biases), Some(weight)) =
            (scales, biases, tensors.remove(&weight_key))
        else {
            return Err(format!("incomplete quantized tensor group '{prefix}'"));
        };
        let (rows, packed_cols) = weight.dims2().map_err(|e| e.to_string())?;
        let packed = weight
            .flatten_all()
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(|e| format!("{weight_key}: {e}"))?;
        let scales = to_f32_matrix(&scales).map_err(|e| e.to_string())?;
        let biases = to_f32_matrix(&biases).map_err(|e| e.to_string())?;
        let dense = dequantize_affine(
            &packed,
            &scales,
            &biases,
            rows,
            packed_cols,
            bits,
            group_size,
        )
        .map_err(|e| format!("{weight_key}: {e}"))?;
        let cols = dense.len() / rows.max(1);
        let tensor =
            Tensor::from_vec(dense, (rows, cols), &Device::Cpu).map_err(|e| e.to_string())?;
        tensors.insert(weight_key, tensor);
    }
    Ok(tensors)
}

pub struct AcceleratorNativeLoader {
    preference: DevicePreference,
}

impl AcceleratorNativeLoader {
    pub fn new() -> Self {
        Self {
            preference: DevicePreference::Metal,
        }
    }
}

impl Default for AcceleratorNativeLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLoader for AcceleratorNativeLoader {
    fn name(&self) -> &'static str {
        "mlx"
    }

    fn format(&self) -> ModelFormat {
        ModelFormat::AcceleratorNative
    }

    fn can_load(&self, path: &Path) -> bool {
        detect_format(path) == ModelFormat::AcceleratorNative
    }

    #[instrument(skip(self, request), fields(model_id = %request.model_id))]
    fn load(&self, request: &LoadRequest) -> Result<LoadedBackend, ModelLoadError> {
        let dir = model_dir(&request.path);
        if dir.join("weights.npz").is_file() && safetensors_files(&request.path).is_empty() {
            return Err(ModelLoadError::UnsupportedFormat(
                "legacy MLX weights.npz checkpoints must be converted to safetensors".to_owned(),
            ));
        }
        let (config_json, metadata, tokenizer) = read_sidecars(dir)?;
        let files = safetensors_files(&request.path);
        if files.is_empty() {
            return Err(ModelLoadError::NotFound(format!(
                "no .safetensors weights in {}",
                request.path.display()
            )));
        }
        let quant = metadata.mlx_quantization;
        let bits = quant.map(|q| q.bits).unwrap_or(DEFAULT_BITS);
        let group_size = quant.map(|q| q.group_size).unwrap_or(DEFAULT_GROUP_SIZE);

        let mut tensors = HashMap::new();
        for file in &files {
            let shard = candle_core::safetensors::load(file, &Device::Cpu)
                .map_err(|e| ModelLoadError::corrupt(file, e))?;
            tensors.extend(shard);
        }
        let stored_parameters = parameter_count(&files)?;
        let tensors = dequantize_checkpoint(tensors, bits, group_size)
            .map_err(|detail| ModelLoadError::corrupt(&request.path, detail))?;
        debug!("Dequantized {} tensors ({bits}-bit, group {group_size})", tensors.len());

        let device = if request.options.cpu_only {
            Device::Cpu
        } else {
            select_device(self.preference)
        };
        let dtype = compute_dtype(&device);
        let vb = VarBuilder::from_tensors(tensors, dtype, &device);

        let mut loaded = build_backend(
            BuildContext {
                request,
                config_json: &config_json,
                metadata: &metadata,
                tokenizer,
                device: device.clone(),
                dtype,
                format: ModelFormat::AcceleratorNative,
            },
            vb,
        )?;
        loaded.descriptor.parameter_count = Some(stored_parameters);
        loaded.descriptor.quantization =
            quant.map(|q| format!("mlx-{}bit-g{}", q.bits, q.group_size));
        info!(
            "Loaded MLX model {} on {}",
            request.model_id,
            device_label(&device)
        );
        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_dequantize_four_bit_low_nibble_first() {
        // One row, eight 4-bit values 0..8 packed into one word.
        let word = (0..8u32).fold(0u32, |acc, v| acc | (v << (v * 4)));
        let dense = dequantize_affine(&[word], &[0.5, 2.0], &[1.0, -1.0], 1, 1, 4, 4).unwrap();
        assert_eq!(dense, vec![1.0, 1.5, 2.0, 2.5, 7.0, 9.0, 11.0, 13.0]);
    }

    #[test]
    fn test_dequantize_eight_bit() {
        let word = u32::from_le_bytes([1, 2, 3, 255]);
        let dense = dequantize_affine(&[word], &[1.0], &[0.0], 1, 1, 8, 4).unwrap();
        assert_eq!(dense, vec![1.0, 2.0, 3.0, 255.0]);
    }

    #[test]
    fn test_dequantize_rejects_odd_bit_widths() {
        assert!(dequantize_affine(&[0], &[1.0], &[0.0], 1, 1, 3, 8).is_err());
    }

    #[test]
    fn test_dequantize_rejects_shape_mismatch() {
        assert!(dequantize_affine(&[0, 0], &[1.0], &[0.0], 1, 1, 4, 8).is_err());
    }

    #[test]
    fn test_checkpoint_drops_scales_and_biases() {
        let dev = Device::Cpu;
        let mut tensors = HashMap::new();
        tensors.insert(
            "proj.weight".to_owned(),
            Tensor::new(&[[0x3210_u32]], &dev).unwrap(),
        );
        tensors.insert("proj.scales".to_owned(), Tensor::new(&[[1.0f32]], &dev).unwrap());
        tensors.insert("proj.biases".to_owned(), Tensor::new(&[[0.0f32]], &dev).unwrap());
        tensors.insert("norm.weight".to_owned(), Tensor::new(&[1.0f32], &dev).unwrap());

        let out = dequantize_checkpoint(tensors, 8, 4).unwrap();
        assert_eq!(out.len(), 2);
        let proj = out["proj.weight"].to_vec2::<f32>().unwrap();
        assert_eq!(proj, vec![vec![16.0, 50.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_npz_only_checkpoint_is_unsupported() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("weights.npz"), b"x").unwrap();
        let request = LoadRequest {
            model_id: "legacy".to_owned(),
            path: dir.path().to_path_buf(),
            options: Default::default(),
            default_context_length: 512,
        };
        assert!(matches!(
            AcceleratorNativeLoader::new().load(&request),
            Err(ModelLoadError::UnsupportedFormat(_))
        ));
    }
}
