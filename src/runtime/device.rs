//! Compute device selection

use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device};
use tracing::{info, warn};

/// Which accelerator a loader would like to run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DevicePreference {
    #[default]
    Auto,
    /// Apple silicon first (accelerator-native exports)
    Metal,
    Cpu,
}

/// Pick a device, falling back to CPU whenever an accelerator fails to open.
pub fn select_device(preference: DevicePreference) -> Device {
    if preference == DevicePreference::Cpu {
        return Device::Cpu;
    }

    if preference == DevicePreference::Auto && cuda_is_available() {
        match Device::new_cuda(0) {
            Ok(device) => {
                info!("Using CUDA device 0");
                return device;
            }
            Err(e) => warn!("CUDA reported available but failed to initialize: {}", e),
        }
    }

    if metal_is_available() {
        match Device::new_metal(0) {
            Ok(device) => {
                info!("Using Metal device 0");
                return device;
            }
            Err(e) => warn!("Metal reported available but failed to initialize: {}", e),
        }
    }

    Device::Cpu
}

/// Activation dtype for unquantized weights on `device`
pub fn compute_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}
