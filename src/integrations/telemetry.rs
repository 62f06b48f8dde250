//! Coarse hardware telemetry used only to bias tuning decisions

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::System;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub cpu_usage_percent: f32,
    pub memory_used_percent: f32,
    pub available_memory_bytes: u64,
}

/// How much extra work the server should spend on latency tuning
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationHint {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl OptimizationHint {
    pub fn from_snapshot(snapshot: Option<&HardwareSnapshot>) -> Self {
        match snapshot {
            None => Self::Balanced,
            Some(s) if s.memory_used_percent > 85.0 || s.cpu_usage_percent > 85.0 => {
                Self::Conservative
            }
            Some(s) if s.memory_used_percent < 50.0 && s.cpu_usage_percent < 50.0 => {
                Self::Aggressive
            }
            Some(_) => Self::Balanced,
        }
    }

    /// Default number of warmup prompts for this level
    pub fn warmup_prompts(&self) -> usize {
        match self {
            Self::Conservative => 1,
            Self::Balanced => 2,
            Self::Aggressive => 3,
        }
    }
}

/// Source of hardware figures. Never required for correctness: `None`
/// means "unknown" and callers fall back to neutral defaults.
pub trait TelemetryProvider: Send + Sync {
    fn snapshot(&self) -> Option<HardwareSnapshot>;

    fn hint(&self) -> OptimizationHint {
        OptimizationHint::from_snapshot(self.snapshot().as_ref())
    }
}

/// Telemetry read from the host with `sysinfo`
pub struct SysinfoTelemetry {
    system: Mutex<System>,
}

impl SysinfoTelemetry {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryProvider for SysinfoTelemetry {
    fn snapshot(&self) -> Option<HardwareSnapshot> {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.refresh_cpu_usage();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        Some(HardwareSnapshot {
            cpu_usage_percent: system.global_cpu_usage(),
            memory_used_percent: (system.used_memory() as f64 / total as f64 * 100.0) as f32,
            available_memory_bytes: system.available_memory(),
        })
    }
}

/// Fixed figures, for tests and for pinning behaviour in deployments
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetry(pub Option<HardwareSnapshot>);

impl TelemetryProvider for StaticTelemetry {
    fn snapshot(&self) -> Option<HardwareSnapshot> {
        self.0
    }
}
