//! Accelerator probing
//!
//! A [`DeviceProbe`] returns the current accelerator inventory. An empty
//! inventory means the host has no usable accelerator and everything runs on
//! the CPU pseudo-device.

use ferrovox_kernel::metrics::{DeviceMemory, GIB};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// One accelerator as last seen by a probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub index: usize,
    pub name: String,
    pub total_bytes: u64,
    /// Refreshed by probing, not continuously accurate
    pub free_bytes: u64,
    /// Compute capability as reported by the driver, e.g. `8.6`
    pub compute: String,
}

impl DeviceCapability {
    pub fn new(index: usize, name: impl Into<String>, total_gb: f64, free_gb: f64) -> Self {
        Self {
            index,
            name: name.into(),
            total_bytes: gb_to_bytes(total_gb),
            free_bytes: gb_to_bytes(free_gb),
            compute: String::new(),
        }
    }

    pub fn with_compute(mut self, compute: impl Into<String>) -> Self {
        self.compute = compute.into();
        self
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / GIB
    }

    pub fn memory(&self) -> DeviceMemory {
        DeviceMemory::new(self.index, &self.name, self.total_bytes, self.free_bytes)
    }
}

fn gb_to_bytes(gb: f64) -> u64 {
    (gb.max(0.0) * GIB) as u64
}

/// Source of accelerator inventory. Implementations may block.
pub trait DeviceProbe: Send + Sync {
    fn probe(&self) -> Vec<DeviceCapability>;
}

/// Probe backed by `nvidia-smi`.
///
/// Reports an empty inventory when the driver node or the tool is missing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NvidiaSmiProbe;

const NVIDIA_QUERY: &str = "--query-gpu=index,name,memory.total,memory.free,compute_cap";

impl DeviceProbe for NvidiaSmiProbe {
    fn probe(&self) -> Vec<DeviceCapability> {
        if !Path::new("/dev/nvidia0").exists() && !Path::new("/dev/nvidiactl").exists() {
            return Vec::new();
        }

        let output = match std::process::Command::new("nvidia-smi")
            .args([NVIDIA_QUERY, "--format=csv,noheader,nounits"])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                debug!("nvidia-smi unavailable: {}", e);
                return Vec::new();
            }
        };

        if !output.status.success() {
            debug!("nvidia-smi exited with {}", output.status);
            return Vec::new();
        }

        parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Parse `index, name, total MiB, free MiB, compute_cap` CSV rows.
///
/// Rows that do not parse are skipped.
pub fn parse_nvidia_smi(stdout: &str) -> Vec<DeviceCapability> {
    const MIB: u64 = 1024 * 1024;

    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                return None;
            }
            let index = parts[0].parse::<usize>().ok()?;
            let total_mib = parts[2].parse::<u64>().ok()?;
            let free_mib = parts[3].parse::<u64>().ok()?;
            Some(DeviceCapability {
                index,
                name: parts[1].to_string(),
                total_bytes: total_mib * MIB,
                free_bytes: free_mib * MIB,
                compute: parts.get(4).map(|s| s.to_string()).unwrap_or_default(),
            })
        })
        .collect()
}

/// Fixed inventory whose free memory can be adjusted at runtime.
#[derive(Debug, Default)]
pub struct StaticProbe {
    devices: RwLock<Vec<DeviceCapability>>,
}

impl StaticProbe {
    pub fn new(devices: Vec<DeviceCapability>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Host without accelerators
    pub fn cpu_only() -> Self {
        Self::default()
    }

    pub fn set_free_gb(&self, index: usize, free_gb: f64) {
        let mut devices = self.devices.write();
        if let Some(device) = devices.iter_mut().find(|d| d.index == index) {
            device.free_bytes = gb_to_bytes(free_gb).min(device.total_bytes);
        }
    }
}

impl DeviceProbe for StaticProbe {
    fn probe(&self) -> Vec<DeviceCapability> {
        self.devices.read().clone()
    }
}
