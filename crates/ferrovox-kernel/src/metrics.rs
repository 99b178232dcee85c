//! Metrics traits and types for monitoring integration
//!
//! The orchestration core reports through [`MetricsSink`] so that the
//! monitoring crate can plug in a Prometheus registry (or anything else)
//! without the core depending on it.

use crate::component::{LogicalComponent, Tier};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Classification of a finished pipeline request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestOutcome {
    Success,
    Error,
    Timeout,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Error => "error",
            RequestOutcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse memory usage bucket of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryPressure {
    /// Under 50 % used
    Low,
    /// Under 80 % used
    Elevated,
    Critical,
}

impl MemoryPressure {
    pub fn from_utilization(percent: f64) -> Self {
        if percent < 50.0 {
            MemoryPressure::Low
        } else if percent < 80.0 {
            MemoryPressure::Elevated
        } else {
            MemoryPressure::Critical
        }
    }
}

/// Point-in-time memory reading for one accelerator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMemory {
    pub index: usize,
    pub name: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub used_bytes: u64,
    pub utilization_percent: f64,
    pub pressure: MemoryPressure,
}

impl DeviceMemory {
    pub fn new(index: usize, name: impl Into<String>, total_bytes: u64, free_bytes: u64) -> Self {
        let free_bytes = free_bytes.min(total_bytes);
        let used_bytes = total_bytes - free_bytes;
        let utilization_percent = if total_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 / total_bytes as f64 * 100.0
        };
        Self {
            index,
            name: name.into(),
            total_bytes,
            free_bytes,
            used_bytes,
            utilization_percent,
            pressure: MemoryPressure::from_utilization(utilization_percent),
        }
    }

    pub fn free_gb(&self) -> f64 {
        self.free_bytes as f64 / GIB
    }

    pub fn total_gb(&self) -> f64 {
        self.total_bytes as f64 / GIB
    }
}

/// Bytes per GiB
pub const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Receiver for the metrics emitted by the orchestration core.
///
/// Implementations must be cheap and non-blocking; they are called on the
/// request path.
pub trait MetricsSink: Send + Sync {
    fn record_stage_latency(&self, stage: &str, backend: &str, seconds: f64);

    fn record_request(&self, outcome: RequestOutcome);

    /// Mark `tier` as the active tier of `component` (and clear the other)
    fn set_component_tier(&self, component: LogicalComponent, tier: Option<Tier>);

    fn record_model_load(&self, component: LogicalComponent, tier: Tier, seconds: f64);

    fn record_load_failure(&self, component: LogicalComponent, tier: Tier);

    fn record_tier_swap(&self, component: LogicalComponent);

    fn set_detection_probability(&self, probability: f64);

    fn set_device_memory(&self, device: &DeviceMemory);
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_stage_latency(&self, _stage: &str, _backend: &str, _seconds: f64) {}
    fn record_request(&self, _outcome: RequestOutcome) {}
    fn set_component_tier(&self, _component: LogicalComponent, _tier: Option<Tier>) {}
    fn record_model_load(&self, _component: LogicalComponent, _tier: Tier, _seconds: f64) {}
    fn record_load_failure(&self, _component: LogicalComponent, _tier: Tier) {}
    fn record_tier_swap(&self, _component: LogicalComponent) {}
    fn set_detection_probability(&self, _probability: f64) {}
    fn set_device_memory(&self, _device: &DeviceMemory) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_buckets() {
        assert_eq!(MemoryPressure::from_utilization(49.9), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(50.0), MemoryPressure::Elevated);
        assert_eq!(MemoryPressure::from_utilization(80.0), MemoryPressure::Critical);
    }

    #[test]
    fn test_device_memory_derives_usage() {
        let gib = GIB as u64;
        let mem = DeviceMemory::new(0, "RTX 3090", 24 * gib, 6 * gib);
        assert_eq!(mem.used_bytes, 18 * gib);
        assert!((mem.utilization_percent - 75.0).abs() < 1e-9);
        assert_eq!(mem.pressure, MemoryPressure::Elevated);
        assert!((mem.free_gb() - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_does_not_divide() {
        let mem = DeviceMemory::new(0, "ghost", 0, 10);
        assert_eq!(mem.free_bytes, 0);
        assert_eq!(mem.utilization_percent, 0.0);
    }
}
