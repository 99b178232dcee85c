//! ResourceMonitor - accelerator inventory and memory snapshots
//!
//! Tracks which accelerators exist, how much memory each has free, and which
//! device every pipeline role runs on.
//!
//! - Device map built once at construction (override string or auto-detect)
//! - Free memory re-read on [`ResourceMonitor::refresh`] or by the optional
//!   background task; reads in between are eventually consistent
//! - Hosts without an accelerator report a CPU pseudo-device and refuse every
//!   `can_load` request
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ferrovox_foundation::resource::{NvidiaSmiProbe, ResourceConfig, ResourceMonitor};
//! use ferrovox_kernel::LogicalComponent;
//!
//! let monitor = ResourceMonitor::new(ResourceConfig::from_env(), Arc::new(NvidiaSmiProbe));
//! if monitor.can_load(6.0, LogicalComponent::Generator) {
//!     // load the large model
//! }
//! ```

mod device_map;
mod probe;

pub use device_map::DeviceMap;
pub use probe::{DeviceCapability, DeviceProbe, NvidiaSmiProbe, StaticProbe, parse_nvidia_smi};

use chrono::{DateTime, Utc};
use ferrovox_kernel::metrics::DeviceMemory;
use ferrovox_kernel::{LogicalComponent, MetricsSink};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Environment variable holding the device-map override string
pub const DEVICE_MAP_ENV: &str = "FERROVOX_DEVICE_MAP";

/// Configuration for ResourceMonitor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Explicit `role:index,...` mapping; wins over auto-detection when it parses
    pub device_map_override: Option<String>,
    /// Headroom required on top of a model's size before `can_load` says yes
    pub safety_margin_gb: f64,
    /// Background refresh period
    pub refresh_interval_ms: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            device_map_override: None,
            safety_margin_gb: 2.0,
            refresh_interval_ms: 1000,
        }
    }
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus the override from `FERROVOX_DEVICE_MAP`, if set.
    pub fn from_env() -> Self {
        Self {
            device_map_override: std::env::var(DEVICE_MAP_ENV).ok(),
            ..Self::default()
        }
    }

    pub fn with_device_map_override(mut self, spec: impl Into<String>) -> Self {
        self.device_map_override = Some(spec.into());
        self
    }

    pub fn with_safety_margin_gb(mut self, gb: f64) -> Result<Self, &'static str> {
        if !gb.is_finite() || gb < 0.0 {
            return Err("safety_margin_gb must be a non-negative number");
        }
        self.safety_margin_gb = gb;
        Ok(self)
    }

    pub fn with_refresh_interval_ms(mut self, ms: u64) -> Result<Self, &'static str> {
        if ms == 0 {
            return Err("refresh_interval_ms must be > 0");
        }
        self.refresh_interval_ms = ms;
        Ok(self)
    }

    /// Refresh period, at least 1 ms. Deserialized configs bypass the
    /// builder, so a zero is clamped here rather than rejected.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms.max(1))
    }
}

/// System RAM totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostMemory {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub used_percent: f64,
}

/// Shared inner state for ResourceMonitor
struct MonitorInner {
    config: ResourceConfig,
    probe: Arc<dyn DeviceProbe>,
    devices: RwLock<Vec<DeviceCapability>>,
    device_map: DeviceMap,
    last_refresh: RwLock<DateTime<Utc>>,
    is_running: AtomicBool,
    shutdown_flag: AtomicBool,
    background_handle: Mutex<Option<JoinHandle<()>>>,
}

/// Accelerator inventory shared by the controller and the coordinator.
///
/// Cheaply cloneable; all clones share the same snapshot.
#[derive(Clone)]
pub struct ResourceMonitor {
    inner: Arc<MonitorInner>,
}

impl ResourceMonitor {
    /// Probe once and build the device map. May block on the probe.
    pub fn new(config: ResourceConfig, probe: Arc<dyn DeviceProbe>) -> Self {
        let devices = probe.probe();
        let device_map = DeviceMap::build(config.device_map_override.as_deref(), &devices);

        if devices.is_empty() {
            info!("no accelerator detected, running on cpu");
        } else {
            for device in &devices {
                info!(
                    device = device.index,
                    name = %device.name,
                    total_gb = device.total_gb(),
                    "accelerator detected"
                );
            }
        }

        Self {
            inner: Arc::new(MonitorInner {
                config,
                probe,
                devices: RwLock::new(devices),
                device_map,
                last_refresh: RwLock::new(Utc::now()),
                is_running: AtomicBool::new(false),
                shutdown_flag: AtomicBool::new(false),
                background_handle: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.inner.config
    }

    pub fn device_map(&self) -> &DeviceMap {
        &self.inner.device_map
    }

    pub fn has_accelerator(&self) -> bool {
        !self.inner.devices.read().is_empty()
    }

    /// Device index for a role name; unknown roles default to device 0.
    ///
    /// `None` on CPU-only hosts.
    pub fn device_index_for_role(&self, role: &str) -> Option<usize> {
        if !self.has_accelerator() {
            return None;
        }
        Some(self.inner.device_map.get(role).unwrap_or(0))
    }

    pub fn device_index(&self, component: LogicalComponent) -> Option<usize> {
        self.device_index_for_role(component.as_str())
    }

    /// `cuda:N` or `cpu`
    pub fn device_label(&self, component: LogicalComponent) -> String {
        match self.device_index(component) {
            Some(index) => format!("cuda:{index}"),
            None => "cpu".to_string(),
        }
    }

    /// Re-read free memory for every device. May block on the probe.
    pub fn refresh(&self) -> Vec<DeviceCapability> {
        let fresh = self.inner.probe.probe();
        {
            let mut devices = self.inner.devices.write();
            if fresh.len() != devices.len() {
                warn!(
                    before = devices.len(),
                    after = fresh.len(),
                    "accelerator count changed; device map left as built"
                );
            }
            *devices = fresh.clone();
        }
        *self.inner.last_refresh.write() = Utc::now();
        debug!(devices = fresh.len(), "device memory refreshed");
        fresh
    }

    pub fn last_refresh(&self) -> DateTime<Utc> {
        *self.inner.last_refresh.read()
    }

    pub fn devices(&self) -> Vec<DeviceCapability> {
        self.inner.devices.read().clone()
    }

    fn device(&self, index: usize) -> Option<DeviceCapability> {
        self.inner
            .devices
            .read()
            .iter()
            .find(|d| d.index == index)
            .cloned()
    }

    /// Free memory (GB) on the component's device, from the last snapshot.
    pub fn free_memory_gb(&self, component: LogicalComponent) -> Option<f64> {
        let index = self.device_index(component)?;
        self.device(index).map(|d| d.free_gb())
    }

    /// True iff the component's device has more than `size_gb` plus the
    /// safety margin free. Always false on CPU-only hosts.
    pub fn can_load(&self, size_gb: f64, component: LogicalComponent) -> bool {
        match self.free_memory_gb(component) {
            Some(free) => free > size_gb + self.inner.config.safety_margin_gb,
            None => false,
        }
    }

    /// `clamp(floor(free_gb / 4) * base, 1, 16)`; 1 without an accelerator.
    pub fn optimal_batch_size(&self, component: LogicalComponent, base: usize) -> usize {
        if !self.has_accelerator() {
            return 1;
        }
        match self.free_memory_gb(component) {
            Some(free) => ((free / 4.0).floor() as usize)
                .saturating_mul(base)
                .clamp(1, 16),
            None => base,
        }
    }

    /// Device with the most free memory that fits `size_gb` plus margin.
    pub fn best_device_for(&self, size_gb: f64) -> Option<usize> {
        let required = size_gb + self.inner.config.safety_margin_gb;
        self.inner
            .devices
            .read()
            .iter()
            .filter(|d| d.free_gb() >= required)
            .max_by(|a, b| a.free_bytes.cmp(&b.free_bytes))
            .map(|d| d.index)
    }

    /// Memory readings from the last refresh.
    pub fn snapshot(&self) -> Vec<DeviceMemory> {
        self.inner
            .devices
            .read()
            .iter()
            .map(DeviceCapability::memory)
            .collect()
    }

    pub fn host_memory(&self) -> HostMemory {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let total_bytes = sys.total_memory();
        let available_bytes = sys.available_memory();
        let used_percent = if total_bytes == 0 {
            0.0
        } else {
            (total_bytes.saturating_sub(available_bytes)) as f64 / total_bytes as f64 * 100.0
        };
        HostMemory {
            total_bytes,
            available_bytes,
            used_percent,
        }
    }

    /// Start the periodic refresh task. Requires a tokio runtime.
    pub fn start_background_refresh(&self, metrics: Arc<dyn MetricsSink>) {
        if self.inner.is_running.swap(true, Ordering::SeqCst) {
            warn!("ResourceMonitor background refresh is already running");
            return;
        }
        self.inner.shutdown_flag.store(false, Ordering::SeqCst);

        if self.inner.config.refresh_interval_ms == 0 {
            warn!("refresh_interval_ms is 0, refreshing every 1ms");
        }
        let period = self.inner.config.refresh_interval();
        info!(interval_ms = period.as_millis() as u64, "ResourceMonitor refresh started");

        let monitor = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                interval.tick().await;

                if monitor.inner.shutdown_flag.load(Ordering::SeqCst) {
                    debug!("ResourceMonitor background refresh shutting down");
                    break;
                }

                let worker = monitor.clone();
                match tokio::task::spawn_blocking(move || worker.refresh()).await {
                    Ok(devices) => {
                        for device in &devices {
                            metrics.set_device_memory(&device.memory());
                        }
                    }
                    Err(e) => warn!("device refresh task failed: {}", e),
                }
            }
        });

        *self.inner.background_handle.lock() = Some(handle);
    }

    /// Stop the background refresh task, if running.
    pub async fn shutdown(&self) {
        if !self.inner.is_running.load(Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown_flag.store(true, Ordering::SeqCst);

        let handle = self.inner.background_handle.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        self.inner.is_running.store(false, Ordering::SeqCst);
        info!("ResourceMonitor shutdown complete");
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("devices", &*self.inner.devices.read())
            .field("device_map", &self.inner.device_map)
            .finish()
    }
}
