//! ferrovox foundation layer
//!
//! Concrete implementations of the orchestration core:
//!
//! - [`resource`]: accelerator inventory, device map and background refresh
//! - [`calibration`]: one-shot detector selection with pass-through fallback
//! - [`policy`] / [`registry`]: what to load for each component, and how
//! - [`fallback`]: lazy loading and primary → fallback hot-swapping
//! - [`pipeline`]: the detect → transcribe → enhance coordinator
//! - [`mock`]: accelerator-free backends for CI

pub mod calibration;
pub mod fallback;
pub mod mock;
pub mod pipeline;
pub mod policy;
pub mod registry;
pub mod resource;

pub use calibration::{
    BackendCalibrator, CalibrationConfig, CalibrationState, Candidate, Detection, DetectorStatus,
    LatencyStats, ProbeOutcome,
};
pub use fallback::{
    ActiveComponent, ComponentStatus, ControllerStatus, FallbackController, PerformanceHistory,
    PerformanceStats,
};
pub use mock::{FaultScript, MockBackend, MockBackendLoader, MockResponse};
pub use pipeline::{
    CoordinatorConfig, HealthReport, HealthStatus, PerformanceReport, PipelineCoordinator,
    PipelineResult, RuntimeConfig, StageDetail,
};
pub use policy::{ComponentPolicy, FallbackPolicy};
pub use registry::BackendRegistry;
pub use resource::{
    DeviceCapability, DeviceMap, DeviceProbe, HostMemory, NvidiaSmiProbe, ResourceConfig,
    ResourceMonitor, StaticProbe,
};

pub use ferrovox_kernel as kernel;
