//! ferrovox kernel
//!
//! Shared contracts for the adaptive voice pipeline. Nothing in this crate
//! spawns tasks or touches hardware; the runtime pieces live in
//! `ferrovox-foundation`.

pub mod backend;
pub mod component;
#[cfg(feature = "config")]
pub mod config;
pub mod error;
pub mod metrics;
pub mod trigger;
pub mod voice;

pub use backend::{
    Backend, BackendCapabilities, BackendError, BackendHandle, BackendLoader, BackendResult,
    FaultKind, LoadRequest,
};
pub use component::{LogicalComponent, Tier};
pub use error::{VoxError, VoxResult};
pub use metrics::{DeviceMemory, MemoryPressure, MetricsSink, NoopMetrics, RequestOutcome};
pub use trigger::{PerformanceSample, StageMetrics, TriggerCause, TriggerPolicy, TriggerRule};
pub use voice::{SpeechScore, StageInput, StageOutput};
