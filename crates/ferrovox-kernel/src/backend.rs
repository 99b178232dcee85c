//! Backend Capability Contract
//!
//! Every inference implementation plugged into the pipeline is split in two:
//! a [`BackendLoader`] that knows how to bring a model up for a given
//! component/tier, and the loaded [`Backend`] handle that serves calls.
//!
//! Both sides are synchronous. Loading and inference are expected to block
//! (weights from disk, accelerator kernels), so callers in async code must
//! move them onto a blocking worker.

use crate::component::{LogicalComponent, Tier};
use crate::voice::{StageInput, StageOutput};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Class of failure reported by a backend.
///
/// Exception trigger rules match on this value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum FaultKind {
    /// Accelerator or host memory exhausted
    OutOfMemory,
    /// Backend-side deadline exceeded
    Timeout,
    /// Input rejected (wrong shape, wrong sample rate, ...)
    InvalidInput,
    /// Any other runtime failure inside the backend
    Internal,
    /// Backend-specific fault name
    Other(String),
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::OutOfMemory => write!(f, "out_of_memory"),
            FaultKind::Timeout => write!(f, "timeout"),
            FaultKind::InvalidInput => write!(f, "invalid_input"),
            FaultKind::Internal => write!(f, "internal"),
            FaultKind::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Error returned from backend load / operate / release.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: FaultKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(FaultKind::OutOfMemory, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Internal, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(FaultKind::InvalidInput, message)
    }

    pub fn is_out_of_memory(&self) -> bool {
        self.kind == FaultKind::OutOfMemory
    }
}

/// Result alias for backend calls
pub type BackendResult<T> = Result<T, BackendError>;

/// What the controller asks a loader to bring up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub component: LogicalComponent,
    pub tier: Tier,
    /// Model identifier from the policy document
    pub identifier: String,
    /// Accelerator index, `None` for CPU
    pub device: Option<usize>,
}

impl LoadRequest {
    pub fn new(component: LogicalComponent, tier: Tier, identifier: impl Into<String>) -> Self {
        Self {
            component,
            tier,
            identifier: identifier.into(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: Option<usize>) -> Self {
        self.device = device;
        self
    }

    /// Device label in `cuda:N` / `cpu` form.
    pub fn device_label(&self) -> String {
        match self.device {
            Some(index) => format!("cuda:{index}"),
            None => "cpu".to_string(),
        }
    }
}

/// Optional capabilities of a loaded backend.
///
/// Read once when the handle is created; the controller never probes for
/// them per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendCapabilities {
    /// `release()` frees resources and should be invoked on swap / reset
    pub release: bool,
    /// Detector reports a continuous score rather than yes / no
    pub probability: bool,
}

/// A loaded backend serving one logical component.
pub trait Backend: Send + Sync {
    /// Human-readable backend name (used as a metrics label)
    fn name(&self) -> &str;

    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::default()
    }

    /// Run one inference call. May block.
    fn operate(&self, input: StageInput) -> BackendResult<StageOutput>;

    /// Free accelerator / host resources held by this handle.
    fn release(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Shared handle to a loaded backend
pub type BackendHandle = Arc<dyn Backend>;

/// Factory that loads a backend for one identifier.
pub trait BackendLoader: Send + Sync {
    /// Identifier this loader answers to in the policy document
    fn identifier(&self) -> &str;

    /// Load the model. May block.
    fn load(&self, request: &LoadRequest) -> BackendResult<BackendHandle>;
}
