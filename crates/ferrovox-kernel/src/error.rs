//! Pipeline error taxonomy.
//!
//! None of these ever reach a caller of the coordinator as an `Err`; they are
//! recovered at the stage boundary and rendered into the result's error list.

use crate::component::{LogicalComponent, Tier};
use thiserror::Error;

/// Failures observed while orchestrating the pipeline
#[derive(Debug, Clone, PartialEq, Error)]
#[non_exhaustive]
pub enum VoxError {
    /// A backend could not be loaded for this component/tier
    #[error("{component} {tier} load failed: {reason}")]
    LoadFailure {
        component: LogicalComponent,
        tier: Tier,
        reason: String,
    },

    /// A stage exceeded its time budget
    #[error("{stage} timed out after {budget_ms} ms")]
    Timeout { stage: String, budget_ms: u64 },

    /// Not enough accelerator memory; feeds trigger evaluation
    #[error("resource exhaustion on {device}: {free_gb:.2} GB free, {required_gb:.2} GB required")]
    ResourceExhaustion {
        device: String,
        free_gb: f64,
        required_gb: f64,
    },

    /// The backend failed while serving a call
    #[error("{component} backend error: {cause}")]
    BackendInternal {
        component: LogicalComponent,
        cause: String,
    },

    /// Policy or other configuration could not be read
    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    /// Device-map override string could not be parsed
    #[error("invalid device map: {0}")]
    InvalidDeviceMap(String),
}

impl VoxError {
    pub fn timeout(stage: impl Into<String>, budget_ms: u64) -> Self {
        VoxError::Timeout {
            stage: stage.into(),
            budget_ms,
        }
    }

    pub fn backend(component: LogicalComponent, cause: impl ToString) -> Self {
        VoxError::BackendInternal {
            component,
            cause: cause.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, VoxError::Timeout { .. })
    }
}

/// Result type for pipeline operations
pub type VoxResult<T> = Result<T, VoxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_stage() {
        let err = VoxError::timeout("transcriber", 5000);
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "transcriber timed out after 5000 ms");

        let err = VoxError::LoadFailure {
            component: LogicalComponent::Generator,
            tier: Tier::Fallback,
            reason: "file not found".into(),
        };
        assert_eq!(err.to_string(), "generator fallback load failed: file not found");
    }
}
