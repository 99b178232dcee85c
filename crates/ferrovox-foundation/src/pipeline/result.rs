//! Aggregated request results and health reporting types

use crate::calibration::DetectorStatus;
use crate::fallback::ControllerStatus;
use crate::resource::HostMemory;
use chrono::{DateTime, Utc};
use ferrovox_kernel::{RequestOutcome, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const STAGE_DETECTION: &str = "detection";
pub const STAGE_TRANSCRIPTION: &str = "transcription";
pub const STAGE_ENHANCEMENT: &str = "enhancement";

/// What one stage did for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageDetail {
    pub backend: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<Tier>,
    pub latency_ms: f64,
    pub success: bool,
    /// Stage produced no effect (disabled detector, empty enhancement)
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    /// Stage was retried on the fallback after an out-of-memory fault
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retried: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageDetail {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Default::default()
        }
    }
}

/// The one value a caller gets back per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub request_id: Uuid,
    pub success: bool,
    pub text: String,
    pub confidence: f32,
    pub latency_ms: f64,
    pub stages: BTreeMap<String, StageDetail>,
    /// Causes of failure, in the order they occurred
    pub errors: Vec<String>,
    pub outcome: RequestOutcome,
}

impl PipelineResult {
    pub(crate) fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            success: false,
            text: String::new(),
            confidence: 0.0,
            latency_ms: 0.0,
            stages: BTreeMap::new(),
            errors: Vec::new(),
            outcome: RequestOutcome::Error,
        }
    }

    pub(crate) fn fail(&mut self, outcome: RequestOutcome, error: impl ToString) {
        self.success = false;
        self.outcome = outcome;
        self.errors.push(error.to_string());
    }

    pub(crate) fn succeed(&mut self, text: String, confidence: f32) {
        self.success = true;
        self.outcome = RequestOutcome::Success;
        self.text = text;
        self.confidence = confidence;
    }

    pub fn stage(&self, name: &str) -> Option<&StageDetail> {
        self.stages.get(name)
    }
}

/// Overall health derived from the lifetime error rate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Error rate under 5 %
    Healthy,
    /// Error rate under 20 %
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn from_error_rate(percent: f64) -> Self {
        if percent < 5.0 {
            HealthStatus::Healthy
        } else if percent < 20.0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Unhealthy
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub requests_processed: u64,
    pub average_latency_ms: f64,
    pub error_rate_percent: f64,
    pub stage_errors: BTreeMap<String, u64>,
    /// Requests currently inside the retention window
    pub window_size: usize,
    pub window_success_rate_percent: f64,
    pub window_average_latency_ms: f64,
}

/// Full health snapshot of the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub initialized: bool,
    /// `None` when no detector is configured
    pub detector: Option<DetectorStatus>,
    pub controller: ControllerStatus,
    pub device_map: BTreeMap<String, usize>,
    pub host_memory: HostMemory,
    pub performance: PerformanceReport,
    pub timestamp: DateTime<Utc>,
}
