//! Coordinator and runtime configuration

use crate::calibration::CalibrationConfig;
use crate::resource::ResourceConfig;
use ferrovox_kernel::LogicalComponent;
use ferrovox_kernel::config::{self, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Stage budgets and behaviour of the pipeline coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub detection_timeout_ms: u64,
    pub transcription_timeout_ms: u64,
    /// Budget of the single retry after an out-of-memory fault
    pub retry_timeout_ms: u64,
    pub enhancement_timeout_ms: u64,
    pub enable_enhancement: bool,
    /// Confidence reported when the transcriber does not provide one
    pub default_confidence: f32,
    /// Age after which requests leave the rolling window
    pub retention_secs: u64,
    /// Components loaded during initialisation
    pub preload: Vec<LogicalComponent>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            detection_timeout_ms: 250,
            transcription_timeout_ms: 5_000,
            retry_timeout_ms: 10_000,
            enhancement_timeout_ms: 5_000,
            enable_enhancement: false,
            default_confidence: 0.9,
            retention_secs: 86_400,
            preload: vec![LogicalComponent::Transcriber],
        }
    }
}

impl CoordinatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_detection_timeout_ms(mut self, ms: u64) -> Result<Self, &'static str> {
        if ms == 0 {
            return Err("Detection timeout must be positive");
        }
        self.detection_timeout_ms = ms;
        Ok(self)
    }

    pub fn with_transcription_timeout_ms(mut self, ms: u64) -> Result<Self, &'static str> {
        if ms == 0 {
            return Err("Transcription timeout must be positive");
        }
        self.transcription_timeout_ms = ms;
        Ok(self)
    }

    pub fn with_retry_timeout_ms(mut self, ms: u64) -> Result<Self, &'static str> {
        if ms == 0 {
            return Err("Retry timeout must be positive");
        }
        self.retry_timeout_ms = ms;
        Ok(self)
    }

    pub fn with_enhancement_timeout_ms(mut self, ms: u64) -> Result<Self, &'static str> {
        if ms == 0 {
            return Err("Enhancement timeout must be positive");
        }
        self.enhancement_timeout_ms = ms;
        Ok(self)
    }

    pub fn with_enhancement(mut self, enabled: bool) -> Self {
        self.enable_enhancement = enabled;
        self
    }

    pub fn with_default_confidence(mut self, confidence: f32) -> Result<Self, &'static str> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err("Default confidence must be within [0, 1]");
        }
        self.default_confidence = confidence;
        Ok(self)
    }

    pub fn with_retention_secs(mut self, secs: u64) -> Self {
        self.retention_secs = secs;
        self
    }

    pub fn with_preload(mut self, components: Vec<LogicalComponent>) -> Self {
        self.preload = components;
        self
    }

    pub fn detection_timeout(&self) -> Duration {
        Duration::from_millis(self.detection_timeout_ms)
    }

    pub fn transcription_timeout(&self) -> Duration {
        Duration::from_millis(self.transcription_timeout_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }

    pub fn enhancement_timeout(&self) -> Duration {
        Duration::from_millis(self.enhancement_timeout_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Everything a process needs to assemble the core, in one document.
///
/// ```yaml
/// coordinator:
///   transcription_timeout_ms: 4000
/// resource:
///   device_map_override: "transcriber:1,generator:0"
/// policy_path: ${FERROVOX_HOME}/fallbacks.yaml
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub coordinator: CoordinatorConfig,
    pub calibration: CalibrationConfig,
    pub resource: ResourceConfig,
    pub policy_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Environment prefix for overrides, e.g. `FERROVOX_COORDINATOR__RETRY_TIMEOUT_MS`
    pub const ENV_PREFIX: &'static str = "FERROVOX";

    /// Load from a file, with `FERROVOX_*` environment overrides on top.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        config::load_with_env(path, Self::ENV_PREFIX)
    }
}
