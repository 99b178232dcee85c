//! BackendCalibrator - one-shot detector selection
//!
//! At startup every candidate detector is loaded in priority order, warmed up
//! on a synthetic chunk, and timed. The first candidate whose mean latency
//! fits the budget is selected. When none qualifies the calibrator enters a
//! permanent pass-through mode that reports every chunk as active.
//!
//! ```text
//! Uninitialized -> Probing(i) -> Selected(backend)
//!                            \-> Degraded (pass-through)
//! ```
//!
//! Everything here is synchronous; the coordinator runs [`BackendCalibrator::calibrate`]
//! on a blocking worker before it accepts traffic.

use ferrovox_kernel::{
    BackendCapabilities, BackendError, BackendHandle, BackendLoader, LoadRequest,
    LogicalComponent, StageInput, StageOutput, Tier,
};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for detector calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub sample_rate: u32,
    pub chunk_ms: u32,
    /// A candidate is accepted when its mean latency is at or below this
    pub latency_budget_ms: f64,
    pub warmup_iterations: usize,
    pub timed_iterations: usize,
    /// Probability strictly above this counts as speech
    pub activity_threshold: f32,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            chunk_ms: 160,
            latency_budget_ms: 25.0,
            warmup_iterations: 5,
            timed_iterations: 20,
            activity_threshold: 0.5,
        }
    }
}

impl CalibrationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples per chunk (2560 at 16 kHz / 160 ms)
    pub fn chunk_samples(&self) -> usize {
        (self.sample_rate as u64 * self.chunk_ms as u64 / 1000) as usize
    }

    pub fn with_latency_budget_ms(mut self, budget_ms: f64) -> Result<Self, &'static str> {
        if !budget_ms.is_finite() || budget_ms <= 0.0 {
            return Err("latency_budget_ms must be > 0");
        }
        self.latency_budget_ms = budget_ms;
        Ok(self)
    }

    pub fn with_chunk_ms(mut self, chunk_ms: u32) -> Result<Self, &'static str> {
        if chunk_ms == 0 {
            return Err("chunk_ms must be > 0");
        }
        self.chunk_ms = chunk_ms;
        Ok(self)
    }

    pub fn with_iterations(mut self, warmup: usize, timed: usize) -> Result<Self, &'static str> {
        if timed == 0 {
            return Err("timed_iterations must be > 0");
        }
        self.warmup_iterations = warmup;
        self.timed_iterations = timed;
        Ok(self)
    }

    pub fn with_activity_threshold(mut self, threshold: f32) -> Result<Self, &'static str> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err("activity_threshold must be between 0.0 and 1.0");
        }
        self.activity_threshold = threshold;
        Ok(self)
    }
}

/// A detector implementation offered for calibration
#[derive(Clone)]
pub struct Candidate {
    pub loader: Arc<dyn BackendLoader>,
    /// Overrides `CalibrationConfig::warmup_iterations`
    pub warmup_iterations: Option<usize>,
    /// Overrides `CalibrationConfig::timed_iterations`
    pub timed_iterations: Option<usize>,
}

impl Candidate {
    pub fn new(loader: Arc<dyn BackendLoader>) -> Self {
        Self {
            loader,
            warmup_iterations: None,
            timed_iterations: None,
        }
    }

    /// Cheap backends get more iterations for a stable mean.
    pub fn with_iterations(mut self, warmup: usize, timed: usize) -> Self {
        self.warmup_iterations = Some(warmup);
        self.timed_iterations = Some(timed.max(1));
        self
    }
}

/// Calibration state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CalibrationState {
    Uninitialized,
    Probing { candidate: usize },
    Selected { backend: String },
    /// No candidate qualified; every chunk is treated as active
    Degraded,
}

/// Latency summary over a batch of timed runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub mean_ms: f64,
    pub std_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub samples: usize,
}

impl LatencyStats {
    /// `None` for an empty slice.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let n = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
        Some(Self {
            mean_ms: mean,
            std_ms: variance.sqrt(),
            min_ms: samples.iter().copied().fold(f64::INFINITY, f64::min),
            max_ms: samples.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            samples: samples.len(),
        })
    }
}

/// What happened when a candidate was probed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeOutcome {
    pub candidate: String,
    pub loaded: bool,
    pub accepted: bool,
    pub stats: Option<LatencyStats>,
    pub error: Option<String>,
}

/// Result of running one chunk through the detector
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub active: bool,
    pub probability: f32,
    /// Set when the backend failed and the verdict is the fail-open default
    pub fault: Option<BackendError>,
}

impl Detection {
    fn pass_through() -> Self {
        Self {
            active: true,
            probability: 1.0,
            fault: None,
        }
    }

    fn failed_open(fault: BackendError) -> Self {
        Self {
            active: true,
            probability: 0.5,
            fault: Some(fault),
        }
    }
}

/// Status block for health reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorStatus {
    pub backend: String,
    pub state: CalibrationState,
    pub sample_rate: u32,
    pub chunk_ms: u32,
    pub chunk_samples: usize,
    pub latency_budget_ms: f64,
    pub probability_capable: bool,
    pub outcomes: Vec<ProbeOutcome>,
}

struct SelectedDetector {
    handle: BackendHandle,
    capabilities: BackendCapabilities,
}

/// Chooses and then serves the speech detector.
pub struct BackendCalibrator {
    config: CalibrationConfig,
    candidates: Vec<Candidate>,
    state: RwLock<CalibrationState>,
    selected: RwLock<Option<SelectedDetector>>,
    outcomes: RwLock<Vec<ProbeOutcome>>,
}

impl BackendCalibrator {
    pub fn new(config: CalibrationConfig, candidates: Vec<Candidate>) -> Self {
        Self {
            config,
            candidates,
            state: RwLock::new(CalibrationState::Uninitialized),
            selected: RwLock::new(None),
            outcomes: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn state(&self) -> CalibrationState {
        self.state.read().clone()
    }

    /// Probe candidates in order and settle on one, or on pass-through.
    ///
    /// Runs once; later calls return the settled state. Blocks for the
    /// duration of all loads and timed runs.
    pub fn calibrate(&self) -> CalibrationState {
        {
            let state = self.state.read();
            if matches!(
                *state,
                CalibrationState::Selected { .. } | CalibrationState::Degraded
            ) {
                return state.clone();
            }
        }

        let chunk = self.synthetic_chunk();
        let mut outcomes = Vec::with_capacity(self.candidates.len());

        for (i, candidate) in self.candidates.iter().enumerate() {
            *self.state.write() = CalibrationState::Probing { candidate: i };
            let name = candidate.loader.identifier().to_string();
            debug!(candidate = %name, "probing detector");

            let (outcome, handle) = self.probe_candidate(candidate, &chunk);
            let accepted = outcome.accepted;
            outcomes.push(outcome);

            if let (true, Some(handle)) = (accepted, handle) {
                let capabilities = handle.capabilities();
                info!(
                    backend = %name,
                    mean_ms = outcomes.last().and_then(|o| o.stats.as_ref()).map(|s| s.mean_ms),
                    "detector selected"
                );
                *self.selected.write() = Some(SelectedDetector {
                    handle,
                    capabilities,
                });
                *self.outcomes.write() = outcomes;
                let state = CalibrationState::Selected { backend: name };
                *self.state.write() = state.clone();
                return state;
            }
        }

        warn!(
            candidates = self.candidates.len(),
            "no detector met the {}ms budget, using pass-through",
            self.config.latency_budget_ms
        );
        *self.outcomes.write() = outcomes;
        *self.state.write() = CalibrationState::Degraded;
        CalibrationState::Degraded
    }

    fn probe_candidate(
        &self,
        candidate: &Candidate,
        chunk: &[f32],
    ) -> (ProbeOutcome, Option<BackendHandle>) {
        let name = candidate.loader.identifier().to_string();
        let request = LoadRequest::new(LogicalComponent::Detector, Tier::Primary, &name);

        let handle = match candidate.loader.load(&request) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(candidate = %name, "detector load failed: {}", e);
                return (
                    ProbeOutcome {
                        candidate: name,
                        loaded: false,
                        accepted: false,
                        stats: None,
                        error: Some(e.to_string()),
                    },
                    None,
                );
            }
        };

        let warmup = candidate
            .warmup_iterations
            .unwrap_or(self.config.warmup_iterations);
        let timed = candidate
            .timed_iterations
            .unwrap_or(self.config.timed_iterations)
            .max(1);

        match time_runs(&handle, chunk, warmup, timed) {
            Ok(stats) => {
                let accepted = stats.mean_ms <= self.config.latency_budget_ms;
                info!(
                    candidate = %name,
                    mean_ms = stats.mean_ms,
                    std_ms = stats.std_ms,
                    max_ms = stats.max_ms,
                    accepted,
                    "detector probed"
                );
                if !accepted {
                    release_quietly(&handle, &name);
                }
                let outcome = ProbeOutcome {
                    candidate: name,
                    loaded: true,
                    accepted,
                    stats: Some(stats),
                    error: None,
                };
                (outcome, accepted.then_some(handle))
            }
            Err(e) => {
                warn!(candidate = %name, "detector failed during probing: {}", e);
                release_quietly(&handle, &name);
                (
                    ProbeOutcome {
                        candidate: name,
                        loaded: true,
                        accepted: false,
                        stats: None,
                        error: Some(e.to_string()),
                    },
                    None,
                )
            }
        }
    }

    fn synthetic_chunk(&self) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..self.config.chunk_samples())
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect()
    }

    /// Right-pad with silence or truncate to the configured chunk size.
    pub fn normalize(&self, chunk: &[f32]) -> Vec<f32> {
        let target = self.config.chunk_samples();
        let mut samples: Vec<f32> = chunk.iter().copied().take(target).collect();
        samples.resize(target, 0.0);
        samples
    }

    /// Run one chunk through the selected detector.
    ///
    /// Pass-through (or not yet calibrated) reports active with probability
    /// 1.0. A backend failure reports active with probability 0.5 and carries
    /// the fault.
    pub fn detect(&self, chunk: &[f32]) -> Detection {
        let selected = self.selected.read();
        let Some(detector) = selected.as_ref() else {
            return Detection::pass_through();
        };

        let input = StageInput::Audio(self.normalize(chunk));
        match detector.handle.operate(input) {
            Ok(StageOutput::Speech(score)) => Detection {
                active: score.is_active(self.config.activity_threshold),
                probability: score.probability(),
                fault: None,
            },
            Ok(other) => Detection::failed_open(BackendError::internal(format!(
                "detector returned {other} instead of a speech score"
            ))),
            Err(e) => {
                warn!(backend = detector.handle.name(), "detector error: {}", e);
                Detection::failed_open(e)
            }
        }
    }

    pub fn is_active(&self, chunk: &[f32]) -> bool {
        self.detect(chunk).active
    }

    pub fn probability(&self, chunk: &[f32]) -> f32 {
        self.detect(chunk).probability
    }

    /// Re-time the selected detector; `None` in pass-through.
    pub fn benchmark(&self, iterations: usize) -> Option<LatencyStats> {
        let selected = self.selected.read();
        let detector = selected.as_ref()?;
        let chunk = self.synthetic_chunk();
        match time_runs(&detector.handle, &chunk, 0, iterations.max(1)) {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("detector benchmark failed: {}", e);
                None
            }
        }
    }

    pub fn backend_name(&self) -> String {
        match &*self.selected.read() {
            Some(detector) => detector.handle.name().to_string(),
            None => "none".to_string(),
        }
    }

    pub fn status(&self) -> DetectorStatus {
        DetectorStatus {
            backend: self.backend_name(),
            state: self.state(),
            sample_rate: self.config.sample_rate,
            chunk_ms: self.config.chunk_ms,
            chunk_samples: self.config.chunk_samples(),
            latency_budget_ms: self.config.latency_budget_ms,
            probability_capable: self
                .selected
                .read()
                .as_ref()
                .map(|d| d.capabilities.probability)
                .unwrap_or(false),
            outcomes: self.outcomes.read().clone(),
        }
    }
}

fn time_runs(
    handle: &BackendHandle,
    chunk: &[f32],
    warmup: usize,
    timed: usize,
) -> Result<LatencyStats, BackendError> {
    for _ in 0..warmup {
        handle.operate(StageInput::Audio(chunk.to_vec()))?;
    }

    let mut latencies = Vec::with_capacity(timed);
    for _ in 0..timed {
        let input = StageInput::Audio(chunk.to_vec());
        let start = Instant::now();
        handle.operate(input)?;
        latencies.push(start.elapsed().as_secs_f64() * 1000.0);
    }

    LatencyStats::from_samples(&latencies)
        .ok_or_else(|| BackendError::internal("no timed iterations"))
}

fn release_quietly(handle: &BackendHandle, name: &str) {
    if handle.capabilities().release {
        if let Err(e) = handle.release() {
            debug!(candidate = %name, "release after rejected probe failed: {}", e);
        }
    }
}
