//! PipelineCoordinator - detect, transcribe, optionally enhance
//!
//! One request flows through the calibrated detector, then through whatever
//! transcriber the fallback controller currently serves, then optionally
//! through the generator for text enhancement. Every backend call runs on the
//! blocking pool under a tokio timeout, so a backend that never returns only
//! costs its worker thread; the coordinator moves on and discards the late
//! result.
//!
//! [`PipelineCoordinator::process`] never fails. Stage errors, timeouts and
//! panics are folded into the returned [`PipelineResult`].

mod config;
mod result;

pub use config::{CoordinatorConfig, RuntimeConfig};
pub use result::{
    HealthReport, HealthStatus, PerformanceReport, PipelineResult, STAGE_DETECTION,
    STAGE_ENHANCEMENT, STAGE_TRANSCRIPTION, StageDetail,
};

use crate::calibration::{BackendCalibrator, Detection};
use crate::fallback::{ActiveComponent, FallbackController};
use crate::resource::ResourceMonitor;
use chrono::Utc;
use ferrovox_kernel::{
    BackendError, BackendHandle, FaultKind, LogicalComponent, MetricsSink, RequestOutcome,
    StageInput, StageMetrics, StageOutput, VoxError,
};
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

/// Why a backend call produced no output
#[derive(Debug)]
enum CallError {
    Timeout,
    Backend(BackendError),
    Panicked(String),
}

struct RequestRecord {
    finished_at: Instant,
    success: bool,
    latency_ms: f64,
}

#[derive(Default)]
struct Counters {
    processed: u64,
    errors: u64,
    total_latency_ms: f64,
    stage_errors: BTreeMap<String, u64>,
}

/// Sequences the voice pipeline over shared controller and monitor state.
pub struct PipelineCoordinator {
    config: CoordinatorConfig,
    calibrator: Option<Arc<BackendCalibrator>>,
    controller: Arc<FallbackController>,
    monitor: ResourceMonitor,
    metrics: Arc<dyn MetricsSink>,
    init: OnceCell<()>,
    /// Metrics of the latest call per component, fed into the next lookup
    feedback: Mutex<HashMap<LogicalComponent, StageMetrics>>,
    counters: Mutex<Counters>,
    window: Mutex<VecDeque<RequestRecord>>,
}

impl PipelineCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        controller: Arc<FallbackController>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let monitor = controller.monitor().clone();
        Self {
            config,
            calibrator: None,
            controller,
            monitor,
            metrics,
            init: OnceCell::new(),
            feedback: Mutex::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            window: Mutex::new(VecDeque::new()),
        }
    }

    /// Use a speech detector. Without one every chunk counts as speech.
    pub fn with_calibrator(mut self, calibrator: Arc<BackendCalibrator>) -> Self {
        self.calibrator = Some(calibrator);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn controller(&self) -> &Arc<FallbackController> {
        &self.controller
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Calibrate the detector, preload components and start device refresh.
    ///
    /// Idempotent; concurrent callers wait for the first initialisation.
    pub async fn initialize(&self) {
        self.init
            .get_or_init(|| async {
                info!("initializing pipeline coordinator");

                if let Some(calibrator) = &self.calibrator {
                    let calibrator = calibrator.clone();
                    match tokio::task::spawn_blocking(move || calibrator.calibrate()).await {
                        Ok(state) => info!(?state, "detector calibration finished"),
                        Err(e) => error!("detector calibration worker failed: {}", e),
                    }
                }

                for component in self.config.preload.iter().copied() {
                    let controller = self.controller.clone();
                    match tokio::task::spawn_blocking(move || controller.preload(component)).await
                    {
                        Ok(true) => debug!(%component, "preloaded"),
                        Ok(false) => warn!(%component, "preload failed, component unavailable"),
                        Err(e) => error!(%component, "preload worker failed: {}", e),
                    }
                }

                self.monitor.start_background_refresh(self.metrics.clone());
                info!("pipeline coordinator ready");
            })
            .await;
    }

    /// Run one audio chunk through the pipeline.
    pub async fn process(&self, audio: Vec<f32>) -> PipelineResult {
        let request_id = Uuid::new_v4();
        let span = info_span!("pipeline_request", %request_id);
        let start = Instant::now();
        let mut result = PipelineResult::new(request_id);

        let outcome = AssertUnwindSafe(self.run(audio, &mut result))
            .catch_unwind()
            .instrument(span)
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => result.fail(RequestOutcome::Error, e),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(%request_id, "pipeline panicked: {}", message);
                result.fail(RequestOutcome::Error, format!("pipeline panicked: {message}"));
            }
        }

        result.latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.record(&result);
        result
    }

    async fn run(&self, audio: Vec<f32>, result: &mut PipelineResult) -> Result<(), VoxError> {
        self.initialize().await;

        if !self.detect(&audio, result).await {
            debug!("no speech detected");
            result.succeed(String::new(), 0.0);
            return Ok(());
        }

        let Some((text, confidence)) = self.transcribe(audio, result).await else {
            return Ok(());
        };

        let text = if self.config.enable_enhancement {
            self.enhance(text, result).await
        } else {
            text
        };

        result.succeed(text, confidence);
        Ok(())
    }

    /// Detection stage. Fails open: anything but a clean negative is speech.
    async fn detect(&self, audio: &[f32], result: &mut PipelineResult) -> bool {
        let Some(calibrator) = &self.calibrator else {
            let mut detail = StageDetail::new("disabled");
            detail.success = true;
            detail.skipped = true;
            result.stages.insert(STAGE_DETECTION.to_string(), detail);
            return true;
        };

        let mut detail = StageDetail::new(calibrator.backend_name());
        let start = Instant::now();
        let worker = calibrator.clone();
        let chunk = audio.to_vec();
        let call = tokio::task::spawn_blocking(move || worker.detect(&chunk));
        let detection = match tokio::time::timeout(self.config.detection_timeout(), call).await {
            Ok(Ok(detection)) => detection,
            Ok(Err(e)) => Detection {
                active: true,
                probability: 0.5,
                fault: Some(BackendError::internal(format!("detector worker failed: {e}"))),
            },
            Err(_) => Detection {
                active: true,
                probability: 0.5,
                fault: Some(BackendError::new(
                    FaultKind::Timeout,
                    VoxError::timeout(STAGE_DETECTION, self.config.detection_timeout_ms)
                        .to_string(),
                )),
            },
        };
        let elapsed = start.elapsed();

        detail.latency_ms = elapsed.as_secs_f64() * 1000.0;
        detail.probability = Some(detection.probability);
        detail.success = detection.fault.is_none();
        if let Some(fault) = &detection.fault {
            warn!("detection failed open: {}", fault);
            detail.error = Some(fault.to_string());
            self.count_stage_error(STAGE_DETECTION);
        }
        self.metrics
            .record_stage_latency(STAGE_DETECTION, &detail.backend, elapsed.as_secs_f64());
        self.metrics
            .set_detection_probability(f64::from(detection.probability));

        result.stages.insert(STAGE_DETECTION.to_string(), detail);
        detection.active
    }

    /// Transcription stage with one out-of-memory retry on the fallback.
    ///
    /// Returns `None` after recording the failure on `result`.
    async fn transcribe(
        &self,
        audio: Vec<f32>,
        result: &mut PipelineResult,
    ) -> Option<(String, f32)> {
        let component = LogicalComponent::Transcriber;
        let stage_start = Instant::now();

        let Some(active) = self.acquire(component).await else {
            let err = VoxError::LoadFailure {
                component,
                tier: ferrovox_kernel::Tier::Primary,
                reason: "no transcriber backend available".to_string(),
            };
            self.stage_failed(result, STAGE_TRANSCRIPTION, StageDetail::new("none"), RequestOutcome::Error, err);
            return None;
        };

        let mut detail = StageDetail::new(&active.identifier);
        detail.tier = Some(active.tier);

        let budget = self.config.transcription_timeout();
        let mut call = self
            .call(component, &active, StageInput::Audio(audio.clone()), budget)
            .await;

        let out_of_memory = matches!(&call, Err(CallError::Backend(e)) if e.is_out_of_memory());
        if out_of_memory {
            warn!(backend = %active.identifier, "out of memory, retrying on fallback");
            let controller = self.controller.clone();
            let fault = self.feedback.lock().remove(&component);
            let retry = tokio::task::spawn_blocking(move || {
                // Lands the out-of-memory sample in history before the retry
                // call replaces it.
                controller.acquire(component, fault.as_ref());
                controller.force_fallback(component);
                controller.acquire(component, None)
            })
            .await
            .ok()
            .flatten();

            if let Some(retry) = retry {
                detail.backend = retry.identifier.clone();
                detail.tier = Some(retry.tier);
                detail.retried = true;
                call = self
                    .call(component, &retry, StageInput::Audio(audio), self.config.retry_timeout())
                    .await;
            }
        }
        detail.latency_ms = stage_start.elapsed().as_secs_f64() * 1000.0;

        let budget_ms = if detail.retried {
            self.config.retry_timeout_ms
        } else {
            self.config.transcription_timeout_ms
        };

        let output = match call {
            Ok(output) => output,
            Err(CallError::Timeout) => {
                let err = VoxError::timeout(STAGE_TRANSCRIPTION, budget_ms);
                self.stage_failed(result, STAGE_TRANSCRIPTION, detail, RequestOutcome::Timeout, err);
                return None;
            }
            Err(CallError::Backend(e)) => {
                let err = VoxError::backend(component, e);
                self.stage_failed(result, STAGE_TRANSCRIPTION, detail, RequestOutcome::Error, err);
                return None;
            }
            Err(CallError::Panicked(message)) => {
                let err = VoxError::backend(component, format!("backend panicked: {message}"));
                self.stage_failed(result, STAGE_TRANSCRIPTION, detail, RequestOutcome::Error, err);
                return None;
            }
        };

        let (text, confidence) = match output {
            StageOutput::Transcript { text, confidence } => (text, confidence),
            StageOutput::Text(text) => (text, None),
            other => {
                let err = VoxError::backend(component, format!("unexpected output: {other}"));
                self.stage_failed(result, STAGE_TRANSCRIPTION, detail, RequestOutcome::Error, err);
                return None;
            }
        };

        let text = text.trim().to_string();
        if text.is_empty() {
            let err = VoxError::backend(component, "empty transcription");
            self.stage_failed(result, STAGE_TRANSCRIPTION, detail, RequestOutcome::Error, err);
            return None;
        }

        detail.success = true;
        result.stages.insert(STAGE_TRANSCRIPTION.to_string(), detail);
        Some((
            text,
            confidence
                .unwrap_or(self.config.default_confidence)
                .clamp(0.0, 1.0),
        ))
    }

    /// Enhancement stage. Any failure or empty output keeps `text`.
    async fn enhance(&self, text: String, result: &mut PipelineResult) -> String {
        let component = LogicalComponent::Generator;
        let stage_start = Instant::now();

        let Some(active) = self.acquire(component).await else {
            let mut detail = StageDetail::new("none");
            detail.skipped = true;
            detail.error = Some("no generator backend available".to_string());
            self.count_stage_error(STAGE_ENHANCEMENT);
            result.stages.insert(STAGE_ENHANCEMENT.to_string(), detail);
            return text;
        };

        let mut detail = StageDetail::new(&active.identifier);
        detail.tier = Some(active.tier);
        let call = self
            .call(
                component,
                &active,
                StageInput::Text(text.clone()),
                self.config.enhancement_timeout(),
            )
            .await;
        detail.latency_ms = stage_start.elapsed().as_secs_f64() * 1000.0;

        let enhanced = match call {
            Ok(output) => output.text().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) => {
                warn!(backend = %active.identifier, "enhancement failed: {:?}", e);
                detail.error = Some(match e {
                    CallError::Timeout => {
                        VoxError::timeout(STAGE_ENHANCEMENT, self.config.enhancement_timeout_ms)
                            .to_string()
                    }
                    CallError::Backend(e) => VoxError::backend(component, e).to_string(),
                    CallError::Panicked(m) => VoxError::backend(component, m).to_string(),
                });
                self.count_stage_error(STAGE_ENHANCEMENT);
                None
            }
        };

        detail.success = detail.error.is_none();
        let text = match enhanced {
            Some(enhanced) => enhanced,
            None => {
                detail.skipped = true;
                text
            }
        };
        result.stages.insert(STAGE_ENHANCEMENT.to_string(), detail);
        text
    }

    /// Look up a component on a worker, feeding back its previous call.
    async fn acquire(&self, component: LogicalComponent) -> Option<ActiveComponent> {
        let previous = self.feedback.lock().remove(&component);
        let controller = self.controller.clone();
        match tokio::task::spawn_blocking(move || controller.acquire(component, previous.as_ref()))
            .await
        {
            Ok(active) => active,
            Err(e) => {
                error!(%component, "component lookup worker failed: {}", e);
                None
            }
        }
    }

    /// Invoke a backend on the blocking pool under `budget`.
    ///
    /// A timed-out call keeps running on its worker; its output is dropped.
    async fn call(
        &self,
        component: LogicalComponent,
        active: &ActiveComponent,
        input: StageInput,
        budget: Duration,
    ) -> Result<StageOutput, CallError> {
        let handle: BackendHandle = active.handle.clone();
        let start = Instant::now();
        let task = tokio::task::spawn_blocking(move || handle.operate(input));
        let outcome = match tokio::time::timeout(budget, task).await {
            Err(_) => Err(CallError::Timeout),
            Ok(Err(e)) => Err(CallError::Panicked(e.to_string())),
            Ok(Ok(Err(e))) => Err(CallError::Backend(e)),
            Ok(Ok(Ok(output))) => Ok(output),
        };
        let elapsed = start.elapsed();
        let latency_ms = elapsed.as_secs_f64() * 1000.0;

        let stage = match component {
            LogicalComponent::Generator => STAGE_ENHANCEMENT,
            _ => STAGE_TRANSCRIPTION,
        };
        self.metrics
            .record_stage_latency(stage, &active.identifier, elapsed.as_secs_f64());

        let mut feedback = StageMetrics::latency(latency_ms);
        match &outcome {
            Err(CallError::Timeout) => feedback = feedback.with_fault(FaultKind::Timeout),
            Err(CallError::Backend(e)) => feedback = feedback.with_fault(e.kind.clone()),
            Err(CallError::Panicked(_)) => feedback = feedback.with_fault(FaultKind::Internal),
            Ok(_) => {}
        }
        debug!(
            %component,
            tier = %active.tier,
            backend = %active.identifier,
            latency_ms,
            fault = ?feedback.fault,
            "backend call finished"
        );
        self.feedback.lock().insert(component, feedback);

        outcome
    }

    fn stage_failed(
        &self,
        result: &mut PipelineResult,
        stage: &str,
        mut detail: StageDetail,
        outcome: RequestOutcome,
        err: VoxError,
    ) {
        warn!(stage, "{}", err);
        detail.success = false;
        detail.error = Some(err.to_string());
        result.stages.insert(stage.to_string(), detail);
        self.count_stage_error(stage);
        result.fail(outcome, err);
    }

    fn count_stage_error(&self, stage: &str) {
        *self
            .counters
            .lock()
            .stage_errors
            .entry(stage.to_string())
            .or_insert(0) += 1;
    }

    fn record(&self, result: &PipelineResult) {
        self.metrics.record_request(result.outcome);
        {
            let mut counters = self.counters.lock();
            counters.processed += 1;
            counters.total_latency_ms += result.latency_ms;
            if !result.success {
                counters.errors += 1;
            }
        }

        let now = Instant::now();
        let retention = self.config.retention();
        let mut window = self.window.lock();
        window.push_back(RequestRecord {
            finished_at: now,
            success: result.success,
            latency_ms: result.latency_ms,
        });
        while window
            .front()
            .is_some_and(|r| now.duration_since(r.finished_at) > retention)
        {
            window.pop_front();
        }

        info!(
            request_id = %result.request_id,
            outcome = %result.outcome,
            latency_ms = result.latency_ms,
            "pipeline request finished"
        );
    }

    /// Lifetime error rate in percent; 0 before the first request.
    pub fn error_rate(&self) -> f64 {
        let counters = self.counters.lock();
        if counters.processed == 0 {
            0.0
        } else {
            counters.errors as f64 / counters.processed as f64 * 100.0
        }
    }

    pub fn health_status(&self) -> HealthStatus {
        HealthStatus::from_error_rate(self.error_rate())
    }

    /// Lifetime counters plus a summary of the retention window.
    pub fn performance(&self) -> PerformanceReport {
        let error_rate_percent = self.error_rate();
        let counters = self.counters.lock();
        let average_latency_ms = if counters.processed == 0 {
            0.0
        } else {
            counters.total_latency_ms / counters.processed as f64
        };

        let window = self.window.lock();
        let (window_success_rate_percent, window_average_latency_ms) = if window.is_empty() {
            (0.0, 0.0)
        } else {
            let n = window.len() as f64;
            let successes = window.iter().filter(|r| r.success).count() as f64;
            let latency = window.iter().map(|r| r.latency_ms).sum::<f64>() / n;
            (successes / n * 100.0, latency)
        };

        PerformanceReport {
            requests_processed: counters.processed,
            average_latency_ms,
            error_rate_percent,
            stage_errors: counters.stage_errors.clone(),
            window_size: window.len(),
            window_success_rate_percent,
            window_average_latency_ms,
        }
    }

    /// Health, detector and controller status, device map and host memory.
    pub fn health_report(&self) -> HealthReport {
        HealthReport {
            status: self.health_status(),
            initialized: self.is_initialized(),
            detector: self.calibrator.as_ref().map(|c| c.status()),
            controller: self.controller.status(),
            device_map: self.monitor.device_map().entries().clone(),
            host_memory: self.monitor.host_memory(),
            performance: self.performance(),
            timestamp: Utc::now(),
        }
    }

    /// Stop the background device refresh.
    pub async fn shutdown(&self) {
        info!("pipeline coordinator shutting down");
        self.monitor.shutdown().await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
