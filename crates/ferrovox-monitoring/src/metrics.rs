//! Prometheus implementation of [`MetricsSink`].

use crate::MonitoringError;
use ferrovox_kernel::{DeviceMemory, LogicalComponent, MetricsSink, RequestOutcome, Tier};
use prometheus::{
    Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};

// Metric name constants to avoid typos across crates.

/// Per-stage call latency (histogram, labels: stage, backend)
pub const STAGE_LATENCY_SECONDS: &str = "ferrovox_stage_latency_seconds";
/// Finished pipeline requests (counter, labels: status)
pub const PIPELINE_REQUESTS_TOTAL: &str = "ferrovox_pipeline_requests_total";
/// Active tier per component (gauge, labels: component, tier). 1 = active.
pub const COMPONENT_ACTIVE: &str = "ferrovox_component_active";
/// Backend load time (histogram, labels: component, tier)
pub const MODEL_LOAD_SECONDS: &str = "ferrovox_model_load_seconds";
/// Failed backend loads (counter, labels: component, tier)
pub const BACKEND_LOAD_FAILURES_TOTAL: &str = "ferrovox_backend_load_failures_total";
/// Primary → fallback swaps (counter, labels: component)
pub const TIER_SWAPS_TOTAL: &str = "ferrovox_tier_swaps_total";
/// Latest detector probability (gauge)
pub const SPEECH_PROBABILITY: &str = "ferrovox_speech_probability";
/// Device memory (gauges, labels: device, device_name)
pub const DEVICE_MEMORY_FREE_BYTES: &str = "ferrovox_device_memory_free_bytes";
pub const DEVICE_MEMORY_TOTAL_BYTES: &str = "ferrovox_device_memory_total_bytes";
pub const DEVICE_MEMORY_USED_BYTES: &str = "ferrovox_device_memory_used_bytes";
pub const DEVICE_UTILIZATION_PERCENT: &str = "ferrovox_device_utilization_percent";

const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0,
];
const LOAD_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

const TIERS: [Tier; 2] = [Tier::Primary, Tier::Fallback];

/// Metrics sink over its own registry.
///
/// Nothing is registered globally, so several instances can coexist (one
/// per test, for example).
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    stage_latency: HistogramVec,
    requests: IntCounterVec,
    component_active: GaugeVec,
    model_load: HistogramVec,
    load_failures: IntCounterVec,
    tier_swaps: IntCounterVec,
    speech_probability: Gauge,
    device_free: GaugeVec,
    device_total: GaugeVec,
    device_used: GaugeVec,
    device_utilization: GaugeVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, MonitoringError> {
        let registry = Registry::new();

        let stage_latency = HistogramVec::new(
            HistogramOpts::new(STAGE_LATENCY_SECONDS, "Backend call latency per pipeline stage")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["stage", "backend"],
        )?;
        let requests = IntCounterVec::new(
            Opts::new(PIPELINE_REQUESTS_TOTAL, "Finished pipeline requests by outcome"),
            &["status"],
        )?;
        let component_active = GaugeVec::new(
            Opts::new(COMPONENT_ACTIVE, "1 for the tier currently serving a component"),
            &["component", "tier"],
        )?;
        let model_load = HistogramVec::new(
            HistogramOpts::new(MODEL_LOAD_SECONDS, "Backend load time")
                .buckets(LOAD_BUCKETS.to_vec()),
            &["component", "tier"],
        )?;
        let load_failures = IntCounterVec::new(
            Opts::new(BACKEND_LOAD_FAILURES_TOTAL, "Failed backend loads"),
            &["component", "tier"],
        )?;
        let tier_swaps = IntCounterVec::new(
            Opts::new(TIER_SWAPS_TOTAL, "Primary to fallback swaps"),
            &["component"],
        )?;
        let speech_probability =
            Gauge::with_opts(Opts::new(SPEECH_PROBABILITY, "Latest speech probability"))?;
        let device_labels = &["device", "device_name"];
        let device_free = GaugeVec::new(
            Opts::new(DEVICE_MEMORY_FREE_BYTES, "Free accelerator memory"),
            device_labels,
        )?;
        let device_total = GaugeVec::new(
            Opts::new(DEVICE_MEMORY_TOTAL_BYTES, "Total accelerator memory"),
            device_labels,
        )?;
        let device_used = GaugeVec::new(
            Opts::new(DEVICE_MEMORY_USED_BYTES, "Used accelerator memory"),
            device_labels,
        )?;
        let device_utilization = GaugeVec::new(
            Opts::new(DEVICE_UTILIZATION_PERCENT, "Accelerator memory utilisation"),
            device_labels,
        )?;

        registry.register(Box::new(stage_latency.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(component_active.clone()))?;
        registry.register(Box::new(model_load.clone()))?;
        registry.register(Box::new(load_failures.clone()))?;
        registry.register(Box::new(tier_swaps.clone()))?;
        registry.register(Box::new(speech_probability.clone()))?;
        registry.register(Box::new(device_free.clone()))?;
        registry.register(Box::new(device_total.clone()))?;
        registry.register(Box::new(device_used.clone()))?;
        registry.register(Box::new(device_utilization.clone()))?;

        Ok(Self {
            registry,
            stage_latency,
            requests,
            component_active,
            model_load,
            load_failures,
            tier_swaps,
            speech_probability,
            device_free,
            device_total,
            device_used,
            device_utilization,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of everything recorded so far.
    pub fn render(&self) -> Result<String, MonitoringError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| MonitoringError::Encoding(e.to_string()))
    }

    pub fn request_count(&self, outcome: RequestOutcome) -> u64 {
        self.requests.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn tier_swaps(&self, component: LogicalComponent) -> u64 {
        self.tier_swaps.with_label_values(&[component.as_str()]).get()
    }
}

impl std::fmt::Debug for PrometheusMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrometheusMetrics").finish_non_exhaustive()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_stage_latency(&self, stage: &str, backend: &str, seconds: f64) {
        self.stage_latency
            .with_label_values(&[stage, backend])
            .observe(seconds);
    }

    fn record_request(&self, outcome: RequestOutcome) {
        self.requests.with_label_values(&[outcome.as_str()]).inc();
    }

    fn set_component_tier(&self, component: LogicalComponent, tier: Option<Tier>) {
        for candidate in TIERS {
            let value = if Some(candidate) == tier { 1.0 } else { 0.0 };
            self.component_active
                .with_label_values(&[component.as_str(), candidate.as_str()])
                .set(value);
        }
    }

    fn record_model_load(&self, component: LogicalComponent, tier: Tier, seconds: f64) {
        self.model_load
            .with_label_values(&[component.as_str(), tier.as_str()])
            .observe(seconds);
    }

    fn record_load_failure(&self, component: LogicalComponent, tier: Tier) {
        self.load_failures
            .with_label_values(&[component.as_str(), tier.as_str()])
            .inc();
    }

    fn record_tier_swap(&self, component: LogicalComponent) {
        self.tier_swaps.with_label_values(&[component.as_str()]).inc();
    }

    fn set_detection_probability(&self, probability: f64) {
        self.speech_probability.set(probability);
    }

    fn set_device_memory(&self, memory: &DeviceMemory) {
        let index = memory.index.to_string();
        let labels = [index.as_str(), memory.name.as_str()];
        self.device_free
            .with_label_values(&labels)
            .set(memory.free_bytes as f64);
        self.device_total
            .with_label_values(&labels)
            .set(memory.total_bytes as f64);
        self.device_used
            .with_label_values(&labels)
            .set(memory.used_bytes as f64);
        self.device_utilization
            .with_label_values(&labels)
            .set(memory.utilization_percent);
    }
}
