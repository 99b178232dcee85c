//! ferrovox testing harness
//!
//! Wires a full [`PipelineCoordinator`] out of mock backends, a static device
//! inventory and a private Prometheus registry, so scenario tests need no
//! accelerator, model files or global state.
//!
//! ```rust,no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use ferrovox_testing::TestHarness;
//!
//! let harness = TestHarness::builder().build()?;
//! let result = harness.coordinator.process(vec![0.1; 2560]).await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, anyhow};
use ferrovox_foundation::{
    BackendCalibrator, BackendRegistry, CalibrationConfig, Candidate, CoordinatorConfig,
    DeviceCapability, FallbackController, FallbackPolicy, MockBackendLoader, PipelineCoordinator,
    PipelineResult, ResourceConfig, ResourceMonitor, StaticProbe,
};
use ferrovox_kernel::{LogicalComponent, MetricsSink, SpeechScore, Tier};
use ferrovox_monitoring::{LoggingConfig, PrometheusMetrics, init_logging};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifier of the mock detector registered when detection is enabled
pub const DETECTOR_ID: &str = "mock-detector";

/// Install test logging once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = init_logging(&LoggingConfig::new().with_filter("ferrovox=debug"));
}

/// A 24 GB card and a 16 GB card, mapped generator:0 / transcriber:1
pub fn two_gpu_host() -> Vec<DeviceCapability> {
    vec![
        DeviceCapability::new(0, "NVIDIA GeForce RTX 3090", 24.0, 20.0),
        DeviceCapability::new(1, "NVIDIA GeForce RTX 4060 Ti", 16.0, 12.0),
    ]
}

pub struct TestHarness {
    pub coordinator: Arc<PipelineCoordinator>,
    pub controller: Arc<FallbackController>,
    pub probe: Arc<StaticProbe>,
    pub metrics: Arc<PrometheusMetrics>,
    loaders: BTreeMap<String, Arc<MockBackendLoader>>,
}

impl TestHarness {
    pub fn builder() -> TestHarnessBuilder {
        TestHarnessBuilder::default()
    }

    /// Mock loader registered under `identifier`.
    pub fn loader(&self, identifier: &str) -> anyhow::Result<Arc<MockBackendLoader>> {
        self.loaders
            .get(identifier)
            .cloned()
            .ok_or_else(|| anyhow!("no mock loader registered for '{identifier}'"))
    }

    /// Mock loader serving `component` at `tier` under the harness policy.
    pub fn tier_loader(
        &self,
        component: LogicalComponent,
        tier: Tier,
    ) -> anyhow::Result<Arc<MockBackendLoader>> {
        let policy = self
            .controller
            .policy()
            .get(component)
            .with_context(|| format!("no policy for {component}"))?;
        self.loader(policy.identifier(tier))
    }

    /// Run `n` requests back to back.
    pub async fn process_n(&self, n: usize, samples: usize) -> Vec<PipelineResult> {
        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(self.coordinator.process(vec![0.1; samples]).await);
        }
        results
    }

    pub fn active_tier(&self, component: LogicalComponent) -> Option<Tier> {
        self.controller.active_tier(component)
    }

    pub async fn shutdown(&self) {
        self.coordinator.shutdown().await;
    }
}

pub struct TestHarnessBuilder {
    policy: FallbackPolicy,
    coordinator: CoordinatorConfig,
    resource: ResourceConfig,
    devices: Vec<DeviceCapability>,
    detector: Option<SpeechScore>,
}

impl Default for TestHarnessBuilder {
    fn default() -> Self {
        Self {
            policy: FallbackPolicy::builtin(),
            coordinator: CoordinatorConfig::default(),
            resource: ResourceConfig::default(),
            devices: two_gpu_host(),
            detector: None,
        }
    }
}

impl TestHarnessBuilder {
    pub fn policy(mut self, policy: FallbackPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn coordinator(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    pub fn resource(mut self, config: ResourceConfig) -> Self {
        self.resource = config;
        self
    }

    pub fn devices(mut self, devices: Vec<DeviceCapability>) -> Self {
        self.devices = devices;
        self
    }

    /// Enable detection with a mock detector that always answers `score`.
    pub fn detector(mut self, score: SpeechScore) -> Self {
        self.detector = Some(score);
        self
    }

    pub fn build(self) -> anyhow::Result<TestHarness> {
        let mut loaders = BTreeMap::new();
        let registry = BackendRegistry::new();
        for (_, policy) in self.policy.components() {
            for identifier in [&policy.primary, &policy.fallback] {
                if loaders.contains_key(identifier.as_str()) {
                    continue;
                }
                let loader = Arc::new(MockBackendLoader::new(identifier.as_str()));
                registry.register(loader.clone());
                loaders.insert(identifier.clone(), loader);
            }
        }

        let probe = Arc::new(StaticProbe::new(self.devices));
        let monitor = ResourceMonitor::new(self.resource, probe.clone());
        let metrics = Arc::new(PrometheusMetrics::new()?);
        let sink: Arc<dyn MetricsSink> = metrics.clone();

        let controller = Arc::new(FallbackController::new(
            self.policy,
            registry,
            monitor,
            sink.clone(),
        ));

        let mut coordinator = PipelineCoordinator::new(self.coordinator, controller.clone(), sink);
        if let Some(score) = self.detector {
            let detector = Arc::new(MockBackendLoader::detector(DETECTOR_ID, score));
            loaders.insert(DETECTOR_ID.to_string(), detector.clone());
            let calibration = CalibrationConfig::default()
                .with_iterations(1, 3)
                .map_err(|e| anyhow!(e))?;
            coordinator = coordinator.with_calibrator(Arc::new(BackendCalibrator::new(
                calibration,
                vec![Candidate::new(detector)],
            )));
        }

        Ok(TestHarness {
            coordinator: Arc::new(coordinator),
            controller,
            probe,
            metrics,
            loaders,
        })
    }
}
