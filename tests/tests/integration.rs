use ferrovox_foundation::fallback::HISTORY_CAPACITY;
use ferrovox_foundation::pipeline::STAGE_TRANSCRIPTION;
use ferrovox_foundation::{
    BackendRegistry, ComponentPolicy, CoordinatorConfig, FallbackController, FallbackPolicy,
    HealthStatus, PipelineCoordinator, ResourceConfig, ResourceMonitor, RuntimeConfig, StaticProbe,
};
use ferrovox_kernel::{
    Backend, BackendError, BackendHandle, BackendLoader, BackendResult, FaultKind, LoadRequest,
    LogicalComponent, NoopMetrics, RequestOutcome, SpeechScore, StageInput, StageMetrics,
    StageOutput, Tier, TriggerRule,
};
use ferrovox_testing::{TestHarness, init_test_logging};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

const T: LogicalComponent = LogicalComponent::Transcriber;

#[tokio::test]
async fn test_latency_scenario_swaps_on_second_request() {
    init_test_logging();
    let harness = TestHarness::builder().build().unwrap();
    let controller = &harness.controller;

    controller.get_component(T, Some(&StageMetrics::latency(150.0)));
    assert_eq!(harness.active_tier(T), Some(Tier::Primary));

    controller.get_component(T, Some(&StageMetrics::latency(600.0)));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let status = controller.status();
    let transcriber = &status.components[&T];
    assert_eq!(transcriber.tier, Some(Tier::Fallback));
    assert!(transcriber.uptime_secs > 0.0);
    assert_eq!(harness.metrics.tier_swaps(T), 1);
}

#[tokio::test]
async fn test_latency_threshold_is_strict() {
    let harness = TestHarness::builder().build().unwrap();
    harness
        .controller
        .get_component(T, Some(&StageMetrics::latency(500.0)));
    assert_eq!(harness.active_tier(T), Some(Tier::Primary));
    harness
        .controller
        .get_component(T, Some(&StageMetrics::latency(501.0)));
    assert_eq!(harness.active_tier(T), Some(Tier::Fallback));
}

#[tokio::test]
async fn test_force_fallback_is_visible_in_status() {
    let harness = TestHarness::builder().build().unwrap();
    assert!(harness.controller.preload(T));
    harness.controller.force_fallback(T);
    let status = harness.controller.status();
    assert_eq!(status.components[&T].tier, Some(Tier::Fallback));
    assert_eq!(status.components[&T].backend.as_deref(), Some("base"));
}

#[tokio::test]
async fn test_tier_is_monotonic_until_reset() {
    let harness = TestHarness::builder().build().unwrap();
    harness.controller.force_fallback(T);

    for latency in [10.0, 9000.0, 0.0, 499.0, 20_000.0] {
        harness
            .controller
            .get_component(T, Some(&StageMetrics::latency(latency)));
        assert_eq!(harness.active_tier(T), Some(Tier::Fallback));
    }
    harness.probe.set_free_gb(1, 16.0);
    harness.controller.get_component(T, Some(&StageMetrics::latency(1.0)));
    assert_eq!(harness.active_tier(T), Some(Tier::Fallback));

    harness.controller.reset_component(T);
    harness.controller.get_component(T, None);
    assert_eq!(harness.active_tier(T), Some(Tier::Primary));
}

#[tokio::test]
async fn test_history_is_capped() {
    let harness = TestHarness::builder().build().unwrap();
    for i in 0..(HISTORY_CAPACITY * 3) {
        harness
            .controller
            .get_component(T, Some(&StageMetrics::latency((i % 100) as f64)));
    }
    assert_eq!(harness.controller.history_len(T), HISTORY_CAPACITY);
    assert_eq!(
        harness.controller.performance_stats(T).unwrap().sample_count,
        10
    );
}

#[tokio::test]
async fn test_at_least_one_tier_loads_means_a_handle() {
    let harness = TestHarness::builder().build().unwrap();
    harness
        .tier_loader(T, Tier::Primary)
        .unwrap()
        .set_fail_load(true);
    for _ in 0..5 {
        assert!(harness.controller.get_component(T, None).is_some());
    }
    assert_eq!(harness.active_tier(T), Some(Tier::Fallback));
}

#[tokio::test]
async fn test_detection_negative_skips_downstream_stages() {
    let harness = TestHarness::builder()
        .detector(SpeechScore::Binary(false))
        .coordinator(CoordinatorConfig::default().with_enhancement(true))
        .build()
        .unwrap();

    let result = harness.coordinator.process(vec![0.0; 2560]).await;
    assert!(result.success);
    assert_eq!(result.text, "");
    assert!(result.stage(STAGE_TRANSCRIPTION).is_none());

    let transcriber = harness.tier_loader(T, Tier::Primary).unwrap();
    let generator = harness
        .tier_loader(LogicalComponent::Generator, Tier::Primary)
        .unwrap();
    assert_eq!(transcriber.call_count(), 0);
    assert_eq!(generator.call_count(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_transcription_timeout_returns_normally() {
    let config = CoordinatorConfig::default()
        .with_transcription_timeout_ms(50)
        .unwrap();
    let policy = FallbackPolicy::builtin().with_component(
        T,
        ComponentPolicy::new("large-v3", "base").with_rule(TriggerRule::exception(FaultKind::Timeout)),
    );
    let harness = TestHarness::builder()
        .coordinator(config)
        .policy(policy)
        .build()
        .unwrap();
    harness
        .tier_loader(T, Tier::Primary)
        .unwrap()
        .set_latency(Duration::from_millis(400));

    let result = harness.coordinator.process(vec![0.1; 2560]).await;
    assert!(!result.success);
    assert_eq!(result.text, "");
    assert_eq!(result.outcome, RequestOutcome::Timeout);
    assert!(result.latency_ms < 400.0);
    assert_eq!(harness.metrics.request_count(RequestOutcome::Timeout), 1);

    // The timed-out call is fed back as a timeout fault and swaps the transcriber
    let result = harness.coordinator.process(vec![0.1; 2560]).await;
    assert!(result.success, "{:?}", result.errors);
    assert_eq!(harness.active_tier(T), Some(Tier::Fallback));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_health_follows_error_rate() {
    async fn run_with_failures(failures: usize) -> HealthStatus {
        let harness = TestHarness::builder().build().unwrap();
        harness.coordinator.initialize().await;
        let script = harness.tier_loader(T, Tier::Primary).unwrap().fault_script();
        for _ in 0..failures {
            script.push(BackendError::internal("decoder crashed"));
        }
        let results = harness.process_n(20, 1600).await;
        assert_eq!(results.iter().filter(|r| !r.success).count(), failures);
        let status = harness.coordinator.health_status();
        harness.shutdown().await;
        status
    }

    assert_eq!(run_with_failures(0).await, HealthStatus::Healthy);
    assert_eq!(run_with_failures(1).await, HealthStatus::Degraded);
    assert_eq!(run_with_failures(5).await, HealthStatus::Unhealthy);
}

#[tokio::test]
async fn test_resource_trigger_uses_device_map_override() {
    let resource = ResourceConfig::default().with_device_map_override("transcriber:0,generator:1");
    let harness = TestHarness::builder().resource(resource).build().unwrap();

    harness.probe.set_free_gb(1, 0.5);
    harness.controller.get_component(T, Some(&StageMetrics::latency(10.0)));
    assert_eq!(harness.active_tier(T), Some(Tier::Primary));

    harness.probe.set_free_gb(0, 1.0);
    harness.controller.get_component(T, Some(&StageMetrics::latency(10.0)));
    assert_eq!(harness.active_tier(T), Some(Tier::Fallback));
}

#[tokio::test]
async fn test_concurrent_requests_share_one_swap() {
    let harness = TestHarness::builder().build().unwrap();
    harness
        .tier_loader(T, Tier::Primary)
        .unwrap()
        .set_latency(Duration::from_millis(600));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let coordinator = harness.coordinator.clone();
            tokio::spawn(async move { coordinator.process(vec![0.1; 1600]).await })
        })
        .collect();
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success, "{:?}", result.errors);
    }

    let results = harness.process_n(4, 1600).await;
    assert!(results.iter().all(|r| r.success));
    assert_eq!(harness.active_tier(T), Some(Tier::Fallback));
    assert_eq!(harness.loader("base").unwrap().load_count(), 1);
    assert_eq!(harness.metrics.tier_swaps(T), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_policy_file_drives_thresholds() {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
    writeln!(
        file,
        r#"
fallback_config:
  transcriber:
    primary: distil-large
    fallback: tiny
    trigger:
      - kind: latency
        threshold_ms: 100
"#
    )
    .unwrap();

    let policy = FallbackPolicy::load_or_default(Some(file.path()));
    let harness = TestHarness::builder().policy(policy).build().unwrap();
    harness.controller.get_component(T, Some(&StageMetrics::latency(150.0)));
    let status = harness.controller.status();
    assert_eq!(status.components[&T].backend.as_deref(), Some("tiny"));
}

#[tokio::test]
async fn test_runtime_config_with_env_override() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(file, "[coordinator]\ntranscription_timeout_ms = 3000\n").unwrap();

    unsafe {
        std::env::set_var("FERROVOX_COORDINATOR__RETRY_TIMEOUT_MS", "7000");
    }
    let config = RuntimeConfig::load(file.path()).unwrap();
    unsafe {
        std::env::remove_var("FERROVOX_COORDINATOR__RETRY_TIMEOUT_MS");
    }

    assert_eq!(config.coordinator.transcription_timeout_ms, 3000);
    assert_eq!(config.coordinator.retry_timeout_ms, 7000);
    assert!(config.policy_path.is_none());
}

#[tokio::test]
async fn test_health_report_and_metrics_exposition() {
    let harness = TestHarness::builder()
        .detector(SpeechScore::Probability(0.75))
        .build()
        .unwrap();
    let results = harness.process_n(3, 2560).await;
    assert!(results.iter().all(|r| r.success));

    let report = harness.coordinator.health_report();
    assert_eq!(report.status, HealthStatus::Healthy);
    assert!(report.initialized);
    assert_eq!(report.performance.requests_processed, 3);
    assert_eq!(report.device_map.get("transcriber"), Some(&1));
    assert_eq!(report.controller.devices.len(), 2);
    assert!(report.detector.is_some());
    assert!(serde_json::to_string(&report).is_ok());

    let text = harness.metrics.render().unwrap();
    assert!(text.contains(r#"ferrovox_pipeline_requests_total{status="success"} 3"#));
    assert!(text.contains("ferrovox_speech_probability 0.75"));
    assert!(text.contains(r#"ferrovox_component_active{component="transcriber",tier="primary"} 1"#));
    harness.shutdown().await;
}

struct PanickingLoader;

struct PanickingBackend;

impl Backend for PanickingBackend {
    fn name(&self) -> &str {
        "panicking"
    }

    fn operate(&self, _input: StageInput) -> BackendResult<StageOutput> {
        panic!("kernel launch failed")
    }
}

impl BackendLoader for PanickingLoader {
    fn identifier(&self) -> &str {
        "panicking"
    }

    fn load(&self, _request: &LoadRequest) -> BackendResult<BackendHandle> {
        Ok(Arc::new(PanickingBackend))
    }
}

#[tokio::test]
async fn test_backend_panic_never_escapes() {
    let policy = FallbackPolicy::new().with_component(
        T,
        ComponentPolicy::new("panicking", "panicking").with_rule(TriggerRule::latency(500.0)),
    );
    let controller = Arc::new(FallbackController::new(
        policy,
        BackendRegistry::new().with_loader(Arc::new(PanickingLoader)),
        ResourceMonitor::new(ResourceConfig::default(), Arc::new(StaticProbe::cpu_only())),
        Arc::new(NoopMetrics),
    ));
    let coordinator = PipelineCoordinator::new(
        CoordinatorConfig::default(),
        controller,
        Arc::new(NoopMetrics),
    );

    let result = coordinator.process(vec![0.1; 160]).await;
    assert!(!result.success);
    assert_eq!(result.outcome, RequestOutcome::Error);
    assert!(result.errors[0].contains("panicked"));
    assert_eq!(coordinator.health_status(), HealthStatus::Unhealthy);
    coordinator.shutdown().await;
}
