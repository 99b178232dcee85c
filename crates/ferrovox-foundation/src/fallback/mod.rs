//! FallbackController - per-component primary/fallback hot-swapping
//!
//! For every logical component the controller lazily loads the primary
//! backend, records the metrics callers feed back, and evaluates the
//! component's trigger policy. When a rule fires on a primary-tier component
//! the fallback is loaded and swapped in. Components never return to primary
//! on their own; only [`FallbackController::reset_component`] does that.
//!
//! Every load failure is logged and reported to the metrics sink, never
//! raised. A `None` handle means the component is unavailable and the caller
//! applies its own stage-skip policy.
//!
//! All methods may block (loads, device refresh). Async callers run them on
//! a blocking worker.

mod history;

pub use history::{HISTORY_CAPACITY, PerformanceHistory, PerformanceStats, STATS_WINDOW};

use crate::policy::{ComponentPolicy, FallbackPolicy};
use crate::registry::BackendRegistry;
use crate::resource::ResourceMonitor;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ferrovox_kernel::{
    BackendCapabilities, BackendHandle, DeviceMemory, LoadRequest, LogicalComponent,
    MetricsSink, PerformanceSample, StageMetrics, Tier, TriggerCause, VoxError, VoxResult,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// The active backend of one component
struct ActiveBackend {
    handle: BackendHandle,
    tier: Tier,
    identifier: String,
    capabilities: BackendCapabilities,
    loaded_at: DateTime<Utc>,
    loaded_instant: Instant,
}

#[derive(Default)]
struct ComponentSlot {
    active: Option<ActiveBackend>,
    history: PerformanceHistory,
}

/// Handle plus the tier it was served from
#[derive(Clone)]
pub struct ActiveComponent {
    pub handle: BackendHandle,
    pub tier: Tier,
    pub identifier: String,
}

impl std::fmt::Debug for ActiveComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveComponent")
            .field("backend", &self.handle.name())
            .field("tier", &self.tier)
            .field("identifier", &self.identifier)
            .finish()
    }
}

/// Status of one tracked component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub tier: Option<Tier>,
    pub backend: Option<String>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub history_len: usize,
    pub performance: Option<PerformanceStats>,
}

/// Snapshot returned by [`FallbackController::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub components: BTreeMap<LogicalComponent, ComponentStatus>,
    pub devices: Vec<DeviceMemory>,
}

/// Owns the active backend of every component.
pub struct FallbackController {
    policy: FallbackPolicy,
    registry: BackendRegistry,
    monitor: ResourceMonitor,
    metrics: Arc<dyn MetricsSink>,
    slots: DashMap<LogicalComponent, Arc<Mutex<ComponentSlot>>>,
}

impl FallbackController {
    pub fn new(
        policy: FallbackPolicy,
        registry: BackendRegistry,
        monitor: ResourceMonitor,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            policy,
            registry,
            monitor,
            metrics,
            slots: DashMap::new(),
        }
    }

    pub fn policy(&self) -> &FallbackPolicy {
        &self.policy
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    fn slot(&self, component: LogicalComponent) -> Arc<Mutex<ComponentSlot>> {
        self.slots
            .entry(component)
            .or_insert_with(|| Arc::new(Mutex::new(ComponentSlot::default())))
            .value()
            .clone()
    }

    /// Active backend handle for `component`, swapping to the fallback first
    /// if `metrics` trips a trigger rule.
    pub fn get_component(
        &self,
        component: LogicalComponent,
        metrics: Option<&StageMetrics>,
    ) -> Option<BackendHandle> {
        self.acquire(component, metrics).map(|active| active.handle)
    }

    /// Like [`get_component`](Self::get_component), also reporting the tier.
    pub fn acquire(
        &self,
        component: LogicalComponent,
        metrics: Option<&StageMetrics>,
    ) -> Option<ActiveComponent> {
        let slot = self.slot(component);
        // The slot lock makes every transition a compare-and-swap on the
        // active descriptor.
        let mut slot = slot.lock();

        if slot.active.is_none() {
            slot.active = self.load_initial(component);
        }

        if let Some(metrics) = metrics {
            slot.history.push(PerformanceSample::from_metrics(metrics));

            if let Some(cause) = self.evaluate(component, metrics) {
                self.swap_to_fallback(component, &mut slot, cause);
            }
        }

        slot.active.as_ref().map(|active| ActiveComponent {
            handle: active.handle.clone(),
            tier: active.tier,
            identifier: active.identifier.clone(),
        })
    }

    /// Load the primary; if that fails, go straight to the fallback.
    fn load_initial(&self, component: LogicalComponent) -> Option<ActiveBackend> {
        info!(%component, "initial load");
        match self.load(component, Tier::Primary) {
            Ok(active) => Some(active),
            Err(primary_err) => {
                warn!(%component, "{}; trying fallback", primary_err);
                match self.load(component, Tier::Fallback) {
                    Ok(active) => Some(active),
                    Err(fallback_err) => {
                        error!(%component, "{}; component unavailable", fallback_err);
                        self.metrics.set_component_tier(component, None);
                        None
                    }
                }
            }
        }
    }

    fn evaluate(&self, component: LogicalComponent, metrics: &StageMetrics) -> Option<TriggerCause> {
        let policy = match self.policy.get(component) {
            Some(policy) => &policy.triggers,
            None if metrics.forced => return Some(TriggerCause::Forced),
            None => return None,
        };
        policy.evaluate(metrics, || {
            self.monitor.refresh();
            self.monitor.free_memory_gb(component)
        })
    }

    fn swap_to_fallback(
        &self,
        component: LogicalComponent,
        slot: &mut ComponentSlot,
        cause: TriggerCause,
    ) {
        match slot.active.as_ref().map(|a| a.tier) {
            Some(Tier::Fallback) => {
                debug!(%component, %cause, "trigger fired but already on fallback");
                return;
            }
            Some(Tier::Primary) => {}
            None => {
                debug!(%component, %cause, "trigger fired on unavailable component");
                return;
            }
        }

        match cause.resource_exhaustion(self.monitor.device_label(component)) {
            Some(err) => warn!(%component, "{}; switching to fallback", err),
            None => warn!(%component, %cause, "switching to fallback"),
        }
        match self.load(component, Tier::Fallback) {
            Ok(fallback) => {
                if let Some(old) = slot.active.replace(fallback) {
                    release(component, &old);
                }
                self.metrics.record_tier_swap(component);
            }
            Err(e) => {
                error!(%component, "{}; keeping primary", e);
            }
        }
    }

    fn load(&self, component: LogicalComponent, tier: Tier) -> VoxResult<ActiveBackend> {
        let result = self.try_load(component, tier);
        if result.is_err() {
            self.metrics.record_load_failure(component, tier);
        }
        result
    }

    fn try_load(&self, component: LogicalComponent, tier: Tier) -> VoxResult<ActiveBackend> {
        let policy: &ComponentPolicy = self
            .policy
            .get(component)
            .ok_or_else(|| VoxError::ConfigurationMissing(format!("no policy for {component}")))?;
        let identifier = policy.identifier(tier).to_string();

        let loader = self.registry.get(&identifier).ok_or_else(|| VoxError::LoadFailure {
            component,
            tier,
            reason: format!("no loader registered for '{identifier}'"),
        })?;

        let request = LoadRequest::new(component, tier, &identifier)
            .with_device(self.monitor.device_index(component));
        let device = request.device_label();

        let start = Instant::now();
        let handle = loader.load(&request).map_err(|e| VoxError::LoadFailure {
            component,
            tier,
            reason: e.to_string(),
        })?;
        let elapsed = start.elapsed();

        info!(
            %component,
            %tier,
            backend = %identifier,
            device = %device,
            load_ms = elapsed.as_secs_f64() * 1000.0,
            "backend loaded"
        );
        self.metrics
            .record_model_load(component, tier, elapsed.as_secs_f64());
        self.metrics.set_component_tier(component, Some(tier));

        Ok(ActiveBackend {
            capabilities: handle.capabilities(),
            handle,
            tier,
            identifier,
            loaded_at: Utc::now(),
            loaded_instant: Instant::now(),
        })
    }

    /// Push `component` onto its fallback through the normal swap path.
    pub fn force_fallback(&self, component: LogicalComponent) -> Option<BackendHandle> {
        info!(%component, "forcing fallback");
        self.get_component(component, Some(&StageMetrics::forced()))
    }

    /// Discard the active backend and history; the next lookup reloads the
    /// primary.
    pub fn reset_component(&self, component: LogicalComponent) {
        let Some(slot) = self.slots.get(&component).map(|s| s.value().clone()) else {
            return;
        };
        let mut slot = slot.lock();
        if let Some(old) = slot.active.take() {
            release(component, &old);
        }
        slot.history.clear();
        self.metrics.set_component_tier(component, None);
        info!(%component, "component reset");
    }

    /// Load the primary ahead of traffic. False if the component is unavailable.
    pub fn preload(&self, component: LogicalComponent) -> bool {
        self.acquire(component, None).is_some()
    }

    pub fn active_tier(&self, component: LogicalComponent) -> Option<Tier> {
        let slot = self.slots.get(&component)?.value().clone();
        let slot = slot.lock();
        slot.active.as_ref().map(|a| a.tier)
    }

    pub fn performance_stats(&self, component: LogicalComponent) -> Option<PerformanceStats> {
        let slot = self.slots.get(&component)?.value().clone();
        let slot = slot.lock();
        slot.history.stats()
    }

    pub fn history_len(&self, component: LogicalComponent) -> usize {
        match self.slots.get(&component).map(|s| s.value().clone()) {
            Some(slot) => slot.lock().history.len(),
            None => 0,
        }
    }

    /// Tier, uptime and recent stats of every tracked component, plus the
    /// last device memory snapshot.
    pub fn status(&self) -> ControllerStatus {
        let slots: Vec<(LogicalComponent, Arc<Mutex<ComponentSlot>>)> = self
            .slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();

        let components = slots
            .into_iter()
            .map(|(component, slot)| {
                let slot = slot.lock();
                let status = ComponentStatus {
                    tier: slot.active.as_ref().map(|a| a.tier),
                    backend: slot.active.as_ref().map(|a| a.identifier.clone()),
                    loaded_at: slot.active.as_ref().map(|a| a.loaded_at),
                    uptime_secs: slot
                        .active
                        .as_ref()
                        .map(|a| a.loaded_instant.elapsed().as_secs_f64())
                        .unwrap_or(0.0),
                    history_len: slot.history.len(),
                    performance: slot.history.stats(),
                };
                (component, status)
            })
            .collect();

        ControllerStatus {
            components,
            devices: self.monitor.snapshot(),
        }
    }
}

fn release(component: LogicalComponent, old: &ActiveBackend) {
    if !old.capabilities.release {
        debug!(%component, backend = %old.identifier, "backend has no release hook");
        return;
    }
    match old.handle.release() {
        Ok(()) => debug!(%component, backend = %old.identifier, "previous backend released"),
        Err(e) => warn!(%component, backend = %old.identifier, "release failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBackendLoader;
    use crate::resource::{DeviceCapability, ResourceConfig, StaticProbe};
    use ferrovox_kernel::{FaultKind, NoopMetrics, TriggerRule};

    struct Fixture {
        controller: FallbackController,
        primary: Arc<MockBackendLoader>,
        fallback: Arc<MockBackendLoader>,
        probe: Arc<StaticProbe>,
    }

    fn fixture() -> Fixture {
        let primary = Arc::new(MockBackendLoader::new("large-v3"));
        let fallback = Arc::new(MockBackendLoader::new("base"));
        let registry = BackendRegistry::new()
            .with_loader(primary.clone())
            .with_loader(fallback.clone());
        let probe = Arc::new(StaticProbe::new(vec![
            DeviceCapability::new(0, "RTX 3090", 24.0, 20.0),
            DeviceCapability::new(1, "RTX 4060 Ti", 16.0, 12.0),
        ]));
        let monitor = ResourceMonitor::new(ResourceConfig::default(), probe.clone());
        let controller = FallbackController::new(
            FallbackPolicy::builtin(),
            registry,
            monitor,
            Arc::new(NoopMetrics),
        );
        Fixture {
            controller,
            primary,
            fallback,
            probe,
        }
    }

    const T: LogicalComponent = LogicalComponent::Transcriber;

    #[test]
    fn test_lazy_primary_load() {
        let f = fixture();
        assert_eq!(f.primary.load_count(), 0);
        assert!(f.controller.get_component(T, None).is_some());
        assert!(f.controller.get_component(T, None).is_some());
        assert_eq!(f.primary.load_count(), 1);
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));
    }

    #[test]
    fn test_latency_trigger_swaps_once() {
        let f = fixture();
        f.controller.get_component(T, Some(&StageMetrics::latency(150.0)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));

        let handle = f.controller.get_component(T, Some(&StageMetrics::latency(600.0)));
        assert_eq!(handle.unwrap().name(), "base");
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
        assert_eq!(f.primary.release_count(), 1);

        // Further firings stay on fallback and do not reload it
        for _ in 0..5 {
            f.controller.get_component(T, Some(&StageMetrics::latency(9000.0)));
        }
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
        assert_eq!(f.fallback.load_count(), 1);
    }

    #[test]
    fn test_threshold_boundary() {
        let f = fixture();
        f.controller.get_component(T, Some(&StageMetrics::latency(500.0)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));
        f.controller.get_component(T, Some(&StageMetrics::latency(501.0)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
    }

    #[test]
    fn test_resource_trigger_refreshes_device_state() {
        let f = fixture();
        f.controller.get_component(T, None);
        f.probe.set_free_gb(1, 1.0);
        f.controller.get_component(T, Some(&StageMetrics::latency(10.0)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
    }

    #[test]
    fn test_bare_lookup_does_not_evaluate() {
        let f = fixture();
        f.probe.set_free_gb(1, 0.5);
        f.controller.get_component(T, None);
        f.controller.get_component(T, None);
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));
        assert_eq!(f.controller.history_len(T), 0);
    }

    #[test]
    fn test_exception_trigger() {
        let f = fixture();
        f.controller
            .get_component(T, Some(&StageMetrics::fault(FaultKind::Internal)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));
        f.controller
            .get_component(T, Some(&StageMetrics::fault(FaultKind::OutOfMemory)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
    }

    #[test]
    fn test_fallback_load_failure_keeps_primary() {
        let f = fixture();
        f.fallback.set_fail_load(true);
        let handle = f.controller.get_component(T, Some(&StageMetrics::latency(900.0)));
        assert_eq!(handle.unwrap().name(), "large-v3");
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));
        assert_eq!(f.primary.release_count(), 0);

        // Recovers on a later firing once the fallback can load
        f.fallback.set_fail_load(false);
        f.controller.get_component(T, Some(&StageMetrics::latency(900.0)));
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
    }

    #[test]
    fn test_primary_failure_serves_fallback() {
        let f = fixture();
        f.primary.set_fail_load(true);
        let handle = f.controller.get_component(T, None).unwrap();
        assert_eq!(handle.name(), "base");
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
    }

    #[test]
    fn test_both_loads_failing_returns_none() {
        let f = fixture();
        f.primary.set_fail_load(true);
        f.fallback.set_fail_load(true);
        assert!(f.controller.get_component(T, None).is_none());
        assert_eq!(f.controller.active_tier(T), None);
    }

    #[test]
    fn test_force_fallback_then_reset() {
        let f = fixture();
        f.controller.get_component(T, Some(&StageMetrics::latency(100.0)));
        f.controller.force_fallback(T);
        let status = f.controller.status();
        assert_eq!(status.components[&T].tier, Some(Tier::Fallback));
        assert_eq!(status.devices.len(), 2);

        f.controller.reset_component(T);
        assert_eq!(f.controller.active_tier(T), None);
        assert!(f.controller.performance_stats(T).is_none());
        assert_eq!(f.fallback.release_count(), 1);

        f.controller.get_component(T, None);
        assert_eq!(f.controller.active_tier(T), Some(Tier::Primary));
        assert_eq!(f.primary.load_count(), 2);
    }

    #[test]
    fn test_force_fallback_without_rules() {
        let primary = Arc::new(MockBackendLoader::new("a"));
        let fallback = Arc::new(MockBackendLoader::new("b"));
        let policy = FallbackPolicy::new().with_component(
            LogicalComponent::Synthesizer,
            ComponentPolicy::new("a", "b"),
        );
        let controller = FallbackController::new(
            policy,
            BackendRegistry::new().with_loader(primary).with_loader(fallback),
            ResourceMonitor::new(ResourceConfig::default(), Arc::new(StaticProbe::cpu_only())),
            Arc::new(NoopMetrics),
        );
        controller.force_fallback(LogicalComponent::Synthesizer);
        assert_eq!(
            controller.active_tier(LogicalComponent::Synthesizer),
            Some(Tier::Fallback)
        );
    }

    #[test]
    fn test_unconfigured_component_is_unavailable() {
        let f = fixture();
        assert!(f.controller.get_component(LogicalComponent::Detector, None).is_none());
    }

    #[test]
    fn test_history_is_bounded_and_stats_windowed() {
        let f = fixture();
        f.fallback.set_fail_load(true);
        for i in 0..300 {
            f.controller
                .get_component(T, Some(&StageMetrics::latency((i % 50) as f64)));
        }
        assert_eq!(f.controller.history_len(T), HISTORY_CAPACITY);
        let stats = f.controller.performance_stats(T).unwrap();
        assert_eq!(stats.sample_count, STATS_WINDOW);
    }

    #[test]
    fn test_status_reports_uptime() {
        let f = fixture();
        f.controller.get_component(T, Some(&StageMetrics::latency(600.0)));
        std::thread::sleep(std::time::Duration::from_millis(5));
        let status = f.controller.status();
        let transcriber = &status.components[&T];
        assert_eq!(transcriber.tier, Some(Tier::Fallback));
        assert_eq!(transcriber.backend.as_deref(), Some("base"));
        assert!(transcriber.uptime_secs > 0.0);
        assert_eq!(transcriber.performance.as_ref().unwrap().sample_count, 1);
    }

    #[test]
    fn test_concurrent_lookups_swap_exactly_once() {
        let f = Arc::new(fixture());
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let f = f.clone();
                std::thread::spawn(move || {
                    for j in 0..50 {
                        let latency = if (i + j) % 7 == 0 { 800.0 } else { 100.0 };
                        assert!(f
                            .controller
                            .get_component(T, Some(&StageMetrics::latency(latency)))
                            .is_some());
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(f.primary.load_count(), 1);
        assert_eq!(f.fallback.load_count(), 1);
        assert_eq!(f.controller.history_len(T), HISTORY_CAPACITY);
        assert_eq!(f.controller.active_tier(T), Some(Tier::Fallback));
    }

    #[test]
    fn test_rule_order_from_custom_policy() {
        let primary = Arc::new(MockBackendLoader::new("p"));
        let fallback = Arc::new(MockBackendLoader::new("f"));
        let policy = FallbackPolicy::new().with_component(
            LogicalComponent::Generator,
            ComponentPolicy::new("p", "f").with_rule(TriggerRule::exception(FaultKind::Timeout)),
        );
        let controller = FallbackController::new(
            policy,
            BackendRegistry::new().with_loader(primary).with_loader(fallback),
            ResourceMonitor::new(ResourceConfig::default(), Arc::new(StaticProbe::cpu_only())),
            Arc::new(NoopMetrics),
        );
        let g = LogicalComponent::Generator;
        controller.get_component(g, Some(&StageMetrics::latency(1e9)));
        assert_eq!(controller.active_tier(g), Some(Tier::Primary));
        controller.get_component(g, Some(&StageMetrics::fault(FaultKind::Timeout)));
        assert_eq!(controller.active_tier(g), Some(Tier::Fallback));
    }
}
