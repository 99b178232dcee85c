//! Trigger rules and performance samples
//!
//! A [`TriggerPolicy`] is the ordered rule list for one component. Rules are
//! evaluated against the metrics of the latest call; the first rule that
//! fires decides the swap.

use crate::backend::FaultKind;
use crate::error::VoxError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A single swap condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerRule {
    /// Fires when the observed latency is strictly above the threshold
    Latency { threshold_ms: f64 },
    /// Fires when free memory on the component's device is below the threshold
    Resource { threshold_gb: f64 },
    /// Fires when the call failed with this fault kind
    Exception { exception: FaultKind },
}

impl TriggerRule {
    pub fn latency(threshold_ms: f64) -> Self {
        TriggerRule::Latency { threshold_ms }
    }

    pub fn resource(threshold_gb: f64) -> Self {
        TriggerRule::Resource { threshold_gb }
    }

    pub fn exception(exception: FaultKind) -> Self {
        TriggerRule::Exception { exception }
    }
}

/// Metrics of the most recent call to a component, fed back on the next lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageMetrics {
    pub latency_ms: Option<f64>,
    pub fault: Option<FaultKind>,
    /// Deliberate degradation; fires regardless of the rule list
    pub forced: bool,
}

impl StageMetrics {
    pub fn latency(latency_ms: f64) -> Self {
        Self {
            latency_ms: Some(latency_ms),
            ..Default::default()
        }
    }

    pub fn fault(fault: FaultKind) -> Self {
        Self {
            fault: Some(fault),
            ..Default::default()
        }
    }

    pub fn forced() -> Self {
        Self {
            forced: true,
            ..Default::default()
        }
    }

    pub fn with_fault(mut self, fault: FaultKind) -> Self {
        self.fault = Some(fault);
        self
    }
}

/// Why a swap was requested
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerCause {
    Latency { observed_ms: f64, threshold_ms: f64 },
    Resource { free_gb: f64, threshold_gb: f64 },
    Exception(FaultKind),
    Forced,
}

impl fmt::Display for TriggerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerCause::Latency {
                observed_ms,
                threshold_ms,
            } => write!(f, "latency {observed_ms:.1}ms > {threshold_ms}ms"),
            TriggerCause::Resource {
                free_gb,
                threshold_gb,
            } => write!(f, "free memory {free_gb:.2}GB < {threshold_gb}GB"),
            TriggerCause::Exception(kind) => write!(f, "exception {kind}"),
            TriggerCause::Forced => write!(f, "forced"),
        }
    }
}

impl TriggerCause {
    /// The error a resource-triggered swap reports for `device`.
    pub fn resource_exhaustion(&self, device: impl Into<String>) -> Option<VoxError> {
        match self {
            TriggerCause::Resource {
                free_gb,
                threshold_gb,
            } => Some(VoxError::ResourceExhaustion {
                device: device.into(),
                free_gb: *free_gb,
                required_gb: *threshold_gb,
            }),
            _ => None,
        }
    }
}

/// Ordered rule list for one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerPolicy {
    pub rules: Vec<TriggerRule>,
}

impl TriggerPolicy {
    pub fn new(rules: Vec<TriggerRule>) -> Self {
        Self { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Evaluate the rules in declared order and return the first that fires.
    ///
    /// `free_gb` is only invoked when a resource rule is reached, so callers
    /// can refresh device state lazily. It returns `None` on hosts without an
    /// accelerator, in which case resource rules never fire.
    pub fn evaluate<F>(&self, metrics: &StageMetrics, mut free_gb: F) -> Option<TriggerCause>
    where
        F: FnMut() -> Option<f64>,
    {
        if metrics.forced {
            return Some(TriggerCause::Forced);
        }

        let mut free_cache: Option<Option<f64>> = None;
        for rule in &self.rules {
            match rule {
                TriggerRule::Latency { threshold_ms } => {
                    if let Some(observed) = metrics.latency_ms {
                        if observed > *threshold_ms {
                            return Some(TriggerCause::Latency {
                                observed_ms: observed,
                                threshold_ms: *threshold_ms,
                            });
                        }
                    }
                }
                TriggerRule::Resource { threshold_gb } => {
                    let free = *free_cache.get_or_insert_with(&mut free_gb);
                    if let Some(free) = free {
                        if free < *threshold_gb {
                            return Some(TriggerCause::Resource {
                                free_gb: free,
                                threshold_gb: *threshold_gb,
                            });
                        }
                    }
                }
                TriggerRule::Exception { exception } => {
                    if metrics.fault.as_ref() == Some(exception) {
                        return Some(TriggerCause::Exception(exception.clone()));
                    }
                }
            }
        }
        None
    }
}

/// One entry in a component's performance history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub latency_ms: Option<f64>,
    pub fault: Option<FaultKind>,
}

impl PerformanceSample {
    pub fn from_metrics(metrics: &StageMetrics) -> Self {
        Self {
            timestamp: Utc::now(),
            latency_ms: metrics.latency_ms,
            fault: metrics.fault.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcriber_policy() -> TriggerPolicy {
        TriggerPolicy::new(vec![
            TriggerRule::latency(500.0),
            TriggerRule::resource(2.0),
            TriggerRule::exception(FaultKind::OutOfMemory),
        ])
    }

    #[test]
    fn test_latency_threshold_is_strict() {
        let policy = transcriber_policy();
        assert_eq!(policy.evaluate(&StageMetrics::latency(500.0), || None), None);
        assert!(matches!(
            policy.evaluate(&StageMetrics::latency(501.0), || None),
            Some(TriggerCause::Latency { .. })
        ));
    }

    #[test]
    fn test_only_resource_cause_is_exhaustion() {
        let cause = TriggerCause::Resource {
            free_gb: 1.5,
            threshold_gb: 2.0,
        };
        let err = cause.resource_exhaustion("cuda:1").unwrap();
        assert_eq!(
            err.to_string(),
            "resource exhaustion on cuda:1: 1.50 GB free, 2.00 GB required"
        );
        assert!(TriggerCause::Forced.resource_exhaustion("cuda:1").is_none());
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let policy = transcriber_policy();
        let metrics = StageMetrics::latency(900.0).with_fault(FaultKind::OutOfMemory);
        let cause = policy.evaluate(&metrics, || Some(0.5)).unwrap();
        assert!(matches!(cause, TriggerCause::Latency { .. }));
    }

    #[test]
    fn test_resource_rule_probes_lazily() {
        let policy = TriggerPolicy::new(vec![
            TriggerRule::latency(500.0),
            TriggerRule::exception(FaultKind::OutOfMemory),
        ]);
        let mut probed = 0;
        policy.evaluate(&StageMetrics::latency(10.0), || {
            probed += 1;
            Some(0.0)
        });
        assert_eq!(probed, 0);

        let policy = transcriber_policy();
        let cause = policy.evaluate(&StageMetrics::latency(10.0), || {
            probed += 1;
            Some(1.5)
        });
        assert_eq!(probed, 1);
        assert!(matches!(cause, Some(TriggerCause::Resource { .. })));
    }

    #[test]
    fn test_resource_rule_ignored_without_accelerator() {
        let policy = TriggerPolicy::new(vec![TriggerRule::resource(2.0)]);
        assert_eq!(policy.evaluate(&StageMetrics::latency(1.0), || None), None);
    }

    #[test]
    fn test_exception_rule_matches_kind() {
        let policy = transcriber_policy();
        assert_eq!(
            policy.evaluate(&StageMetrics::fault(FaultKind::Internal), || None),
            None
        );
        assert_eq!(
            policy.evaluate(&StageMetrics::fault(FaultKind::OutOfMemory), || None),
            Some(TriggerCause::Exception(FaultKind::OutOfMemory))
        );
    }

    #[test]
    fn test_forced_fires_with_empty_policy() {
        let policy = TriggerPolicy::default();
        assert_eq!(
            policy.evaluate(&StageMetrics::forced(), || None),
            Some(TriggerCause::Forced)
        );
    }

    #[test]
    fn test_rules_deserialize_from_yaml() {
        let yaml = r#"
- kind: latency
  threshold_ms: 500
- kind: resource
  threshold_gb: 2.0
- kind: exception
  exception: out_of_memory
"#;
        let policy: TriggerPolicy = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy, transcriber_policy());
    }
}
