//! Bounded per-component performance history.

use ferrovox_kernel::PerformanceSample;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Samples kept per component; oldest evicted first
pub const HISTORY_CAPACITY: usize = 100;

/// Latency-carrying samples summarised by [`PerformanceHistory::stats`]
pub const STATS_WINDOW: usize = 10;

/// Summary of recent latencies for one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub avg_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub sample_count: usize,
}

#[derive(Debug, Clone)]
pub struct PerformanceHistory {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
}

impl Default for PerformanceHistory {
    fn default() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }
}

impl PerformanceHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: PerformanceSample) {
        while self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn latest(&self) -> Option<&PerformanceSample> {
        self.samples.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PerformanceSample> {
        self.samples.iter()
    }

    /// Mean / min / max over the most recent samples that carry a latency.
    pub fn stats(&self) -> Option<PerformanceStats> {
        let recent: Vec<f64> = self
            .samples
            .iter()
            .rev()
            .filter_map(|s| s.latency_ms)
            .take(STATS_WINDOW)
            .collect();

        if recent.is_empty() {
            return None;
        }

        let sum: f64 = recent.iter().sum();
        Some(PerformanceStats {
            avg_latency_ms: sum / recent.len() as f64,
            min_latency_ms: recent.iter().copied().fold(f64::INFINITY, f64::min),
            max_latency_ms: recent.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            sample_count: recent.len(),
        })
    }
}
