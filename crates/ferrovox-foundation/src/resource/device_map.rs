//! Role name to accelerator index mapping.

use super::probe::DeviceCapability;
use ferrovox_kernel::{LogicalComponent, VoxError, VoxResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

const LARGE_TOKENS: [&str; 4] = ["3090", "4090", "A100", "H100"];
const MID_TOKENS: [&str; 3] = ["4060", "3060", "4070"];

/// Mapping from role name (`generator`, `transcriber`, ... or a hardware
/// token such as `3090`) to device index.
///
/// Built once at startup and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceMap {
    entries: BTreeMap<String, usize>,
}

impl DeviceMap {
    /// Parse an explicit `role:index,role:index` string.
    pub fn parse_override(spec: &str) -> VoxResult<Self> {
        let mut entries = BTreeMap::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (name, index) = pair
                .split_once(':')
                .ok_or_else(|| VoxError::InvalidDeviceMap(format!("missing ':' in '{pair}'")))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(VoxError::InvalidDeviceMap(format!("empty role in '{pair}'")));
            }
            let index = index
                .trim()
                .parse::<usize>()
                .map_err(|e| VoxError::InvalidDeviceMap(format!("bad index in '{pair}': {e}")))?;
            entries.insert(name.to_string(), index);
        }
        if entries.is_empty() {
            return Err(VoxError::InvalidDeviceMap("no entries".to_string()));
        }
        Ok(Self { entries })
    }

    /// Classify devices by name tokens and memory size.
    ///
    /// Every pipeline role resolves to a device whenever at least one
    /// accelerator is present; with none the map is empty.
    pub fn auto_detect(devices: &[DeviceCapability]) -> Self {
        let mut entries = BTreeMap::new();
        if devices.is_empty() {
            return Self { entries };
        }

        for device in devices {
            let total_gb = device.total_gb();
            let name = device.name.to_uppercase();
            let large = LARGE_TOKENS.iter().find(|t| name.contains(*t));
            let mid = MID_TOKENS.iter().find(|t| name.contains(*t));

            if large.is_some() || total_gb > 20.0 {
                entries.insert(LogicalComponent::Generator.to_string(), device.index);
                if let Some(token) = large {
                    entries.insert(token.to_string(), device.index);
                }
            } else if mid.is_some() || (total_gb > 10.0 && total_gb <= 20.0) {
                entries.insert(LogicalComponent::Transcriber.to_string(), device.index);
                if let Some(token) = mid {
                    entries.insert(token.to_string(), device.index);
                }
            } else {
                entries.insert(LogicalComponent::Synthesizer.to_string(), device.index);
            }
        }

        let first = devices[0].index;
        entries
            .entry(LogicalComponent::Generator.to_string())
            .or_insert(first);
        let transcriber = *entries
            .entry(LogicalComponent::Transcriber.to_string())
            .or_insert_with(|| devices.get(1).map(|d| d.index).unwrap_or(first));
        entries
            .entry(LogicalComponent::Synthesizer.to_string())
            .or_insert(transcriber);
        entries
            .entry(LogicalComponent::Detector.to_string())
            .or_insert(transcriber);

        Self { entries }
    }

    /// Explicit override if it parses, auto-detection otherwise.
    pub fn build(override_spec: Option<&str>, devices: &[DeviceCapability]) -> Self {
        if let Some(spec) = override_spec.filter(|s| !s.trim().is_empty()) {
            match Self::parse_override(spec) {
                Ok(map) => {
                    info!(entries = ?map.entries, "device map from override");
                    return map;
                }
                Err(e) => warn!("{}, falling back to auto-detection", e),
            }
        }
        let map = Self::auto_detect(devices);
        info!(entries = ?map.entries, "device map auto-detected");
        map
    }

    pub fn get(&self, role: &str) -> Option<usize> {
        self.entries.get(role).copied()
    }

    pub fn entries(&self) -> &BTreeMap<String, usize> {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
