//! Fallback policy document
//!
//! ```yaml
//! fallback_config:
//!   transcriber:
//!     primary: large-v3
//!     fallback: base
//!     trigger:
//!       - { kind: latency, threshold_ms: 500 }
//!       - { kind: resource, threshold_gb: 2.0 }
//!       - { kind: exception, exception: out_of_memory }
//! ```

use ferrovox_kernel::config::{self, ConfigResult, FileFormat};
use ferrovox_kernel::{FaultKind, LogicalComponent, Tier, TriggerPolicy, TriggerRule, VoxError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

/// Primary / fallback identifiers and the rules that swap between them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentPolicy {
    pub primary: String,
    pub fallback: String,
    #[serde(default, rename = "trigger", alias = "triggers")]
    pub triggers: TriggerPolicy,
}

impl ComponentPolicy {
    pub fn new(primary: impl Into<String>, fallback: impl Into<String>) -> Self {
        Self {
            primary: primary.into(),
            fallback: fallback.into(),
            triggers: TriggerPolicy::default(),
        }
    }

    pub fn with_rule(mut self, rule: TriggerRule) -> Self {
        self.triggers.rules.push(rule);
        self
    }

    /// Identifier for a tier
    pub fn identifier(&self, tier: Tier) -> &str {
        match tier {
            Tier::Primary => &self.primary,
            Tier::Fallback => &self.fallback,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PolicyDocument {
    fallback_config: BTreeMap<LogicalComponent, ComponentPolicy>,
}

/// Per-component policies consumed by the fallback controller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FallbackPolicy {
    components: BTreeMap<LogicalComponent, ComponentPolicy>,
}

impl FallbackPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults used when no document is available.
    pub fn builtin() -> Self {
        let oom = || TriggerRule::exception(FaultKind::OutOfMemory);
        Self::new()
            .with_component(
                LogicalComponent::Transcriber,
                ComponentPolicy::new("large-v3", "base")
                    .with_rule(TriggerRule::latency(500.0))
                    .with_rule(TriggerRule::resource(2.0))
                    .with_rule(oom()),
            )
            .with_component(
                LogicalComponent::Generator,
                ComponentPolicy::new("llama-2-13b-chat.Q5_K_M.gguf", "phi-2.gguf")
                    .with_rule(TriggerRule::latency(2000.0))
                    .with_rule(TriggerRule::resource(4.0))
                    .with_rule(oom()),
            )
            .with_component(
                LogicalComponent::Synthesizer,
                ComponentPolicy::new("xtts-v2", "espeak")
                    .with_rule(TriggerRule::latency(1000.0))
                    .with_rule(TriggerRule::resource(1.0))
                    .with_rule(oom()),
            )
    }

    pub fn with_component(mut self, component: LogicalComponent, policy: ComponentPolicy) -> Self {
        self.components.insert(component, policy);
        self
    }

    pub fn get(&self, component: LogicalComponent) -> Option<&ComponentPolicy> {
        self.components.get(&component)
    }

    pub fn components(&self) -> impl Iterator<Item = (&LogicalComponent, &ComponentPolicy)> {
        self.components.iter()
    }

    /// Parse a policy document from a string.
    pub fn from_str(content: &str, format: FileFormat) -> ConfigResult<Self> {
        let doc: PolicyDocument = config::from_str(content, format)?;
        Ok(Self {
            components: doc.fallback_config,
        })
    }

    /// Load a policy document; format from the file extension.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let doc: PolicyDocument = config::load_config(path)?;
        Ok(Self {
            components: doc.fallback_config,
        })
    }

    /// Load the document, or fall back to [`FallbackPolicy::builtin`].
    ///
    /// Components the document does not mention keep their built-in policy.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            info!("no policy document configured, using built-in policy");
            return Self::builtin();
        };

        if !path.exists() {
            let err = VoxError::ConfigurationMissing(path.display().to_string());
            warn!("{}, using built-in policy", err);
            return Self::builtin();
        }

        match Self::load(path) {
            Ok(loaded) => {
                info!(path = %path.display(), components = loaded.components.len(), "policy loaded");
                let mut merged = Self::builtin();
                merged.components.extend(loaded.components);
                merged
            }
            Err(e) => {
                warn!(path = %path.display(), "policy unreadable ({}), using built-in policy", e);
                Self::builtin()
            }
        }
    }
}
