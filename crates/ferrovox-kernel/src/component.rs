//! Logical pipeline components and backend tiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One stage of the voice pipeline that needs its own backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicalComponent {
    /// Speech / voice-activity detection
    Detector,
    /// Speech-to-text
    Transcriber,
    /// Text generation (also used for transcript enhancement)
    Generator,
    /// Text-to-speech
    Synthesizer,
}

impl LogicalComponent {
    pub const ALL: [LogicalComponent; 4] = [
        LogicalComponent::Detector,
        LogicalComponent::Transcriber,
        LogicalComponent::Generator,
        LogicalComponent::Synthesizer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalComponent::Detector => "detector",
            LogicalComponent::Transcriber => "transcriber",
            LogicalComponent::Generator => "generator",
            LogicalComponent::Synthesizer => "synthesizer",
        }
    }
}

impl fmt::Display for LogicalComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalComponent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "detector" => Ok(LogicalComponent::Detector),
            "transcriber" => Ok(LogicalComponent::Transcriber),
            "generator" => Ok(LogicalComponent::Generator),
            "synthesizer" => Ok(LogicalComponent::Synthesizer),
            other => Err(format!("unknown logical component: {other}")),
        }
    }
}

/// Which backend currently serves a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Primary,
    Fallback,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Primary => "primary",
            Tier::Fallback => "fallback",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
