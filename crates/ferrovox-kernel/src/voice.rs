//! Voice Stage Payloads
//!
//! Inputs and outputs exchanged with backends at every pipeline stage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Input to a backend invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    /// Raw audio waveform data (f32 samples, usually 16kHz)
    Audio(Vec<f32>),
    /// Text transcript or prompt
    Text(String),
}

/// Result of a speech detector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SpeechScore {
    /// Backend only answers yes / no
    Binary(bool),
    /// Backend reports a continuous score in [0, 1]
    Probability(f32),
}

impl SpeechScore {
    /// Continuous score; binary answers map to 0.0 / 1.0.
    pub fn probability(&self) -> f32 {
        match self {
            SpeechScore::Binary(true) => 1.0,
            SpeechScore::Binary(false) => 0.0,
            SpeechScore::Probability(p) => p.clamp(0.0, 1.0),
        }
    }

    pub fn is_active(&self, threshold: f32) -> bool {
        match self {
            SpeechScore::Binary(active) => *active,
            SpeechScore::Probability(p) => *p > threshold,
        }
    }
}

/// Output from a backend invocation
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// Raw audio waveform data (f32 samples)
    Audio(Vec<f32>),
    /// Plain text output (generation, enhancement)
    Text(String),
    /// Transcription with an optional backend-reported confidence
    Transcript {
        text: String,
        confidence: Option<f32>,
    },
    /// Speech detection verdict
    Speech(SpeechScore),
    /// Stage produced nothing (e.g. enhancement declined)
    Empty,
}

impl StageOutput {
    /// Text carried by this output, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            StageOutput::Text(text) => Some(text),
            StageOutput::Transcript { text, .. } => Some(text),
            _ => None,
        }
    }
}

impl fmt::Display for StageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageInput::Audio(samples) => write!(f, "Audio({} samples)", samples.len()),
            StageInput::Text(text) => write!(f, "Text({} chars)", text.len()),
        }
    }
}

impl fmt::Display for StageOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageOutput::Audio(samples) => write!(f, "Audio({} samples)", samples.len()),
            StageOutput::Text(text) => write!(f, "Text({} chars)", text.len()),
            StageOutput::Transcript { text, .. } => write!(f, "Transcript({} chars)", text.len()),
            StageOutput::Speech(score) => write!(f, "Speech({:.2})", score.probability()),
            StageOutput::Empty => write!(f, "Empty"),
        }
    }
}

impl From<String> for StageInput {
    fn from(text: String) -> Self {
        StageInput::Text(text)
    }
}

impl From<&str> for StageInput {
    fn from(text: &str) -> Self {
        StageInput::Text(text.to_string())
    }
}

impl From<Vec<f32>> for StageInput {
    fn from(samples: Vec<f32>) -> Self {
        StageInput::Audio(samples)
    }
}

impl From<String> for StageOutput {
    fn from(text: String) -> Self {
        StageOutput::Text(text)
    }
}

impl From<SpeechScore> for StageOutput {
    fn from(score: SpeechScore) -> Self {
        StageOutput::Speech(score)
    }
}
