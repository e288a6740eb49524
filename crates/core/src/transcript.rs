//! Transcription fragments produced by speech-to-text

use serde::{Deserialize, Serialize};

/// A transcribed text fragment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    /// Transcribed text
    pub text: String,
    /// Whether the engine will not revise this fragment any more
    pub is_final: bool,
    /// Confidence score (0.0 - 1.0), when the engine reports one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    /// Detected language code (e.g. "en-IN")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Transcription {
    /// Create a final transcription
    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
            ..Default::default()
        }
    }

    /// Create a partial (interim) transcription
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
            ..Default::default()
        }
    }

    /// Check if the fragment carries any text
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}
