//! Settings for the external speech and language services

use serde::{Deserialize, Serialize};

use crate::constants::{agent, endpoints, models};

/// Speech-to-text service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttSettings {
    #[serde(default = "default_stt_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_stt_model")]
    pub model: String,

    #[serde(default = "default_language")]
    pub language: String,

    /// Falls back to `SARVAM_API_KEY`
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_stt_endpoint() -> String {
    endpoints::SARVAM_STT.to_string()
}

fn default_stt_model() -> String {
    models::SARVAM_STT.to_string()
}

fn default_language() -> String {
    agent::LANGUAGE.to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for SttSettings {
    fn default() -> Self {
        Self {
            endpoint: default_stt_endpoint(),
            model: default_stt_model(),
            language: default_language(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Which language-model backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Gemini,
    Ollama,
}

/// Language model service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub provider: LlmProvider,

    /// Empty means the provider's default endpoint
    #[serde(default)]
    pub endpoint: String,

    /// Empty means the provider's default model
    #[serde(default)]
    pub model: String,

    /// Falls back to `GOOGLE_API_KEY` for Gemini
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> usize {
    512
}

fn default_max_retries() -> u32 {
    2
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            endpoint: String::new(),
            model: String::new(),
            api_key: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl LlmSettings {
    /// Endpoint with the provider default applied
    pub fn resolved_endpoint(&self) -> String {
        if !self.endpoint.is_empty() {
            return self.endpoint.clone();
        }
        match self.provider {
            LlmProvider::Gemini => endpoints::GEMINI.to_string(),
            LlmProvider::Ollama => endpoints::OLLAMA.to_string(),
        }
    }

    /// Model with the provider default applied
    pub fn resolved_model(&self) -> String {
        if !self.model.is_empty() {
            return self.model.clone();
        }
        match self.provider {
            LlmProvider::Gemini => models::GEMINI.to_string(),
            LlmProvider::Ollama => models::OLLAMA.to_string(),
        }
    }
}

/// Text-to-speech service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsSettings {
    #[serde(default = "default_tts_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_tts_model")]
    pub model: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_language")]
    pub language: String,

    #[serde(default = "default_pace")]
    pub pace: f32,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Falls back to `SARVAM_API_KEY`
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_tts_endpoint() -> String {
    endpoints::SARVAM_TTS.to_string()
}

fn default_tts_model() -> String {
    models::SARVAM_TTS.to_string()
}

fn default_voice() -> String {
    models::SARVAM_TTS_VOICE.to_string()
}

fn default_pace() -> f32 {
    1.0
}

fn default_sample_rate() -> u32 {
    24_000
}

impl Default for TtsSettings {
    fn default() -> Self {
        Self {
            endpoint: default_tts_endpoint(),
            model: default_tts_model(),
            voice: default_voice(),
            language: default_language(),
            pace: default_pace(),
            sample_rate: default_sample_rate(),
            api_key: None,
            timeout_ms: default_timeout_ms(),
        }
    }
}
