//! Sarvam AI speech-to-text
//!
//! Each utterance is uploaded as a 16kHz WAV file in a multipart form and
//! the service answers with one transcript.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use voicebot_config::SttSettings;
use voicebot_core::{AudioFrame, Result, SampleRate, SpeechToText, Transcription};

use crate::wav::encode_wav;
use crate::PipelineError;

/// Utterances shorter than this are not sent (100ms at 16kHz)
const MIN_AUDIO_SAMPLES: usize = 1600;

/// Sarvam STT configuration
#[derive(Debug, Clone)]
pub struct SarvamSttConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    /// BCP-47 code, e.g. "en-IN"
    pub language: String,
    pub timeout: Duration,
}

impl SarvamSttConfig {
    /// Build from settings; the API key must already be resolved
    pub fn from_settings(settings: &SttSettings) -> std::result::Result<Self, PipelineError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("STT API key is not set".to_string()))?;

        Ok(Self {
            endpoint: settings.endpoint.clone(),
            api_key,
            model: settings.model.clone(),
            language: settings.language.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SarvamSttResponse {
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    language_code: Option<String>,
}

/// Sarvam STT client
pub struct SarvamStt {
    config: SarvamSttConfig,
    client: reqwest::Client,
}

impl SarvamStt {
    pub fn new(config: SarvamSttConfig) -> std::result::Result<Self, PipelineError> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Config("STT API key is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            language = %config.language,
            "Sarvam STT client ready"
        );

        Ok(Self { config, client })
    }

    async fn request(&self, wav: Vec<u8>) -> std::result::Result<SarvamSttResponse, PipelineError> {
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.config.model.clone())
            .text("language_code", self.config.language.clone());

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("api-subscription-key", &self.config.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Stt(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Stt(format!("service returned {}: {}", status, body)));
        }

        response
            .json()
            .await
            .map_err(|e| PipelineError::Stt(format!("invalid response: {}", e)))
    }
}

#[async_trait]
impl SpeechToText for SarvamStt {
    async fn transcribe(&self, audio: &AudioFrame) -> Result<Vec<Transcription>> {
        let audio = audio.resample(SampleRate::Hz16000);
        if audio.samples.len() < MIN_AUDIO_SAMPLES {
            tracing::debug!(samples = audio.samples.len(), "Utterance too short to transcribe");
            return Ok(Vec::new());
        }

        let wav = encode_wav(&audio)?;
        let response = self.request(wav).await?;

        let text = response.transcript.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let mut fragment = Transcription::final_text(text);
        fragment.language = response.language_code.or_else(|| Some(self.config.language.clone()));
        Ok(vec![fragment])
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
