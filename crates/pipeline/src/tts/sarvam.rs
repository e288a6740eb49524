//! Sarvam AI text-to-speech
//!
//! One request per sentence. The service returns base64 WAV audio which is
//! decoded and cut into 20ms frames for the transport.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use voicebot_config::TtsSettings;
use voicebot_core::{AudioFrame, Result, TextToSpeech};

use crate::wav::{decode_wav, into_frames};
use crate::PipelineError;

/// Sarvam TTS configuration
#[derive(Debug, Clone)]
pub struct SarvamTtsConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub language: String,
    pub pace: f32,
    pub sample_rate: u32,
    pub timeout: Duration,
}

impl SarvamTtsConfig {
    /// Build from settings; the API key must already be resolved
    pub fn from_settings(settings: &TtsSettings) -> std::result::Result<Self, PipelineError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PipelineError::Config("TTS API key is not set".to_string()))?;

        Ok(Self {
            endpoint: settings.endpoint.clone(),
            api_key,
            model: settings.model.clone(),
            voice: settings.voice.clone(),
            language: settings.language.clone(),
            pace: settings.pace,
            sample_rate: settings.sample_rate,
            timeout: Duration::from_millis(settings.timeout_ms),
        })
    }
}

#[derive(Debug, Serialize)]
struct SarvamTtsRequest<'a> {
    text: &'a str,
    target_language_code: &'a str,
    speaker: &'a str,
    model: &'a str,
    pace: f32,
    speech_sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct SarvamTtsResponse {
    #[serde(default)]
    audios: Vec<String>,
}

/// Sarvam TTS client
pub struct SarvamTts {
    config: SarvamTtsConfig,
    client: reqwest::Client,
    sequence: AtomicU64,
}

impl SarvamTts {
    pub fn new(config: SarvamTtsConfig) -> std::result::Result<Self, PipelineError> {
        if config.api_key.trim().is_empty() {
            return Err(PipelineError::Config("TTS API key is empty".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!(
            endpoint = %config.endpoint,
            model = %config.model,
            voice = %config.voice,
            "Sarvam TTS client ready"
        );

        Ok(Self {
            config,
            client,
            sequence: AtomicU64::new(0),
        })
    }

    fn request_body<'a>(&'a self, text: &'a str) -> SarvamTtsRequest<'a> {
        SarvamTtsRequest {
            text,
            target_language_code: &self.config.language,
            speaker: &self.config.voice,
            model: &self.config.model,
            pace: self.config.pace,
            speech_sample_rate: self.config.sample_rate,
        }
    }
}

/// Decode every base64 WAV clip in a response into one sample buffer
fn decode_audios(audios: &[String]) -> std::result::Result<(Vec<f32>, u32), PipelineError> {
    let mut samples = Vec::new();
    let mut rate = 0;
    for clip in audios {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(clip.trim())
            .map_err(|e| PipelineError::Tts(format!("invalid base64 audio: {}", e)))?;
        let (decoded, clip_rate) = decode_wav(&bytes)?;
        if rate != 0 && clip_rate != rate {
            return Err(PipelineError::Tts(format!(
                "mixed sample rates in response: {} and {}",
                rate, clip_rate
            )));
        }
        rate = clip_rate;
        samples.extend(decoded);
    }
    Ok((samples, rate))
}

#[async_trait]
impl TextToSpeech for SarvamTts {
    async fn synthesize(&self, text: &str) -> Result<Vec<AudioFrame>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .client
            .post(&self.config.endpoint)
            .header("api-subscription-key", &self.config.api_key)
            .json(&self.request_body(text))
            .send()
            .await
            .map_err(|e| PipelineError::Tts(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Tts(format!("service returned {}: {}", status, body)).into());
        }

        let body: SarvamTtsResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Tts(format!("invalid response: {}", e)))?;

        if body.audios.is_empty() {
            tracing::warn!(chars = text.len(), "TTS response carried no audio");
            return Ok(Vec::new());
        }

        let (samples, rate) = decode_audios(&body.audios)?;
        let frame_count = samples.len().div_ceil(((rate as usize) / 50).max(1)) as u64;
        let first = self.sequence.fetch_add(frame_count, Ordering::Relaxed);
        Ok(into_frames(samples, rate, first))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}
