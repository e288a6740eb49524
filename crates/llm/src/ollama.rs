//! Ollama backend
//!
//! Streams replies from the local `/api/chat` endpoint as NDJSON.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use voicebot_config::LlmSettings;
use voicebot_core::{FinishReason, GenerationResult, LanguageModel, Result, Turn};

use crate::stream::LineBuffer;
use crate::{LlmError, RetryPolicy};

/// Ollama configuration
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: voicebot_config::constants::endpoints::OLLAMA.to_string(),
            model: voicebot_config::constants::models::OLLAMA.to_string(),
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&LlmSettings> for OllamaConfig {
    fn from(settings: &LlmSettings) -> Self {
        Self {
            endpoint: settings.resolved_endpoint(),
            model: settings.resolved_model(),
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            timeout: Duration::from_millis(settings.timeout_ms),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                ..RetryPolicy::default()
            },
            ..Self::default()
        }
    }
}

/// Ollama backend
#[derive(Clone)]
pub struct OllamaBackend {
    client: Client,
    config: OllamaConfig,
}

impl OllamaBackend {
    pub fn new(config: OllamaConfig) -> std::result::Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn build_request(&self, turns: &[Turn]) -> OllamaChatRequest {
        OllamaChatRequest {
            model: self.config.model.clone(),
            messages: turns.iter().map(OllamaMessage::from).collect(),
            stream: true,
            options: Some(OllamaOptions {
                temperature: Some(self.config.temperature),
                top_p: Some(self.config.top_p),
                num_predict: Some(self.config.max_tokens as i32),
            }),
        }
    }

    async fn open_stream(&self, request: &OllamaChatRequest) -> std::result::Result<reqwest::Response, LlmError> {
        let response = self.client.post(self.api_url("/chat")).json(request).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let error = response.text().await.unwrap_or_default();
            // 5xx errors are retryable, 4xx are not
            if status.is_server_error() {
                return Err(LlmError::Network(format!("Server error {}: {}", status, error)));
            }
            return Err(LlmError::Api(error));
        }
        Ok(response)
    }

    async fn stream_reply(
        &self,
        turns: &[Turn],
        tx: mpsc::Sender<String>,
    ) -> std::result::Result<GenerationResult, LlmError> {
        let start = Instant::now();
        let request = self.build_request(turns);

        let (this, request) = (self, &request);
        let response = self
            .config
            .retry
            .run(&self.config.model, move || this.open_stream(request))
            .await?;

        let mut first_token_time = None;
        let mut total_tokens = 0;
        let mut eval_count = None;
        let mut full_response = String::new();
        let mut finish_reason = FinishReason::Stop;

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();

        'outer: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if line.trim().is_empty() {
                    continue;
                }
                let chunk_response: OllamaStreamChunk = serde_json::from_str(&line)
                    .map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, line)))?;

                if let Some(error) = chunk_response.error {
                    return Err(LlmError::Api(error));
                }

                let token = chunk_response.message.map(|m| m.content).unwrap_or_default();
                if !token.is_empty() {
                    first_token_time.get_or_insert_with(|| start.elapsed());
                    full_response.push_str(&token);
                    total_tokens += 1;

                    if tx.send(token).await.is_err() {
                        finish_reason = FinishReason::Cancelled;
                        break 'outer;
                    }
                }

                if chunk_response.done {
                    eval_count = chunk_response.eval_count;
                    if chunk_response.done_reason.as_deref() == Some("length") {
                        finish_reason = FinishReason::Length;
                    }
                    break 'outer;
                }
            }
        }

        Ok(GenerationResult {
            text: full_response,
            tokens: eval_count.map(|c| c as usize).unwrap_or(total_tokens),
            time_to_first_token_ms: first_token_time.map(|t: Duration| t.as_millis() as u64).unwrap_or(0),
            total_time_ms: start.elapsed().as_millis() as u64,
            finish_reason,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaBackend {
    async fn generate_stream(&self, turns: &[Turn], tx: mpsc::Sender<String>) -> Result<GenerationResult> {
        let result = self.stream_reply(turns, tx).await?;
        tracing::debug!(
            model = %self.config.model,
            tokens = result.tokens,
            ttft_ms = result.time_to_first_token_ms,
            total_ms = result.total_time_ms,
            "Ollama generation finished"
        );
        Ok(result)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(self.api_url("/tags"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// Ollama API types
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

impl From<&Turn> for OllamaMessage {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            content: turn.content.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct OllamaStreamChunk {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    eval_count: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}
