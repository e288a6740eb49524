//! Google Gemini backend
//!
//! Streams replies from `models/{model}:streamGenerateContent?alt=sse`.
//! The first turn of the conversation, when it is a system turn, becomes the
//! system instruction. Later system turns are sent as user content.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use voicebot_config::LlmSettings;
use voicebot_core::{FinishReason, GenerationResult, LanguageModel, Result, Turn, TurnRole};

use crate::stream::{sse_data, LineBuffer};
use crate::{LlmError, RetryPolicy};

/// Gemini configuration
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    /// API base, e.g. `https://generativelanguage.googleapis.com`
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl GeminiConfig {
    pub fn from_settings(settings: &LlmSettings) -> std::result::Result<Self, LlmError> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| LlmError::Configuration("Gemini API key is not set".to_string()))?;

        Ok(Self {
            endpoint: settings.resolved_endpoint(),
            api_key,
            model: settings.resolved_model(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            timeout: Duration::from_millis(settings.timeout_ms),
            retry: RetryPolicy {
                max_retries: settings.max_retries,
                ..RetryPolicy::default()
            },
        })
    }
}

/// Gemini streaming backend
pub struct GeminiBackend {
    client: Client,
    config: GeminiConfig,
}

impl GeminiBackend {
    pub fn new(config: GeminiConfig) -> std::result::Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    fn build_request(&self, turns: &[Turn]) -> GeminiRequest {
        let (system_instruction, rest) = match turns.split_first() {
            Some((first, rest)) if first.is_system() => (
                Some(SystemInstruction {
                    parts: vec![RequestPart {
                        text: first.content.clone(),
                    }],
                }),
                rest,
            ),
            _ => (None, turns),
        };

        let mut contents: Vec<RequestContent> = Vec::new();
        for turn in rest {
            let role = match turn.role {
                TurnRole::Assistant => "model",
                TurnRole::User | TurnRole::System => "user",
            };
            let part = RequestPart {
                text: turn.content.clone(),
            };
            match contents.last_mut() {
                Some(last) if last.role == role => last.parts.push(part),
                _ => contents.push(RequestContent {
                    role,
                    parts: vec![part],
                }),
            }
        }

        GeminiRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                temperature: self.config.temperature,
                max_output_tokens: self.config.max_tokens,
            },
        }
    }

    async fn open_stream(&self, request: &GeminiRequest) -> std::result::Result<reqwest::Response, LlmError> {
        let response = self
            .client
            .post(self.stream_url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 5xx and rate limits are retryable, other 4xx are not
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(LlmError::Network(format!("HTTP {}: {}", status, body)));
            }
            return Err(LlmError::Api(format!("HTTP {}: {}", status, body)));
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
        if request.contents.is_empty() {
            return Err(LlmError::Api("conversation has no content to respond to".to_string()));
        }

        let (this, request) = (self, &request);
        let response = self
            .config
            .retry
            .run(&self.config.model, move || this.open_stream(request))
            .await?;

        let mut body = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut reply = StreamState::new(start);

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if !reply.handle_line(&line, &tx).await? {
                    return Ok(reply.finish(FinishReason::Cancelled));
                }
            }
        }
        if let Some(line) = lines.finish() {
            if !reply.handle_line(&line, &tx).await? {
                return Ok(reply.finish(FinishReason::Cancelled));
            }
        }

        let reason = reply.finish_reason;
        Ok(reply.finish(reason))
    }
}

/// Accumulated state of one streamed reply
struct StreamState {
    start: Instant,
    text: String,
    first_token: Option<Duration>,
    tokens: Option<usize>,
    fragments: usize,
    finish_reason: FinishReason,
}

impl StreamState {
    fn new(start: Instant) -> Self {
        Self {
            start,
            text: String::new(),
            first_token: None,
            tokens: None,
            fragments: 0,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Returns false once the receiver is gone
    async fn handle_line(&mut self, line: &str, tx: &mpsc::Sender<String>) -> std::result::Result<bool, LlmError> {
        let Some(data) = sse_data(line) else {
            return Ok(true);
        };
        if data.is_empty() || data == "[DONE]" {
            return Ok(true);
        }

        let chunk: GeminiStreamChunk =
            serde_json::from_str(data).map_err(|e| LlmError::InvalidResponse(format!("{}: {}", e, data)))?;

        if let Some(error) = chunk.error {
            return Err(LlmError::Api(error.message));
        }
        if let Some(count) = chunk.usage_metadata.and_then(|u| u.candidates_token_count) {
            self.tokens = Some(count);
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return Ok(true);
        };
        if let Some(reason) = candidate.finish_reason.as_deref() {
            self.finish_reason = map_finish_reason(reason);
        }

        let parts = candidate.content.map(|c| c.parts).unwrap_or_default();
        for text in parts.into_iter().filter_map(|p| p.text) {
            if text.is_empty() {
                continue;
            }
            self.first_token.get_or_insert_with(|| self.start.elapsed());
            self.text.push_str(&text);
            self.fragments += 1;
            if tx.send(text).await.is_err() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn finish(self, finish_reason: FinishReason) -> GenerationResult {
        GenerationResult {
            tokens: self.tokens.unwrap_or(self.fragments),
            text: self.text,
            time_to_first_token_ms: self.first_token.map(|t| t.as_millis() as u64).unwrap_or(0),
            total_time_ms: self.start.elapsed().as_millis() as u64,
            finish_reason,
        }
    }
}

fn map_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "STOP" | "FINISH_REASON_UNSPECIFIED" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        _ => FinishReason::Error,
    }
}

#[async_trait]
impl LanguageModel for GeminiBackend {
    async fn generate_stream(&self, turns: &[Turn], tx: mpsc::Sender<String>) -> Result<GenerationResult> {
        let result = self.stream_reply(turns, tx).await?;
        tracing::debug!(
            model = %self.config.model,
            tokens = result.tokens,
            ttft_ms = result.time_to_first_token_ms,
            total_ms = result.total_time_ms,
            finish_reason = ?result.finish_reason,
            "Gemini generation finished"
        );
        Ok(result)
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(format!(
                "{}/v1beta/models/{}",
                self.config.endpoint.trim_end_matches('/'),
                self.config.model
            ))
            .header("x-goog-api-key", &self.config.api_key)
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// Gemini API types
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<RequestContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    role: &'static str,
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    max_output_tokens: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiStreamChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<ResponseContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    candidates_token_count: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use voicebot_core::ConversationContext;

    fn backend(endpoint: &str) -> GeminiBackend {
        GeminiBackend::new(GeminiConfig {
            endpoint: endpoint.to_string(),
            api_key: "test-key".into(),
            model: "gemini-2.5-flash".into(),
            temperature: 0.7,
            max_tokens: 128,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries: 0,
                initial_backoff: Duration::from_millis(1),
            },
        })
        .unwrap()
    }

    fn greeting_history() -> Vec<Turn> {
        let context = ConversationContext::with_system_prompt("You are a helpful assistant.");
        context.append(TurnRole::System, "Say hello.");
        context.snapshot()
    }

    #[test]
    fn test_request_mapping() {
        let context = ConversationContext::with_system_prompt("Persona");
        context.append(TurnRole::System, "Say hello.");
        context.append(TurnRole::Assistant, "Hello!");
        context.append(TurnRole::User, "hi");
        context.append(TurnRole::User, "there");

        let request = backend("http://unused").build_request(&context.snapshot());
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["systemInstruction"]["parts"][0]["text"], "Persona");
        assert_eq!(json["contents"][0]["role"], "user");
        assert_eq!(json["contents"][0]["parts"][0]["text"], "Say hello.");
        assert_eq!(json["contents"][1]["role"], "model");
        assert_eq!(json["contents"][2]["parts"].as_array().unwrap().len(), 2);
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 128);
    }

    #[test]
    fn test_settings_require_key() {
        assert!(GeminiConfig::from_settings(&LlmSettings::default()).is_err());

        let settings = LlmSettings {
            api_key: Some("k".into()),
            ..Default::default()
        };
        let config = GeminiConfig::from_settings(&settings).unwrap();
        assert_eq!(config.model, "gemini-2.5-flash");
        assert!(config.endpoint.starts_with("https://"));
    }

    #[test]
    fn test_finish_reasons() {
        assert_eq!(map_finish_reason("STOP"), FinishReason::Stop);
        assert_eq!(map_finish_reason("MAX_TOKENS"), FinishReason::Length);
        assert_eq!(map_finish_reason("SAFETY"), FinishReason::Error);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    async fn sse_reply(headers: HeaderMap) -> axum::response::Response {
        if headers.get("x-goog-api-key").and_then(|v| v.to_str().ok()) != Some("test-key") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hello! \"}]}}]}\r\n\r\n",
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"How can I help?\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"candidatesTokenCount\":6}}\r\n\r\n",
        );
        ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
    }

    #[tokio::test]
    async fn test_streams_fragments() {
        let endpoint = serve(Router::new().route("/v1beta/models/:model", post(sse_reply))).await;
        let llm = backend(&endpoint);

        let (tx, mut rx) = mpsc::channel(16);
        let result = llm.generate_stream(&greeting_history(), tx).await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("Hello! "));
        assert_eq!(rx.recv().await.as_deref(), Some("How can I help?"));
        assert_eq!(result.text, "Hello! How can I help?");
        assert_eq!(result.tokens, 6);
        assert_eq!(result.finish_reason, FinishReason::Stop);
    }

    #[tokio::test]
    async fn test_closed_receiver_cancels() {
        let endpoint = serve(Router::new().route("/v1beta/models/:model", post(sse_reply))).await;
        let llm = backend(&endpoint);

        let (tx, rx) = mpsc::channel(16);
        drop(rx);
        let result = llm.generate_stream(&greeting_history(), tx).await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::Cancelled);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let endpoint = serve(Router::new().route(
            "/v1beta/models/:model",
            post(|| async { (StatusCode::BAD_REQUEST, "bad") }),
        ))
        .await;
        let llm = backend(&endpoint);

        let (tx, _rx) = mpsc::channel(16);
        let err = llm.generate_stream(&greeting_history(), tx).await.unwrap_err();
        assert!(err.to_string().contains("400"));
    }

    #[tokio::test]
    async fn test_persona_alone_is_rejected() {
        let llm = backend("http://127.0.0.1:9");
        let history = ConversationContext::with_system_prompt("Persona").snapshot();
        let (tx, _rx) = mpsc::channel(16);
        assert!(llm.generate_stream(&history, tx).await.is_err());
    }
}
