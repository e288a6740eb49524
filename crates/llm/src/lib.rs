//! Language model backends
//!
//! Features:
//! - Google Gemini over the streaming `streamGenerateContent` API (SSE)
//! - Local Ollama over the NDJSON chat API
//! - Retry with exponential backoff until the first fragment arrives
//!
//! Both backends implement [`voicebot_core::LanguageModel`].

pub mod factory;
pub mod gemini;
pub mod ollama;
mod stream;

pub use factory::create_language_model;
pub use gemini::{GeminiBackend, GeminiConfig};
pub use ollama::{OllamaBackend, OllamaConfig};

use std::time::Duration;
use thiserror::Error;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl LlmError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::Network(_) | LlmError::Timeout)
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for voicebot_core::Error {
    fn from(err: LlmError) -> Self {
        voicebot_core::Error::Llm(err.to_string())
    }
}

/// Retry policy shared by the HTTP backends
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Doubles after each failed attempt
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Run `attempt` until it succeeds, fails permanently or retries run out
    pub async fn run<T, F, Fut>(&self, model: &str, mut attempt: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, LlmError>>,
    {
        let mut backoff = self.initial_backoff;
        let mut tries = 0;
        loop {
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && tries < self.max_retries => {
                    tries += 1;
                    tracing::warn!(
                        model,
                        error = %e,
                        attempt = tries,
                        max_retries = self.max_retries,
                        backoff = ?backoff,
                        "LLM request failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
        };

        let calls = &calls;
        let result = policy
            .run("m", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(LlmError::Network("reset".into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_api_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
        };

        let calls = &calls;
        let result: Result<(), _> = policy
            .run("m", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Api("bad request".into()))
            })
            .await;

        assert!(matches!(result, Err(LlmError::Api(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
