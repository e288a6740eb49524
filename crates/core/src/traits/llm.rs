//! Language Model traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{Result, Turn};

/// Outcome of one generation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationResult {
    /// Generated text
    pub text: String,
    /// Tokens generated (as reported by the backend, or estimated)
    pub tokens: usize,
    /// Time to first token (ms)
    pub time_to_first_token_ms: u64,
    /// Total generation time (ms)
    pub total_time_ms: u64,
    /// Finish reason
    pub finish_reason: FinishReason,
}

/// Finish reason
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    #[default]
    Stop,
    Length,
    Error,
    Cancelled,
}

/// Language Model interface
///
/// Implementations:
/// - `GeminiBackend` - Google Gemini streaming API
/// - `OllamaBackend` - Local Ollama inference
///
/// # Example
///
/// ```ignore
/// let (tx, mut rx) = mpsc::channel(64);
/// let result = llm.generate_stream(&context.snapshot(), tx).await?;
/// ```
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Stream text fragments for the given history into `tx`
    ///
    /// Resolves once the model has finished. A closed receiver ends the
    /// generation early with [`FinishReason::Cancelled`].
    async fn generate_stream(&self, turns: &[Turn], tx: mpsc::Sender<String>) -> Result<GenerationResult>;

    /// Check if model is available
    async fn is_available(&self) -> bool {
        true
    }

    /// Get model name for logging
    fn model_name(&self) -> &str;

    /// Estimate token count for text
    fn estimate_tokens(&self, text: &str) -> usize {
        // ~4 characters per token
        text.len().div_ceil(4)
    }
}
