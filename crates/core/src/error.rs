//! Error types shared across crates

use thiserror::Error;

/// Result alias using the core error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type
///
/// Crate-specific errors (`PipelineError`, `LlmError`, ...) convert into this
/// so stages can return a single error type through `FrameProcessor`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

/// Pipeline-level errors surfaced by the core types
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("VAD error: {0}")]
    Vad(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Context sealed")]
    ContextSealed,
}

impl Error {
    /// Whether the pipeline can keep running after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Pipeline(PipelineError::Audio(_)))
    }
}
