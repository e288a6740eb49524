//! Session pipeline for the voice agent
//!
//! This crate provides:
//! - `Pipeline`: a fixed chain of frame processors, one tokio task per stage
//! - `PipelineTask`: start / inject / cancel / wait for one pipeline run
//! - The conversation stages (transport input, STT, turn aggregators, LLM,
//!   TTS, transport output)
//! - Energy-based voice activity detection
//! - HTTP clients for the Sarvam speech services

pub mod pipeline;
pub mod processors;
pub mod stt;
pub mod task;
pub mod tts;
pub mod vad;
pub mod voice;
mod wav;

pub use pipeline::{Pipeline, PipelineBuilder, RunningPipeline};
pub use processors::{
    LlmProcessor, SentenceSplitter, SttProcessor, TransportInputProcessor,
    TransportOutputProcessor, TtsProcessor, TurnAggregator,
};
pub use stt::{SarvamStt, SarvamSttConfig};
pub use task::{spawn_audio_feed, PipelineTask, PipelineTaskConfig, TaskOutcome, TaskState};
pub use tts::{SarvamTts, SarvamTtsConfig};
pub use vad::{EnergyVad, EnergyVadConfig};
pub use voice::{build_voice_pipeline, VoiceServices};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("VAD error: {0}")]
    Vad(String),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Task not running")]
    NotRunning,

    #[error("Task already started")]
    AlreadyStarted,

    #[error("Task cancelled")]
    Cancelled,

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<PipelineError> for voicebot_core::Error {
    fn from(err: PipelineError) -> Self {
        use voicebot_core::error::PipelineError as CorePipelineError;

        match err {
            PipelineError::Vad(msg) => voicebot_core::Error::Pipeline(CorePipelineError::Vad(msg)),
            PipelineError::Stt(msg) => voicebot_core::Error::Stt(msg),
            PipelineError::Tts(msg) => voicebot_core::Error::Tts(msg),
            PipelineError::ChannelClosed | PipelineError::NotRunning => {
                voicebot_core::Error::Pipeline(CorePipelineError::ChannelClosed)
            }
            PipelineError::AlreadyStarted => voicebot_core::Error::Config("task already started".into()),
            PipelineError::Cancelled => voicebot_core::Error::Cancelled,
            PipelineError::Audio(msg) => voicebot_core::Error::Pipeline(CorePipelineError::Audio(msg)),
            PipelineError::Config(msg) => voicebot_core::Error::Config(msg),
        }
    }
}
