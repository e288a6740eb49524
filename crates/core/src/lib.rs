//! Core traits and types for the voice agent
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types and resampling helpers
//! - Conversation turns and the append-only conversation context
//! - Pipeline frames and the `FrameProcessor` stage contract
//! - Traits for the external services (STT, LLM, TTS, VAD)
//! - Error types

pub mod audio;
pub mod conversation;
pub mod error;
pub mod traits;
pub mod transcript;

pub use audio::{AudioFrame, Channels, SampleRate};
pub use conversation::{ConversationContext, Turn, TurnRole};
pub use error::{Error, Result};
pub use transcript::Transcription;

pub use traits::{
    // Pipeline
    ControlFrame, Frame, FrameProcessor, ProcessorContext,
    // LLM
    FinishReason, GenerationResult, LanguageModel,
    // Speech
    SpeechToText, TextToSpeech, VadEvent, VoiceActivityDetector,
};
