//! Frame processors for the conversation pipeline
//!
//! In pipeline order:
//! - TransportInputProcessor: resampling and voice activity boundaries
//! - SttProcessor: utterance transcription
//! - TurnAggregator (user): commits user turns and triggers the model
//! - LlmProcessor: streamed, interruptible replies
//! - TtsProcessor: speech synthesis
//! - TransportOutputProcessor: audio back to the peer
//! - TurnAggregator (assistant): commits assistant turns

mod aggregator;
mod input;
mod llm;
mod output;
mod sentence;
mod stt;
mod tts;

pub use aggregator::TurnAggregator;
pub use input::TransportInputProcessor;
pub use llm::LlmProcessor;
pub use output::TransportOutputProcessor;
pub use sentence::SentenceSplitter;
pub use stt::SttProcessor;
pub use tts::TtsProcessor;
