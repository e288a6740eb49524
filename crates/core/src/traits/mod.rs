//! Core traits for the voice agent system
//!
//! External services sit behind these traits so backends can be swapped by
//! configuration and replaced with mocks in tests.
//!
//! ```text
//! Speech Processing:
//!   - SpeechToText: Audio → Text fragments
//!   - TextToSpeech: Text → Audio chunks
//!   - VoiceActivityDetector: Audio → speech boundaries
//!
//! Language Models:
//!   - LanguageModel: Turns → streamed text
//!
//! Pipeline:
//!   - FrameProcessor: Process frames in the pipeline
//! ```

mod llm;
mod pipeline;
mod speech;

pub use llm::{FinishReason, GenerationResult, LanguageModel};
pub use pipeline::{ControlFrame, Frame, FrameProcessor, ProcessorContext};
pub use speech::{SpeechToText, TextToSpeech, VadEvent, VoiceActivityDetector};
