//! Speech processing traits

use async_trait::async_trait;

use crate::{AudioFrame, Result, Transcription};

/// Speech-to-Text interface
///
/// Implementations:
/// - `SarvamStt` - Sarvam AI speech-to-text over HTTP
///
/// # Example
///
/// ```ignore
/// let stt: Arc<dyn SpeechToText> = Arc::new(SarvamStt::new(config)?);
/// for fragment in stt.transcribe(&utterance).await? {
///     println!("Transcribed: {}", fragment.text);
/// }
/// ```
#[async_trait]
pub trait SpeechToText: Send + Sync + 'static {
    /// Transcribe one utterance into zero or more text fragments
    async fn transcribe(&self, audio: &AudioFrame) -> Result<Vec<Transcription>>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}

/// Text-to-Speech interface
///
/// Implementations:
/// - `SarvamTts` - Sarvam AI text-to-speech over HTTP
#[async_trait]
pub trait TextToSpeech: Send + Sync + 'static {
    /// Synthesize text into audio chunks, in playback order
    async fn synthesize(&self, text: &str) -> Result<Vec<AudioFrame>>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}

/// Voice activity boundary reported for one audio chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStarted,
    SpeechStopped,
    None,
}

/// Voice activity detector
///
/// Stateful: boundaries depend on the chunks seen so far.
pub trait VoiceActivityDetector: Send + Sync + 'static {
    /// Feed one chunk and report a boundary, if any
    fn process(&self, frame: &AudioFrame) -> Result<VadEvent>;

    /// Whether the detector currently considers the user to be speaking
    fn is_speaking(&self) -> bool;

    /// Reset state
    fn reset(&self);
}
