//! Pipeline tuning

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and capacity knobs for a session pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Energy above which a chunk counts as speech (dBFS)
    #[serde(default = "default_vad_threshold_db")]
    pub vad_threshold_db: f32,

    /// Speech needed before reporting speech-started
    #[serde(default = "default_min_speech_ms")]
    pub min_speech_ms: u64,

    /// Silence needed before reporting speech-stopped
    #[serde(default = "default_min_silence_ms")]
    pub min_silence_ms: u64,

    /// Longest a turn waits for a stop boundary once content is buffered
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,

    /// Longest single utterance sent to speech-to-text
    #[serde(default = "default_max_utterance_ms")]
    pub max_utterance_ms: u64,

    /// How long `cancel()` waits for stages before aborting them
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Capacity of each inter-stage channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Let user speech interrupt the assistant
    #[serde(default = "default_true")]
    pub allow_interruptions: bool,
}

fn default_vad_threshold_db() -> f32 {
    -35.0
}

fn default_min_speech_ms() -> u64 {
    200
}

fn default_min_silence_ms() -> u64 {
    800
}

fn default_turn_timeout_ms() -> u64 {
    5_000
}

fn default_max_utterance_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    2_000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_true() -> bool {
    true
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vad_threshold_db: default_vad_threshold_db(),
            min_speech_ms: default_min_speech_ms(),
            min_silence_ms: default_min_silence_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
            max_utterance_ms: default_max_utterance_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            channel_capacity: default_channel_capacity(),
            allow_interruptions: true,
        }
    }
}

impl PipelineConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }

    pub fn max_utterance(&self) -> Duration {
        Duration::from_millis(self.max_utterance_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
