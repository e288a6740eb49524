//! Energy-based voice activity detection
//!
//! A chunk counts as speech when its RMS energy is above the threshold.
//! Speech must last `min_speech_ms` before it is confirmed and silence must
//! last `min_silence_ms` before speech is considered over, which keeps short
//! clicks and breathing pauses from producing boundaries.

use parking_lot::Mutex;
use std::time::Duration;
use voicebot_config::PipelineConfig;
use voicebot_core::{AudioFrame, Result, VadEvent, VoiceActivityDetector};

/// Energy VAD configuration
#[derive(Debug, Clone)]
pub struct EnergyVadConfig {
    /// Energy above which a chunk counts as speech (dBFS)
    pub threshold_db: f32,
    pub min_speech: Duration,
    pub min_silence: Duration,
}

impl Default for EnergyVadConfig {
    fn default() -> Self {
        Self {
            threshold_db: -35.0,
            min_speech: Duration::from_millis(200),
            min_silence: Duration::from_millis(800),
        }
    }
}

impl From<&PipelineConfig> for EnergyVadConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            threshold_db: config.vad_threshold_db,
            min_speech: Duration::from_millis(config.min_speech_ms),
            min_silence: Duration::from_millis(config.min_silence_ms),
        }
    }
}

/// VAD state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VadState {
    #[default]
    Silence,
    /// Potential speech start (accumulating)
    SpeechStart,
    /// Active speech confirmed
    Speech,
    /// Potential speech end (accumulating silence)
    SpeechEnd,
}

#[derive(Debug, Default)]
struct VadMutableState {
    state: VadState,
    speech: Duration,
    silence: Duration,
}

/// Energy-threshold voice activity detector
pub struct EnergyVad {
    config: EnergyVadConfig,
    mutable: Mutex<VadMutableState>,
}

impl EnergyVad {
    pub fn new(config: EnergyVadConfig) -> Self {
        Self {
            config,
            mutable: Mutex::new(VadMutableState::default()),
        }
    }

    pub fn state(&self) -> VadState {
        self.mutable.lock().state
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new(EnergyVadConfig::default())
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn process(&self, frame: &AudioFrame) -> Result<VadEvent> {
        let is_speech = frame.energy_db > self.config.threshold_db;
        let mut s = self.mutable.lock();

        let event = match (s.state, is_speech) {
            (VadState::Silence, true) => {
                s.state = VadState::SpeechStart;
                s.speech = frame.duration;
                s.silence = Duration::ZERO;
                if s.speech >= self.config.min_speech {
                    s.state = VadState::Speech;
                    VadEvent::SpeechStarted
                } else {
                    VadEvent::None
                }
            }
            (VadState::SpeechStart, true) => {
                s.speech += frame.duration;
                if s.speech >= self.config.min_speech {
                    s.state = VadState::Speech;
                    VadEvent::SpeechStarted
                } else {
                    VadEvent::None
                }
            }
            (VadState::SpeechStart, false) => {
                s.state = VadState::Silence;
                s.speech = Duration::ZERO;
                VadEvent::None
            }
            (VadState::Speech, true) => {
                s.silence = Duration::ZERO;
                VadEvent::None
            }
            (VadState::Speech, false) | (VadState::SpeechEnd, false) => {
                s.state = VadState::SpeechEnd;
                s.silence += frame.duration;
                if s.silence >= self.config.min_silence {
                    *s = VadMutableState::default();
                    VadEvent::SpeechStopped
                } else {
                    VadEvent::None
                }
            }
            (VadState::SpeechEnd, true) => {
                s.state = VadState::Speech;
                s.silence = Duration::ZERO;
                VadEvent::None
            }
            (VadState::Silence, false) => VadEvent::None,
        };

        Ok(event)
    }

    fn is_speaking(&self) -> bool {
        matches!(self.state(), VadState::Speech | VadState::SpeechEnd)
    }

    fn reset(&self) {
        *self.mutable.lock() = VadMutableState::default();
    }
}
