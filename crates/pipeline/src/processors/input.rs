//! Transport input stage: normalizes peer audio and marks speech boundaries

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use voicebot_core::{
    AudioFrame, ControlFrame, Frame, FrameProcessor, ProcessorContext, Result, SampleRate, VadEvent,
    VoiceActivityDetector,
};

/// Resamples incoming audio and runs voice activity detection on it
///
/// Emits `UserStartedSpeaking` before the chunk that started speech and
/// `UserStoppedSpeaking` after the chunk that ended it.
pub struct TransportInputProcessor {
    vad: Arc<dyn VoiceActivityDetector>,
    target_rate: SampleRate,
    frames_in: AtomicU64,
}

impl TransportInputProcessor {
    pub fn new(vad: Arc<dyn VoiceActivityDetector>) -> Self {
        Self {
            vad,
            target_rate: SampleRate::Hz16000,
            frames_in: AtomicU64::new(0),
        }
    }

    pub fn with_sample_rate(mut self, rate: SampleRate) -> Self {
        self.target_rate = rate;
        self
    }

    pub fn frames_in(&self) -> u64 {
        self.frames_in.load(Ordering::Relaxed)
    }

    fn normalize(&self, frame: AudioFrame) -> AudioFrame {
        if frame.sample_rate == self.target_rate {
            frame
        } else {
            frame.resample(self.target_rate)
        }
    }
}

#[async_trait]
impl FrameProcessor for TransportInputProcessor {
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match frame {
            Frame::AudioInput(audio) => {
                self.frames_in.fetch_add(1, Ordering::Relaxed);
                let audio = self.normalize(audio);

                let event = self.vad.process(&audio).unwrap_or_else(|e| {
                    tracing::warn!(session_id = %context.session_id, error = %e, "VAD failed on chunk");
                    VadEvent::None
                });

                Ok(match event {
                    VadEvent::SpeechStarted => {
                        tracing::debug!(session_id = %context.session_id, "User started speaking");
                        vec![Frame::Control(ControlFrame::UserStartedSpeaking), Frame::AudioInput(audio)]
                    }
                    VadEvent::SpeechStopped => {
                        tracing::debug!(session_id = %context.session_id, "User stopped speaking");
                        vec![Frame::AudioInput(audio), Frame::Control(ControlFrame::UserStoppedSpeaking)]
                    }
                    VadEvent::None => vec![Frame::AudioInput(audio)],
                })
            }
            Frame::Control(ControlFrame::Cancel) => {
                self.vad.reset();
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "transport_input"
    }
}
