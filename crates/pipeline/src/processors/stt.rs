//! Speech-to-text stage

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use voicebot_core::{
    AudioFrame, ControlFrame, Frame, FrameProcessor, ProcessorContext, Result, SpeechToText, TurnRole,
};

const DEFAULT_MAX_UTTERANCE: Duration = Duration::from_secs(30);
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Utterance {
    speaking: bool,
    chunks: Vec<AudioFrame>,
    /// Audio buffered for the current utterance
    buffered: Duration,
    /// When audio last arrived while speaking
    last_audio: Option<Instant>,
    /// The utterance was cut before the VAD reported the end of speech
    cut: bool,
}

impl Utterance {
    /// End the utterance early; audio is ignored until the next start
    fn cut(&mut self) -> Vec<AudioFrame> {
        let chunks = std::mem::take(&mut self.chunks);
        *self = Utterance {
            cut: true,
            ..Default::default()
        };
        chunks
    }
}

/// Buffers one utterance of audio and transcribes it when speech stops
///
/// Emits the user's text fragments ahead of the `UserStoppedSpeaking` frame,
/// so the user aggregator sees the words before the boundary. Audio frames
/// end here.
///
/// An utterance longer than `max_utterance`, or one that receives no audio
/// for `stall_timeout`, is transcribed straight away and closed with a
/// `UserStoppedSpeaking` of its own. The VAD's late stop is then swallowed.
pub struct SttProcessor {
    stt: Arc<dyn SpeechToText>,
    max_utterance: Duration,
    stall_timeout: Duration,
    utterance: Mutex<Utterance>,
}

impl SttProcessor {
    pub fn new(stt: Arc<dyn SpeechToText>) -> Self {
        Self {
            stt,
            max_utterance: DEFAULT_MAX_UTTERANCE,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            utterance: Mutex::new(Utterance::default()),
        }
    }

    /// Bound utterance length and how long to wait on a silent stream
    pub fn with_limits(mut self, max_utterance: Duration, stall_timeout: Duration) -> Self {
        self.max_utterance = max_utterance;
        self.stall_timeout = stall_timeout;
        self
    }

    async fn transcribe(&self, chunks: &[AudioFrame], context: &ProcessorContext) -> Result<Vec<Frame>> {
        let Some(audio) = AudioFrame::concat(chunks) else {
            return Ok(vec![]);
        };

        let started = Instant::now();
        let fragments = self.stt.transcribe(&audio).await?;
        metrics::histogram!("voicebot_stt_latency_seconds").record(started.elapsed().as_secs_f64());

        tracing::debug!(
            session_id = %context.session_id,
            model = self.stt.model_name(),
            audio_ms = audio.duration.as_millis() as u64,
            fragments = fragments.len(),
            "Utterance transcribed"
        );

        Ok(fragments
            .into_iter()
            .filter(|f| !f.is_blank())
            .map(|f| Frame::Text {
                text: f.text,
                role: TurnRole::User,
                is_final: f.is_final,
            })
            .collect())
    }

    /// Transcribe a cut utterance and close the user's turn
    async fn finish_early(&self, chunks: Vec<AudioFrame>, context: &ProcessorContext) -> Result<Vec<Frame>> {
        let mut out = self.transcribe(&chunks, context).await?;
        out.push(Frame::Control(ControlFrame::UserStoppedSpeaking));
        Ok(out)
    }
}

#[async_trait]
impl FrameProcessor for SttProcessor {
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match frame {
            Frame::AudioInput(audio) => {
                let chunks = {
                    let mut utterance = self.utterance.lock();
                    if !utterance.speaking {
                        return Ok(vec![]);
                    }
                    utterance.buffered += audio.duration;
                    utterance.last_audio = Some(Instant::now());
                    utterance.chunks.push(audio);
                    if utterance.buffered < self.max_utterance {
                        return Ok(vec![]);
                    }
                    utterance.cut()
                };
                tracing::debug!(
                    session_id = %context.session_id,
                    max_ms = self.max_utterance.as_millis() as u64,
                    "Utterance reached the length limit"
                );
                self.finish_early(chunks, context).await
            }
            Frame::Control(ControlFrame::UserStartedSpeaking) => {
                *self.utterance.lock() = Utterance {
                    speaking: true,
                    last_audio: Some(Instant::now()),
                    ..Default::default()
                };
                Ok(vec![frame])
            }
            Frame::Control(ControlFrame::UserStoppedSpeaking) => {
                let (chunks, was_cut) = {
                    let mut utterance = self.utterance.lock();
                    let was_cut = utterance.cut;
                    let chunks = std::mem::take(&mut utterance.chunks);
                    *utterance = Utterance::default();
                    (chunks, was_cut)
                };
                if was_cut {
                    return Ok(vec![]);
                }

                let mut out = self.transcribe(&chunks, context).await?;
                out.push(frame);
                Ok(out)
            }
            Frame::Control(ControlFrame::Cancel) => {
                *self.utterance.lock() = Utterance::default();
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "stt"
    }

    fn idle_interval(&self) -> Option<Duration> {
        Some((self.stall_timeout / 4).clamp(Duration::from_millis(10), Duration::from_millis(250)))
    }

    async fn on_idle(&self, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        let chunks = {
            let mut utterance = self.utterance.lock();
            match utterance.last_audio {
                Some(at) if utterance.speaking && at.elapsed() >= self.stall_timeout => utterance.cut(),
                _ => return Ok(vec![]),
            }
        };
        tracing::debug!(session_id = %context.session_id, "No audio while speaking, closing the utterance");
        self.finish_early(chunks, context).await
    }
}
