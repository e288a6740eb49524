//! Speech synthesis stage

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use voicebot_core::{Frame, FrameProcessor, ProcessorContext, Result, TextToSpeech, TurnRole};

/// Renders assistant text into audio
///
/// Audio frames for a sentence are emitted ahead of the sentence's text
/// frame, which continues downstream for the assistant aggregator.
pub struct TtsProcessor {
    tts: Arc<dyn TextToSpeech>,
}

impl TtsProcessor {
    pub fn new(tts: Arc<dyn TextToSpeech>) -> Self {
        Self { tts }
    }
}

#[async_trait]
impl FrameProcessor for TtsProcessor {
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        let text = match &frame {
            Frame::Text { text, role: TurnRole::Assistant, .. } => Some(text.trim().to_string()),
            _ => None,
        };
        let Some(text) = text.filter(|t| !t.is_empty()) else {
            return Ok(vec![frame]);
        };
        if context.is_cancelled() {
            return Ok(vec![]);
        }

        let started = Instant::now();
        let chunks = self.tts.synthesize(&text).await?;
        metrics::histogram!("voicebot_tts_latency_seconds").record(started.elapsed().as_secs_f64());

        tracing::debug!(
            session_id = %context.session_id,
            model = self.tts.model_name(),
            chars = text.len(),
            chunks = chunks.len(),
            "Synthesized sentence"
        );

        let mut out: Vec<Frame> = chunks.into_iter().map(Frame::AudioOutput).collect();
        out.push(frame);
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "tts"
    }
}
