//! Transport output stage

use async_trait::async_trait;
use std::sync::Arc;
use voicebot_core::{ControlFrame, Error, Frame, FrameProcessor, ProcessorContext, Result};
use voicebot_transport::AudioSink;

/// Writes synthesized audio to the peer
pub struct TransportOutputProcessor {
    sink: Arc<dyn AudioSink>,
}

impl TransportOutputProcessor {
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl FrameProcessor for TransportOutputProcessor {
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match &frame {
            Frame::AudioOutput(audio) => {
                self.sink
                    .send_audio(audio)
                    .await
                    .map_err(|e| Error::Transport(e.to_string()))?;
            }
            Frame::Control(ControlFrame::Interruption) => {
                if let Err(e) = self.sink.flush().await {
                    tracing::warn!(session_id = %context.session_id, error = %e, "Failed to flush audio after interruption");
                }
            }
            _ => {}
        }
        Ok(vec![frame])
    }

    fn name(&self) -> &'static str {
        "transport_output"
    }
}
