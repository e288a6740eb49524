//! Pipeline processing traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;
use crate::{AudioFrame, Error, Result, TurnRole};

/// Frame types that flow through the pipeline
///
/// Frames are immutable once created; ownership moves from stage to stage.
#[derive(Debug, Clone)]
pub enum Frame {
    /// Audio received from the peer
    AudioInput(AudioFrame),

    /// Synthesized audio for playback to the peer
    AudioOutput(AudioFrame),

    /// Text fragment attributed to a speaker
    Text {
        text: String,
        role: TurnRole,
        is_final: bool,
    },

    /// Control frame for turn-taking and lifecycle
    Control(ControlFrame),

    /// Error occurred in pipeline
    Error {
        stage: String,
        message: String,
        recoverable: bool,
    },

    /// End of stream marker
    EndOfStream,
}

/// Control frames for turn-taking and lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlFrame {
    /// Run the language model on the current conversation context
    RunModel,
    /// Voice activity started
    UserStartedSpeaking,
    /// Voice activity stopped
    UserStoppedSpeaking,
    /// Model began streaming a reply
    ResponseStarted,
    /// Model finished its reply (assistant end-of-turn)
    ResponseComplete,
    /// User barged in over the assistant
    Interruption,
    /// Pipeline is being cancelled
    Cancel,
}

impl Frame {
    /// Final text fragment from the user
    pub fn user_text(text: impl Into<String>) -> Self {
        Frame::Text {
            text: text.into(),
            role: TurnRole::User,
            is_final: true,
        }
    }

    /// Text fragment produced by the model
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Frame::Text {
            text: text.into(),
            role: TurnRole::Assistant,
            is_final: true,
        }
    }

    /// Error frame for a failed stage
    pub fn error(stage: impl Into<String>, err: &Error) -> Self {
        Frame::Error {
            stage: stage.into(),
            message: err.to_string(),
            recoverable: err.is_recoverable(),
        }
    }

    /// Check if this is an end-of-stream frame
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Frame::EndOfStream)
    }

    /// Check if this is an error frame
    pub fn is_error(&self) -> bool {
        matches!(self, Frame::Error { .. })
    }

    /// Check if this is a control frame
    pub fn is_control(&self) -> bool {
        matches!(self, Frame::Control(_))
    }

    /// Check for a specific control frame
    pub fn is(&self, control: ControlFrame) -> bool {
        matches!(self, Frame::Control(c) if *c == control)
    }

    /// Get the stage name for this frame type
    pub fn stage_name(&self) -> &'static str {
        match self {
            Frame::AudioInput(_) => "audio_input",
            Frame::AudioOutput(_) => "audio_output",
            Frame::Text { .. } => "text",
            Frame::Control(_) => "control",
            Frame::Error { .. } => "error",
            Frame::EndOfStream => "end_of_stream",
        }
    }
}

/// Context passed to frame processors
///
/// Each stage owns its own context. When the stage runs inside a pipeline the
/// context carries a sender to the next stage, so [`push`](Self::push) can
/// emit frames before `process` returns. Without a sender pushed frames are
/// held until [`take_pending`](Self::take_pending).
#[derive(Debug, Clone, Default)]
pub struct ProcessorContext {
    /// Session ID
    pub session_id: String,
    /// Current conversation turn number
    pub turn_number: usize,
    /// Custom metadata
    pub metadata: HashMap<String, serde_json::Value>,
    /// Processor-specific state
    state: HashMap<String, serde_json::Value>,
    downstream: Option<mpsc::Sender<Frame>>,
    pending: Vec<Frame>,
    cancel: CancellationToken,
}

impl ProcessorContext {
    /// Create a new context for a session
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Attach the sender for the next stage
    pub fn with_downstream(mut self, tx: mpsc::Sender<Frame>) -> Self {
        self.downstream = Some(tx);
        self
    }

    /// Attach the cancellation token for the owning task
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Sender to the next stage, if running inside a pipeline
    pub fn downstream(&self) -> Option<mpsc::Sender<Frame>> {
        self.downstream.clone()
    }

    /// Cancellation token of the owning task
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit a frame ahead of the frames `process` will return
    pub async fn push(&mut self, frame: Frame) -> Result<()> {
        match &self.downstream {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| Error::Pipeline(PipelineError::ChannelClosed)),
            None => {
                self.pending.push(frame);
                Ok(())
            }
        }
    }

    /// Drain frames pushed while no downstream sender was attached
    pub fn take_pending(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.pending)
    }

    /// Increment turn number
    pub fn next_turn(&mut self) {
        self.turn_number += 1;
    }

    /// Get state value
    pub fn get_state<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.state.get(key).and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Set state value
    pub fn set_state<T: Serialize>(&mut self, key: impl Into<String>, value: T) {
        if let Ok(v) = serde_json::to_value(value) {
            self.state.insert(key.into(), v);
        }
    }

    /// Add metadata
    pub fn add_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.into(), value.into());
    }
}

/// Frame processor for pipeline stages
///
/// Each processor receives frames, processes them, and emits output frames.
/// Processors run in separate tokio tasks, connected by channels. Frames a
/// processor does not care about should be returned unchanged.
#[async_trait]
pub trait FrameProcessor: Send + Sync + 'static {
    /// Process a frame and emit zero or more output frames
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>>;

    /// Get processor name for tracing
    fn name(&self) -> &'static str;

    /// Called when pipeline starts
    async fn on_start(&self, _context: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Called when pipeline stops
    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Check if this processor can handle a frame type
    fn can_handle(&self, frame: &Frame) -> bool {
        let _ = frame;
        true
    }

    /// How often the stage wants [`on_idle`](Self::on_idle) while no frames arrive
    fn idle_interval(&self) -> Option<Duration> {
        None
    }

    /// Periodic hook for time-based decisions
    async fn on_idle(&self, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        Ok(Vec::new())
    }
}
