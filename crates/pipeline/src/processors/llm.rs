//! Language model stage
//!
//! On `RunModel` the stage snapshots the conversation context and streams a
//! reply as `ResponseStarted`, sentence-sized assistant text frames and
//! `ResponseComplete`. Inside a running pipeline the generation is detached
//! from the frame loop so audio keeps flowing and the user can barge in.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voicebot_core::{
    ControlFrame, ConversationContext, Frame, FrameProcessor, LanguageModel, ProcessorContext, Result, Turn,
};

use super::SentenceSplitter;

struct ActiveGeneration {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs the language model over the conversation context
pub struct LlmProcessor {
    llm: Arc<dyn LanguageModel>,
    context: ConversationContext,
    allow_interruptions: bool,
    active: Arc<Mutex<Option<ActiveGeneration>>>,
    next_id: AtomicU64,
}

impl LlmProcessor {
    pub fn new(llm: Arc<dyn LanguageModel>, context: ConversationContext) -> Self {
        Self {
            llm,
            context,
            allow_interruptions: true,
            active: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn with_interruptions(mut self, allow: bool) -> Self {
        self.allow_interruptions = allow;
        self
    }

    /// Whether a detached generation is in flight
    pub fn is_generating(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Stop the in-flight generation and wait for it; true if there was one
    async fn abort_active(&self) -> bool {
        let active = self.active.lock().take();
        match active {
            Some(generation) => {
                generation.cancel.cancel();
                let _ = generation.handle.await;
                true
            }
            None => false,
        }
    }

    async fn run_model(&self, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        if self.abort_active().await {
            tracing::debug!(session_id = %context.session_id, "New turn supersedes in-flight reply");
            context.push(Frame::Control(ControlFrame::Interruption)).await?;
        }

        if self.context.is_sealed() {
            return Ok(vec![]);
        }
        let turns = self.context.snapshot();
        context.next_turn();

        tracing::debug!(
            session_id = %context.session_id,
            model = self.llm.model_name(),
            turns = turns.len(),
            "Running model"
        );

        let Some(tx) = context.downstream() else {
            let mut sink = FrameSink::Buffer(Vec::new());
            run_generation(&self.llm, &turns, &mut sink, context.cancellation()).await?;
            return Ok(sink.into_frames());
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = context.cancellation().child_token();
        let llm = Arc::clone(&self.llm);
        let active = Arc::clone(&self.active);
        let session_id = context.session_id.clone();

        let mut slot = self.active.lock();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut sink = FrameSink::Downstream { tx, cancel: task_cancel.clone() };
            if let Err(e) = run_generation(&llm, &turns, &mut sink, &task_cancel).await {
                tracing::error!(session_id = %session_id, error = %e, "Generation failed");
                metrics::counter!("voicebot_stage_errors_total", "stage" => "llm").increment(1);
                sink.send(Frame::error("llm", &e)).await;
            }

            let mut active = active.lock();
            if active.as_ref().map(|g| g.id) == Some(id) {
                *active = None;
            }
        });
        *slot = Some(ActiveGeneration { id, cancel, handle });

        Ok(vec![])
    }
}

#[async_trait]
impl FrameProcessor for LlmProcessor {
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match frame {
            Frame::Control(ControlFrame::RunModel) => self.run_model(context).await,
            Frame::Control(ControlFrame::UserStartedSpeaking) if self.allow_interruptions => {
                if self.abort_active().await {
                    tracing::info!(session_id = %context.session_id, "User interrupted the assistant");
                    metrics::counter!("voicebot_interruptions_total").increment(1);
                    Ok(vec![frame, Frame::Control(ControlFrame::Interruption)])
                } else {
                    Ok(vec![frame])
                }
            }
            Frame::Control(ControlFrame::Cancel) => {
                self.abort_active().await;
                Ok(vec![frame])
            }
            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "llm"
    }

    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        self.abort_active().await;
        Ok(())
    }
}

/// Where generated frames go
enum FrameSink {
    Downstream {
        tx: mpsc::Sender<Frame>,
        cancel: CancellationToken,
    },
    Buffer(Vec<Frame>),
}

impl FrameSink {
    /// False once nothing more should be sent
    async fn send(&mut self, frame: Frame) -> bool {
        match self {
            FrameSink::Downstream { tx, cancel } => tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                sent = tx.send(frame) => sent.is_ok(),
            },
            FrameSink::Buffer(frames) => {
                frames.push(frame);
                true
            }
        }
    }

    fn into_frames(self) -> Vec<Frame> {
        match self {
            FrameSink::Buffer(frames) => frames,
            FrameSink::Downstream { .. } => Vec::new(),
        }
    }
}

/// Stream one reply into `sink`; returns early without error when cancelled
async fn run_generation(
    llm: &Arc<dyn LanguageModel>,
    turns: &[Turn],
    sink: &mut FrameSink,
    cancel: &CancellationToken,
) -> Result<()> {
    if !sink.send(Frame::Control(ControlFrame::ResponseStarted)).await {
        return Ok(());
    }

    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel::<String>(64);
    let generation = llm.generate_stream(turns, tx);
    tokio::pin!(generation);

    let mut splitter = SentenceSplitter::default();
    let mut result = None;
    let mut first_token = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            token = rx.recv() => match token {
                Some(token) => {
                    if first_token {
                        first_token = false;
                        metrics::histogram!("voicebot_llm_first_token_seconds").record(started.elapsed().as_secs_f64());
                    }
                    for sentence in splitter.push(&token) {
                        if !sink.send(Frame::assistant_text(sentence)).await {
                            return Ok(());
                        }
                    }
                }
                None => break,
            },
            done = &mut generation, if result.is_none() => result = Some(done),
        }
    }

    let result = match result {
        Some(result) => result,
        None => tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            done = &mut generation => done,
        },
    };
    let generation = result?;

    if let Some(rest) = splitter.flush() {
        if !sink.send(Frame::assistant_text(rest)).await {
            return Ok(());
        }
    }
    if cancel.is_cancelled() {
        return Ok(());
    }
    sink.send(Frame::Control(ControlFrame::ResponseComplete)).await;

    metrics::histogram!("voicebot_llm_generation_seconds").record(started.elapsed().as_secs_f64());
    tracing::debug!(
        model = llm.model_name(),
        tokens = generation.tokens,
        finish_reason = ?generation.finish_reason,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Generation complete"
    );

    Ok(())
}
