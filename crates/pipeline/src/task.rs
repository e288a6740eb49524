//! Pipeline task: owns one run of a pipeline
//!
//! State machine:
//!
//! ```text
//! Created ──start──▶ Running ──cancel──▶ Cancelling ──▶ Cancelled
//!    │                  ├──fatal error frame──▶ Failed
//!    │                  └──end of stream──▶ Finished
//!    └──cancel──▶ Cancelled
//! ```
//!
//! No transition leaves a terminal state.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use voicebot_config::PipelineConfig;
use voicebot_core::{ConversationContext, Frame, ProcessorContext};
use voicebot_transport::AudioSource;

use crate::{Pipeline, PipelineError};

/// Lifecycle state of a pipeline task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Cancelling,
    Cancelled,
    Failed(String),
    Finished,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Cancelled | TaskState::Failed(_) | TaskState::Finished)
    }

    /// Outcome for terminal states
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self {
            TaskState::Cancelled => Some(TaskOutcome::Cancelled),
            TaskState::Failed(reason) => Some(TaskOutcome::Failed(reason.clone())),
            TaskState::Finished => Some(TaskOutcome::Finished),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Cancelling => "cancelling",
            TaskState::Cancelled => "cancelled",
            TaskState::Failed(_) => "failed",
            TaskState::Finished => "finished",
        }
    }
}

/// How a task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Cancelled by the owner
    Cancelled,
    /// A stage failed with a non-recoverable error
    Failed(String),
    /// End of stream reached the tail
    Finished,
}

/// Task tuning
#[derive(Debug, Clone)]
pub struct PipelineTaskConfig {
    /// How long `cancel()` waits for stages before aborting them
    pub cancel_grace: Duration,
    /// Capacity of the tail broadcast
    pub tail_capacity: usize,
}

impl Default for PipelineTaskConfig {
    fn default() -> Self {
        Self {
            cancel_grace: Duration::from_secs(2),
            tail_capacity: 256,
        }
    }
}

impl From<&PipelineConfig> for PipelineTaskConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            cancel_grace: config.cancel_grace(),
            tail_capacity: config.channel_capacity,
        }
    }
}

/// State shared with the tail supervisor
struct Shared {
    id: String,
    state: watch::Sender<TaskState>,
    cancel: CancellationToken,
    context: ConversationContext,
}

impl Shared {
    /// Move to `to` when the current state satisfies `from`
    fn transition(&self, from: impl FnOnce(&TaskState) -> bool, to: TaskState) -> bool {
        self.state.send_if_modified(|state| {
            if from(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    fn fail(&self, reason: String) {
        self.context.seal();
        if self.transition(|s| *s == TaskState::Running, TaskState::Failed(reason.clone())) {
            tracing::error!(task_id = %self.id, reason = %reason, "Pipeline task failed");
            metrics::counter!("voicebot_tasks_total", "outcome" => "failed").increment(1);
        }
        self.cancel.cancel();
    }

    fn finish(&self) {
        self.context.seal();
        if self.transition(|s| *s == TaskState::Running, TaskState::Finished) {
            tracing::info!(task_id = %self.id, "Pipeline task finished");
            metrics::counter!("voicebot_tasks_total", "outcome" => "finished").increment(1);
        }
        self.cancel.cancel();
    }
}

/// Owns the execution of one pipeline
pub struct PipelineTask {
    shared: Arc<Shared>,
    pipeline: parking_lot::Mutex<Option<Pipeline>>,
    processor_context: ProcessorContext,
    config: PipelineTaskConfig,
    /// Head sender; the lock keeps batches from interleaving
    input: tokio::sync::Mutex<Option<mpsc::Sender<Frame>>>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    tail: broadcast::Sender<Frame>,
}

impl PipelineTask {
    pub fn new(
        id: impl Into<String>,
        pipeline: Pipeline,
        context: ConversationContext,
        config: PipelineTaskConfig,
    ) -> Self {
        let id = id.into();
        let (state, _) = watch::channel(TaskState::Created);
        let (tail, _) = broadcast::channel(config.tail_capacity.max(1));

        Self {
            processor_context: ProcessorContext::new(id.clone()),
            shared: Arc::new(Shared {
                id,
                state,
                cancel: CancellationToken::new(),
                context,
            }),
            pipeline: parking_lot::Mutex::new(Some(pipeline)),
            config,
            input: tokio::sync::Mutex::new(None),
            handles: parking_lot::Mutex::new(Vec::new()),
            tail,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> TaskState {
        self.shared.state.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        *self.shared.state.borrow() == TaskState::Running
    }

    /// Conversation context this task appends to
    pub fn context(&self) -> &ConversationContext {
        &self.shared.context
    }

    /// Token fired when the task stops for any reason
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Spawn the stage tasks and the tail supervisor
    ///
    /// Returns as soon as everything is spawned.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let pipeline = self.pipeline.lock().take().ok_or(PipelineError::AlreadyStarted)?;

        if !self.shared.transition(|s| *s == TaskState::Created, TaskState::Running) {
            return Err(PipelineError::Cancelled);
        }

        let running = pipeline.run(self.processor_context.clone(), self.shared.cancel.clone());
        *self.input.lock().await = Some(running.input);

        let supervisor = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            running.output,
            self.tail.clone(),
        ));

        {
            let mut handles = self.handles.lock();
            handles.extend(running.handles);
            handles.push(supervisor);
        }

        tracing::info!(
            task_id = %self.shared.id,
            pipeline = pipeline.name(),
            stages = pipeline.len(),
            "Pipeline task started"
        );
        metrics::counter!("voicebot_tasks_total", "outcome" => "started").increment(1);

        Ok(())
    }

    /// Inject frames at the head of the pipeline, in order
    ///
    /// The whole batch is delivered before any other batch.
    pub async fn queue_frames(&self, frames: impl IntoIterator<Item = Frame>) -> Result<(), PipelineError> {
        let input = self.input.lock().await;
        let cancel = &self.shared.cancel;
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let tx = input.as_ref().ok_or(PipelineError::NotRunning)?;

        for frame in frames {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                sent = tx.send(frame) => sent.map_err(|_| PipelineError::ChannelClosed)?,
            }
        }
        Ok(())
    }

    pub async fn queue_frame(&self, frame: Frame) -> Result<(), PipelineError> {
        self.queue_frames([frame]).await
    }

    /// Observe frames leaving the tail
    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.tail.subscribe()
    }

    /// Tie a helper task to this task's lifetime
    pub fn attach(&self, handle: JoinHandle<()>) {
        if self.shared.cancel.is_cancelled() {
            handle.abort();
            return;
        }
        self.handles.lock().push(handle);
    }

    /// Stop the task
    ///
    /// Seals the conversation context, fires the cancellation token and waits
    /// up to the grace period for the stages, aborting any that remain. Safe
    /// to call repeatedly or concurrently: only the first call tears down,
    /// the others wait for the terminal state.
    pub async fn cancel(&self) {
        let mut previous = None;
        self.shared.state.send_if_modified(|state| match state {
            TaskState::Created => {
                previous = Some(TaskState::Created);
                *state = TaskState::Cancelled;
                true
            }
            TaskState::Running => {
                previous = Some(TaskState::Running);
                *state = TaskState::Cancelling;
                true
            }
            _ => false,
        });

        match previous {
            Some(TaskState::Created) => {
                self.shared.context.seal();
                self.shared.cancel.cancel();
                tracing::info!(task_id = %self.shared.id, "Pipeline task cancelled before start");
            }
            Some(_) => self.teardown().await,
            None => {
                self.wait().await;
            }
        }
    }

    async fn teardown(&self) {
        let task_id = self.shared.id.as_str();
        tracing::info!(task_id, "Cancelling pipeline task");

        self.shared.context.seal();
        self.shared.cancel.cancel();

        let handles = std::mem::take(&mut *self.handles.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let grace = self.config.cancel_grace;

        if tokio::time::timeout(grace, futures::future::join_all(handles)).await.is_err() {
            tracing::warn!(task_id, grace_ms = grace.as_millis() as u64, "Stages still running after grace period, aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        self.shared.transition(|s| *s == TaskState::Cancelling, TaskState::Cancelled);
        metrics::counter!("voicebot_tasks_total", "outcome" => "cancelled").increment(1);
        tracing::info!(task_id, "Pipeline task cancelled");
    }

    /// Resolve once the task reaches a terminal state
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.shared.state.subscribe();
        let outcome = match rx.wait_for(TaskState::is_terminal).await {
            Ok(state) => state.outcome().unwrap_or(TaskOutcome::Cancelled),
            Err(_) => TaskOutcome::Cancelled,
        };
        outcome
    }
}

impl Drop for PipelineTask {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

/// Drain the tail, publish frames and watch for fatal errors
async fn supervise(shared: Arc<Shared>, mut output: mpsc::Receiver<Frame>, tail: broadcast::Sender<Frame>) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return,
            frame = output.recv() => frame,
        };

        // Stages only close their output after forwarding end of stream, so
        // a tail that closes first means a stage died (panic or abort)
        let Some(frame) = frame else {
            if !shared.cancel.is_cancelled() {
                shared.fail("pipeline stage exited unexpectedly".to_string());
            }
            return;
        };

        let fatal = match &frame {
            Frame::Error { stage, message, recoverable: false } => Some(format!("{stage}: {message}")),
            Frame::Error { stage, message, .. } => {
                tracing::warn!(task_id = %shared.id, stage = %stage, error = %message, "Recoverable pipeline error");
                None
            }
            _ => None,
        };
        let is_eos = frame.is_end_of_stream();

        // No subscribers is fine
        let _ = tail.send(frame);

        if let Some(reason) = fatal {
            shared.fail(reason);
            return;
        }
        if is_eos {
            shared.finish();
            return;
        }
    }
}

/// Pump audio from a transport source into the head of a task
///
/// The feed stops when the task stops or the source ends.
pub fn spawn_audio_feed(task: &Arc<PipelineTask>, source: Arc<dyn AudioSource>) {
    let feed_task = Arc::clone(task);
    let cancel = task.cancellation_token();

    let handle = tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = source.recv_audio() => next,
            };

            match next {
                Ok(Some(frame)) => {
                    if let Err(e) = feed_task.queue_frame(Frame::AudioInput(frame)).await {
                        tracing::debug!(task_id = %feed_task.id(), error = %e, "Audio feed stopped");
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!(task_id = %feed_task.id(), "Audio source ended");
                    break;
                }
                Err(e) => {
                    tracing::warn!(task_id = %feed_task.id(), error = %e, "Audio source failed");
                    break;
                }
            }
        }
    });

    task.attach(handle);
}
