//! Session lifecycle controller
//!
//! Consumes the transport's events for one session:
//!
//! - `Connected`: build the pipeline around the session's context, start the
//!   task, feed it the peer's audio and let the assistant speak first
//! - `Disconnected`, a closed event channel, a failed task or a shutdown
//!   request: tear the session down
//!
//! Failures here end the session, never the process.

use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use voicebot_config::Settings;
use voicebot_core::{ControlFrame, Frame, TurnRole};
use voicebot_pipeline::{build_voice_pipeline, spawn_audio_feed, PipelineTask, PipelineTaskConfig, TaskOutcome};
use voicebot_transport::TransportEvent;

use crate::services::ServiceFactory;
use crate::session::{Session, SessionManager};
use crate::ServerError;

/// Drives one session from connect to close
pub struct SessionController {
    session: Arc<Session>,
    sessions: Arc<SessionManager>,
    services: Arc<dyn ServiceFactory>,
    settings: Arc<Settings>,
}

impl SessionController {
    pub fn new(
        session: Arc<Session>,
        sessions: Arc<SessionManager>,
        services: Arc<dyn ServiceFactory>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            session,
            sessions,
            services,
            settings,
        }
    }

    pub fn spawn(self, events: mpsc::Receiver<TransportEvent>) -> JoinHandle<()> {
        tokio::spawn(self.run(events))
    }

    /// Handle transport events until the session ends, then close it
    pub async fn run(self, mut events: mpsc::Receiver<TransportEvent>) {
        let session_id = self.session.id().to_string();
        let shutdown = self.session.shutdown_token();
        let started = Instant::now();
        let mut task: Option<Arc<PipelineTask>> = None;

        metrics::counter!("voicebot_sessions_total").increment(1);

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break "shutdown".to_string(),
                outcome = wait_for_task(task.as_deref()) => match outcome {
                    TaskOutcome::Failed(reason) => {
                        metrics::counter!("voicebot_sessions_failed_total", "cause" => "pipeline").increment(1);
                        break format!("pipeline failed: {reason}");
                    }
                    TaskOutcome::Finished => break "pipeline finished".to_string(),
                    TaskOutcome::Cancelled => break "pipeline cancelled".to_string(),
                },
                event = events.recv() => match event {
                    Some(TransportEvent::Connected) => {
                        if task.is_some() {
                            tracing::debug!(session_id = %session_id, "Ignoring repeated connect");
                            continue;
                        }
                        match self.on_connected().await {
                            Ok(running) => task = Some(running),
                            Err(e) => {
                                tracing::error!(session_id = %session_id, error = %e, "Failed to start session pipeline");
                                metrics::counter!("voicebot_sessions_failed_total", "cause" => "setup").increment(1);
                                break format!("setup failed: {e}");
                            }
                        }
                    }
                    Some(TransportEvent::Disconnected { reason }) => break reason,
                    None => break "event channel closed".to_string(),
                },
            }
        };

        self.session.close(&reason).await;
        self.sessions.remove(&session_id);

        metrics::histogram!("voicebot_session_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(session_id = %session_id, reason = %reason, "Session ended");
    }

    async fn on_connected(&self) -> Result<Arc<PipelineTask>, ServerError> {
        let session = &self.session;
        tracing::info!(session_id = %session.id(), "Peer connected");

        let services = self.services.create(&self.settings).await?;
        let transport = session.transport();
        let context = session.context().clone();
        let pipeline_config = &self.settings.pipeline;

        let pipeline = build_voice_pipeline(services, transport.audio_sink(), context.clone(), pipeline_config);
        let task = Arc::new(PipelineTask::new(
            session.id(),
            pipeline,
            context.clone(),
            PipelineTaskConfig::from(pipeline_config),
        ));

        if !session.attach_task(task.clone()) {
            return Err(ServerError::Stale(session.id().to_string()));
        }
        task.start().await?;
        spawn_audio_feed(&task, transport.audio_source());
        session.mark_active();

        let greeting = self.settings.agent.greeting_prompt.trim();
        if !greeting.is_empty() {
            context.append(TurnRole::System, greeting);
            task.queue_frame(Frame::Control(ControlFrame::RunModel)).await?;
        }

        tracing::info!(session_id = %session.id(), turns = context.len(), "Session pipeline running");
        Ok(task)
    }
}

/// Terminal outcome of the task; never resolves before one exists
async fn wait_for_task(task: Option<&PipelineTask>) -> TaskOutcome {
    match task {
        Some(task) => task.wait().await,
        None => std::future::pending().await,
    }
}
