//! Session management
//!
//! One [`Session`] per connected peer. The [`SessionManager`] enforces the
//! session limit and remembers recently closed ids so late signaling requests
//! can be told apart from unknown ones.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use voicebot_core::ConversationContext;
use voicebot_pipeline::PipelineTask;
use voicebot_transport::Transport;

use crate::ServerError;

/// Closed ids remembered for `Stale` answers
const MAX_TOMBSTONES: usize = 4096;

/// Session lifecycle
///
/// `Connecting → Active → Closing → Closed`; a session that never connected
/// goes straight from `Connecting` to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

/// One connected peer
pub struct Session {
    id: String,
    transport: Arc<dyn Transport>,
    context: ConversationContext,
    state: watch::Sender<SessionState>,
    task: Mutex<Option<Arc<PipelineTask>>>,
    shutdown: CancellationToken,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, context: ConversationContext) -> Self {
        let (state, _) = watch::channel(SessionState::Connecting);
        Self {
            id: transport.connection_id().to_string(),
            transport,
            context,
            state,
            task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// The pipeline task, once the peer connected
    pub fn task(&self) -> Option<Arc<PipelineTask>> {
        self.task.lock().clone()
    }

    /// Bind the pipeline task; false if one is already bound or the session is closing
    pub fn attach_task(&self, task: Arc<PipelineTask>) -> bool {
        let mut slot = self.task.lock();
        if slot.is_some() || self.state().is_closed() {
            return false;
        }
        *slot = Some(task);
        true
    }

    /// `Connecting → Active`
    pub fn mark_active(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Connecting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Ask the session's controller to tear it down
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    /// Tear the session down
    ///
    /// Cancels the pipeline task (sealing the context), closes the transport
    /// and marks the session closed. Only the first call does the work; the
    /// others wait until it is done.
    pub async fn close(&self, reason: &str) {
        let first = self.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = SessionState::Closing;
                true
            }
        });
        if !first {
            self.wait_closed().await;
            return;
        }

        tracing::info!(session_id = %self.id, reason, "Closing session");

        match self.task() {
            Some(task) => task.cancel().await,
            None => self.context.seal(),
        }

        if let Err(e) = self.transport.close().await {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to close transport");
        }

        self.state.send_replace(SessionState::Closed);
        tracing::info!(session_id = %self.id, turns = self.context.len(), "Session closed");
    }

    /// Resolve once the session reached `Closed`
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Closed).await;
    }
}

/// Bounded set of closed session ids
#[derive(Default)]
struct Tombstones {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl Tombstones {
    fn insert(&mut self, id: String) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }
}

/// Session manager
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    closed: Mutex<Tombstones>,
    max_sessions: usize,
}

impl SessionManager {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            closed: Mutex::new(Tombstones::default()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Fail fast before negotiating a transport
    pub fn check_capacity(&self) -> Result<(), ServerError> {
        if self.sessions.read().len() >= self.max_sessions {
            return Err(ServerError::Capacity(self.max_sessions));
        }
        Ok(())
    }

    /// Register a session
    pub fn insert(&self, session: Arc<Session>) -> Result<(), ServerError> {
        let mut sessions = self.sessions.write();
        if sessions.len() >= self.max_sessions {
            return Err(ServerError::Capacity(self.max_sessions));
        }
        sessions.insert(session.id().to_string(), session.clone());
        metrics::gauge!("voicebot_sessions_active").set(sessions.len() as f64);

        tracing::info!(session_id = %session.id(), active = sessions.len(), "Session registered");
        Ok(())
    }

    /// Look up an open session
    ///
    /// `Stale` for sessions that closed (or are closing), `NotFound` for ids
    /// never seen.
    pub fn get(&self, id: &str) -> Result<Arc<Session>, ServerError> {
        if let Some(session) = self.sessions.read().get(id) {
            if session.state().is_closed() {
                return Err(ServerError::Stale(id.to_string()));
            }
            return Ok(session.clone());
        }
        if self.closed.lock().contains(id) {
            return Err(ServerError::Stale(id.to_string()));
        }
        Err(ServerError::NotFound(id.to_string()))
    }

    /// Forget a session, remembering its id as closed
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        let removed = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(id);
            metrics::gauge!("voicebot_sessions_active").set(sessions.len() as f64);
            removed
        };
        self.closed.lock().insert(id.to_string());
        if removed.is_some() {
            tracing::debug!(session_id = %id, "Session removed");
        }
        removed
    }

    pub fn count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn list(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Ask controllers of sessions older than `max_age` to close them
    pub fn expire(&self, max_age: Duration) -> usize {
        let expired: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.age() > max_age)
            .cloned()
            .collect();

        for session in &expired {
            tracing::info!(session_id = %session.id(), age_secs = session.age().as_secs(), "Session expired");
            session.request_shutdown();
        }
        expired.len()
    }

    /// Close every session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.read().values().cloned().collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing all sessions");

        for session in &sessions {
            session.request_shutdown();
        }
        futures::future::join_all(sessions.iter().map(|s| s.close("shutdown"))).await;

        for session in &sessions {
            self.remove(session.id());
        }
    }
}

/// Periodically expire sessions older than `max_age`
pub fn spawn_reaper(
    sessions: Arc<SessionManager>,
    max_age: Duration,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = sessions.expire(max_age);
                    if expired > 0 {
                        tracing::info!(expired, "Expired sessions");
                    }
                }
            }
        }
    })
}
