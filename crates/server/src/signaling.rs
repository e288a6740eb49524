//! Signaling endpoint
//!
//! Accepts the offer/answer handshake and trickle-ICE updates. Every accepted
//! offer becomes a [`Session`] whose connect path runs asynchronously through
//! the `on_connection` callback; the answer never waits for the pipeline.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use voicebot_config::Settings;
use voicebot_core::ConversationContext;
use voicebot_transport::{IceCandidate, Negotiator, SessionDescription, TransportEvent};

use crate::controller::SessionController;
use crate::services::ServiceFactory;
use crate::session::{Session, SessionManager};
use crate::ServerError;

/// Answer returned for an accepted offer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferAnswer {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: String,
    /// Connection id for subsequent PATCH requests
    pub pc_id: String,
}

/// Handshake and session registry front door
pub struct SignalingEndpoint {
    negotiator: Arc<dyn Negotiator>,
    sessions: Arc<SessionManager>,
    services: Arc<dyn ServiceFactory>,
    settings: Arc<Settings>,
}

impl SignalingEndpoint {
    pub fn new(
        negotiator: Arc<dyn Negotiator>,
        sessions: Arc<SessionManager>,
        services: Arc<dyn ServiceFactory>,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            negotiator,
            sessions,
            services,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Accept an offer and hand the new session to a lifecycle controller
    pub async fn accept_offer(&self, offer: SessionDescription) -> Result<OfferAnswer, ServerError> {
        let sessions = self.sessions.clone();
        let services = self.services.clone();
        let settings = self.settings.clone();

        self.create_session(offer, move |session, events| {
            SessionController::new(session, sessions, services, settings).spawn(events);
        })
        .await
    }

    /// Accept an offer
    ///
    /// Allocates the transport, registers the session with the persona turn
    /// already in its context and invokes `on_connection` with the session
    /// and its transport events.
    pub async fn create_session<F>(&self, offer: SessionDescription, on_connection: F) -> Result<OfferAnswer, ServerError>
    where
        F: FnOnce(Arc<Session>, mpsc::Receiver<TransportEvent>) + Send,
    {
        self.sessions.check_capacity()?;

        let negotiated = self.negotiator.accept(offer).await?;
        let context = ConversationContext::with_system_prompt(self.settings.agent.system_prompt.clone());
        let session = Arc::new(Session::new(negotiated.transport, context));

        if let Err(e) = self.sessions.insert(session.clone()) {
            session.close("rejected").await;
            return Err(e);
        }

        let answer = OfferAnswer {
            sdp: negotiated.answer.sdp,
            kind: "answer".to_string(),
            pc_id: session.id().to_string(),
        };

        tracing::info!(session_id = %session.id(), "Offer accepted");
        on_connection(session, negotiated.events);

        Ok(answer)
    }

    /// Apply trickle-ICE candidates to an open session
    pub async fn update_session(&self, connection_id: &str, candidates: &[IceCandidate]) -> Result<(), ServerError> {
        let session = self.sessions.get(connection_id)?;

        for candidate in candidates {
            session.transport().add_ice_candidate(candidate).await?;
        }

        tracing::debug!(session_id = %connection_id, count = candidates.len(), "Applied ICE candidates");
        Ok(())
    }

    /// Tear down every session
    pub async fn close_all(&self) {
        self.sessions.close_all().await;
    }
}
