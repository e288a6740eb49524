//! Voicebot Server
//!
//! Provides the signaling endpoint, the per-session lifecycle controller and
//! the HTTP surface of the voice agent.

pub mod controller;
pub mod http;
pub mod metrics;
pub mod services;
pub mod session;
pub mod signaling;
pub mod state;

pub use controller::SessionController;
pub use http::create_router;
pub use metrics::init_metrics;
pub use services::{HttpServiceFactory, ServiceFactory};
pub use session::{Session, SessionManager, SessionState};
pub use signaling::{OfferAnswer, SignalingEndpoint};
pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use voicebot_transport::TransportError;

/// Server errors
#[derive(Error, Debug, Clone)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    /// The session existed but has been closed
    #[error("Session closed: {0}")]
    Stale(String),

    #[error("Max sessions reached ({0})")]
    Capacity(usize),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ServerError> for StatusCode {
    fn from(err: ServerError) -> Self {
        StatusCode::from(&err)
    }
}

impl From<&ServerError> for StatusCode {
    fn from(err: &ServerError) -> Self {
        match err {
            ServerError::InvalidRequest(_) | ServerError::InvalidOffer(_) => StatusCode::BAD_REQUEST,
            ServerError::NotFound(_) => StatusCode::NOT_FOUND,
            ServerError::Stale(_) => StatusCode::GONE,
            ServerError::Capacity(_) => StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Service(_) => StatusCode::BAD_GATEWAY,
            ServerError::Transport(_) | ServerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = StatusCode::from(&self);
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<TransportError> for ServerError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::InvalidOffer(msg) => ServerError::InvalidOffer(msg),
            TransportError::InvalidCandidate(msg) => ServerError::InvalidRequest(msg),
            TransportError::Closed => ServerError::Stale("connection closed".to_string()),
            other => ServerError::Transport(other.to_string()),
        }
    }
}

impl From<voicebot_core::Error> for ServerError {
    fn from(err: voicebot_core::Error) -> Self {
        match err {
            voicebot_core::Error::Config(msg) => ServerError::Internal(msg),
            other => ServerError::Service(other.to_string()),
        }
    }
}

impl From<voicebot_pipeline::PipelineError> for ServerError {
    fn from(err: voicebot_pipeline::PipelineError) -> Self {
        ServerError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(StatusCode::from(ServerError::NotFound("x".into())), StatusCode::NOT_FOUND);
        assert_eq!(StatusCode::from(ServerError::Stale("x".into())), StatusCode::GONE);
        assert_eq!(StatusCode::from(ServerError::Capacity(1)), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(StatusCode::from(ServerError::InvalidOffer("x".into())), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_transport_error_mapping() {
        assert!(matches!(ServerError::from(TransportError::Closed), ServerError::Stale(_)));
        assert!(matches!(
            ServerError::from(TransportError::InvalidOffer("empty".into())),
            ServerError::InvalidOffer(_)
        ));
        assert!(matches!(
            ServerError::from(TransportError::ConnectionFailed("ice".into())),
            ServerError::Transport(_)
        ));
    }
}
