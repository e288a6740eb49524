//! Application State
//!
//! Shared state across all handlers.

use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use voicebot_config::Settings;
use voicebot_transport::Negotiator;

use crate::services::ServiceFactory;
use crate::session::SessionManager;
use crate::signaling::SignalingEndpoint;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub sessions: Arc<SessionManager>,
    pub signaling: Arc<SignalingEndpoint>,
    /// `None` when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(config: Settings, negotiator: Arc<dyn Negotiator>, services: Arc<dyn ServiceFactory>) -> Self {
        let config = Arc::new(config);
        let sessions = Arc::new(SessionManager::new(config.server.max_sessions));
        let signaling = Arc::new(SignalingEndpoint::new(
            negotiator,
            sessions.clone(),
            services,
            config.clone(),
        ));

        Self {
            config,
            sessions,
            signaling,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    pub fn get_config(&self) -> &Settings {
        &self.config
    }
}
