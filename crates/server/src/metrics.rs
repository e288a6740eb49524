//! Prometheus metrics

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::state::AppState;

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder
///
/// Safe to call more than once; later calls return the installed handle.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = HANDLE.get() {
        return Some(handle.clone());
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            let handle = HANDLE.get_or_init(|| handle).clone();
            describe_metrics();
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            HANDLE.get().cloned()
        }
    }
}

fn describe_metrics() {
    metrics::describe_gauge!("voicebot_sessions_active", "Sessions currently registered");
    metrics::describe_counter!("voicebot_sessions_total", "Sessions accepted");
    metrics::describe_counter!("voicebot_sessions_failed_total", "Sessions ended by a failure");
    metrics::describe_histogram!("voicebot_session_duration_seconds", "Session lifetime");
    metrics::describe_counter!("voicebot_tasks_total", "Pipeline task transitions by outcome");
    metrics::describe_counter!("voicebot_turns_total", "Conversation turns appended by role");
    metrics::describe_counter!("voicebot_stage_errors_total", "Errors raised by pipeline stages");
    metrics::describe_counter!("voicebot_interruptions_total", "Assistant replies cut short by the user");
    metrics::describe_histogram!("voicebot_stt_latency_seconds", "Speech-to-text request latency");
    metrics::describe_histogram!("voicebot_llm_first_token_seconds", "Time to first model token");
    metrics::describe_histogram!("voicebot_llm_generation_seconds", "Full reply generation time");
    metrics::describe_histogram!("voicebot_tts_latency_seconds", "Speech synthesis request latency");
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}
