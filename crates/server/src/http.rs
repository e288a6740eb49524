//! HTTP Endpoints
//!
//! Signaling (`/api/offer`, alias `/offer`), the client page, health and
//! metrics.

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::{HeaderValue, Method, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use voicebot_transport::{IceCandidate, SdpType, SessionDescription};

use crate::metrics::metrics_handler;
use crate::signaling::OfferAnswer;
use crate::state::AppState;
use crate::ServerError;

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let server = &state.config.server;
    let cors_layer = build_cors_layer(&server.cors_origins, server.cors_enabled);

    Router::new()
        .route("/", get(index))
        .route("/api/offer", post(handle_offer).patch(handle_patch))
        .route("/offer", post(handle_offer).patch(handle_patch))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .with_state(state)
}

/// Build CORS layer from configuration
///
/// No configured origins allows any origin. Disabled CORS adds no
/// cross-origin permissions at all.
fn build_cors_layer(origins: &[String], enabled: bool) -> CorsLayer {
    if !enabled {
        tracing::info!("CORS disabled, cross-origin requests are not allowed");
        return CorsLayer::new();
    }

    let methods = [Method::GET, Method::POST, Method::PATCH, Method::OPTIONS];

    if origins.is_empty() {
        return CorsLayer::new().allow_origin(Any).allow_methods(methods).allow_headers(Any);
    }

    let parsed_origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("Invalid CORS origin: {}", origin);
                None
            })
        })
        .collect();

    if parsed_origins.is_empty() {
        tracing::error!("All configured CORS origins are invalid, cross-origin requests are not allowed");
        return CorsLayer::new();
    }

    tracing::info!("CORS configured with {} origins", parsed_origins.len());
    CorsLayer::new()
        .allow_origin(parsed_origins)
        .allow_methods(methods)
        .allow_headers(Any)
}

/// `POST /api/offer` body
#[derive(Debug, Deserialize)]
pub struct OfferRequest {
    pub sdp: String,
    #[serde(rename = "type")]
    pub kind: SdpType,
    /// Set by clients that renegotiate an existing connection
    #[serde(default)]
    pub pc_id: Option<String>,
}

/// `PATCH /api/offer` body
#[derive(Debug, Deserialize)]
pub struct PatchRequest {
    #[serde(alias = "connectionId")]
    pub pc_id: String,
    #[serde(default)]
    pub candidate: Option<IceCandidate>,
    #[serde(default)]
    pub candidates: Vec<IceCandidate>,
}

impl PatchRequest {
    fn into_candidates(self) -> Vec<IceCandidate> {
        let mut candidates = self.candidates;
        candidates.extend(self.candidate);
        candidates
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

fn parse_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ServerError> {
    body.map(|Json(body)| body)
        .map_err(|rejection| ServerError::InvalidRequest(rejection.body_text()))
}

async fn handle_offer(
    State(state): State<AppState>,
    body: Result<Json<OfferRequest>, JsonRejection>,
) -> Result<Json<OfferAnswer>, ServerError> {
    let request = parse_body(body)?;

    if let Some(pc_id) = request.pc_id.as_deref() {
        if state.sessions.get(pc_id).is_ok() {
            return Err(ServerError::InvalidRequest(format!(
                "renegotiation of {pc_id} is not supported"
            )));
        }
    }

    let offer = SessionDescription {
        sdp: request.sdp,
        kind: request.kind,
    };
    let answer = state.signaling.accept_offer(offer).await?;
    Ok(Json(answer))
}

async fn handle_patch(
    State(state): State<AppState>,
    body: Result<Json<PatchRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ServerError> {
    let request = parse_body(body)?;
    let pc_id = request.pc_id.clone();

    state
        .signaling
        .update_session(&pc_id, &request.into_candidates())
        .await?;

    Ok(Json(StatusResponse { status: "success" }))
}

/// `GET /` serves the client page verbatim
async fn index(State(state): State<AppState>) -> Response {
    let path = &state.config.server.index_path;
    match tokio::fs::read_to_string(path).await {
        Ok(page) => Html(page).into_response(),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Client page not available");
            (StatusCode::NOT_FOUND, "index page not found").into_response()
        }
    }
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.sessions.count(),
        "max_sessions": state.sessions.max_sessions(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_request_accepts_both_id_spellings() {
        let snake: PatchRequest =
            serde_json::from_str(r#"{"pc_id": "a", "candidates": [{"candidate": "c1"}]}"#).unwrap();
        assert_eq!(snake.pc_id, "a");

        let camel: PatchRequest = serde_json::from_str(
            r#"{"connectionId": "b", "candidate": {"candidate": "c2", "sdpMid": "0", "sdpMLineIndex": 0}}"#,
        )
        .unwrap();
        assert_eq!(camel.pc_id, "b");
        let candidates = camel.into_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].sdp_mid.as_deref(), Some("0"));
    }

    #[test]
    fn test_patch_merges_single_and_batch() {
        let request: PatchRequest = serde_json::from_str(
            r#"{"pc_id": "a", "candidate": {"candidate": "last"}, "candidates": [{"candidate": "first"}]}"#,
        )
        .unwrap();
        let candidates = request.into_candidates();
        assert_eq!(candidates[0].candidate, "first");
        assert_eq!(candidates[1].candidate, "last");
    }

    #[test]
    fn test_offer_request_type() {
        let request: OfferRequest = serde_json::from_str(r#"{"sdp": "v=0", "type": "offer"}"#).unwrap();
        assert_eq!(request.kind, SdpType::Offer);
        assert!(request.pc_id.is_none());
        assert!(serde_json::from_str::<OfferRequest>(r#"{"sdp": "v=0", "type": "pranswer"}"#).is_err());
    }

    #[test]
    fn test_cors_layer_builds() {
        let _ = build_cors_layer(&[], true);
        let _ = build_cors_layer(&["http://localhost:7860".to_string()], true);
        let _ = build_cors_layer(&["bad\norigin".to_string()], true);
        let _ = build_cors_layer(&[], false);
    }
}
