//! HTTP surface of the signaling endpoint

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::*;
use std::sync::Arc;
use tower::ServiceExt;
use voicebot_config::Settings;
use voicebot_server::{create_router, init_metrics, AppState};
use voicebot_transport::LoopbackNegotiator;

fn app_with(settings: Settings) -> (Router, AppState) {
    let negotiator = Arc::new(LoopbackNegotiator::new());
    let state = AppState::new(settings, negotiator, MockFactory::new(ScriptedLlm::new([])));
    (create_router(state.clone()), state)
}

fn app() -> (Router, AppState) {
    app_with(test_settings())
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_offer_returns_answer_and_pc_id() {
    let (app, state) = app();

    for uri in ["/api/offer", "/offer"] {
        let response = app
            .clone()
            .oneshot(json_request("POST", uri, serde_json::json!({"sdp": "v=0\r\n", "type": "offer"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["type"], "answer");
        assert!(body["sdp"].as_str().unwrap().starts_with("v=0"));
        let pc_id = body["pc_id"].as_str().unwrap();
        assert!(state.sessions.get(pc_id).is_ok());
    }
    assert_eq!(state.sessions.count(), 2);
}

#[tokio::test]
async fn test_patch_applies_candidates() {
    let (app, _state) = app();

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/offer", serde_json::json!({"sdp": "v=0", "type": "offer"})))
        .await
        .unwrap();
    let pc_id = body_json(response).await["pc_id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "PATCH",
            "/api/offer",
            serde_json::json!({
                "pc_id": pc_id,
                "candidates": [{"candidate": "candidate:1 1 UDP 1 10.0.0.1 5000 typ host", "sdp_mid": "0", "sdp_mline_index": 0}]
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "success");

    let response = app
        .oneshot(json_request(
            "PATCH",
            "/offer",
            serde_json::json!({"connectionId": pc_id, "candidate": {"candidate": "", "sdpMid": "0"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_patch_unknown_session_is_404() {
    let (app, _state) = app();

    let response = app
        .oneshot(json_request(
            "PATCH",
            "/api/offer",
            serde_json::json!({"pc_id": "missing", "candidates": []}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].as_str().unwrap().contains("missing"));
}

#[tokio::test]
async fn test_patch_closed_session_is_410() {
    let (app, state) = app();

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/offer", serde_json::json!({"sdp": "v=0", "type": "offer"})))
        .await
        .unwrap();
    let pc_id = body_json(response).await["pc_id"].as_str().unwrap().to_string();

    state.sessions.get(&pc_id).unwrap().close("test").await;

    let response = app
        .oneshot(json_request("PATCH", "/api/offer", serde_json::json!({"pc_id": pc_id, "candidates": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn test_malformed_requests_are_400() {
    let (app, _state) = app();

    let response = app
        .clone()
        .oneshot(json_request("PATCH", "/api/offer", serde_json::json!({"candidates": []})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/offer", serde_json::json!({"sdp": "v=0", "type": "answer"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/offer")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_renegotiation_is_rejected() {
    let (app, _state) = app();

    let response = app
        .clone()
        .oneshot(json_request("POST", "/api/offer", serde_json::json!({"sdp": "v=0", "type": "offer"})))
        .await
        .unwrap();
    let pc_id = body_json(response).await["pc_id"].as_str().unwrap().to_string();

    let response = app
        .oneshot(json_request(
            "POST",
            "/api/offer",
            serde_json::json!({"sdp": "v=0", "type": "offer", "pc_id": pc_id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_capacity_is_503() {
    let mut settings = test_settings();
    settings.server.max_sessions = 1;
    let (app, _state) = app_with(settings);

    let offer = serde_json::json!({"sdp": "v=0", "type": "offer"});
    let first = app.clone().oneshot(json_request("POST", "/api/offer", offer.clone())).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(json_request("POST", "/api/offer", offer)).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_index_is_served_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index.html");
    let page = "<!doctype html>\n<title>voicebot</title>\n<button id=\"connect\">Connect</button>\n";
    std::fs::write(&path, page).unwrap();

    let mut settings = test_settings();
    settings.server.index_path = path.to_string_lossy().into_owned();
    let (app, _state) = app_with(settings);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.as_ref(), page.as_bytes());
}

#[tokio::test]
async fn test_missing_index_is_404() {
    let mut settings = test_settings();
    settings.server.index_path = "/nonexistent/index.html".to_string();
    let (app, _state) = app_with(settings);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health() {
    let (app, _state) = app();

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["sessions"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, _state) = app();
    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let handle = init_metrics();
    assert!(handle.is_some());
    assert!(init_metrics().is_some());

    let negotiator = Arc::new(LoopbackNegotiator::new());
    let state = AppState::new(test_settings(), negotiator, MockFactory::new(ScriptedLlm::new([]))).with_metrics(handle);
    metrics::counter!("voicebot_sessions_total").increment(1);

    let response = create_router(state)
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("voicebot_sessions_total"));
}
