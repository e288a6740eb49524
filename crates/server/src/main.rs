//! Voicebot Server Entry Point

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

use voicebot_config::{load_settings, Settings};
use voicebot_server::session::spawn_reaper;
use voicebot_server::{create_router, init_metrics, AppState, HttpServiceFactory};
use voicebot_transport::Negotiator;

/// How often sessions are checked against `server.session_timeout_secs`
const REAP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Credentials may live in .env
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to read .env: {}", e);
        }
    }

    // Priority: env vars > config/{env}.toml > config/default.toml > defaults
    let env = std::env::var("VOICEBOT_ENV").ok();
    let config = load_settings(env.as_deref()).context("failed to load configuration")?;

    init_tracing(&config);

    tracing::info!("Starting Voicebot Server v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        environment = ?config.environment,
        config_path = env.as_deref().unwrap_or("default"),
        llm = ?config.llm.provider,
        "Configuration loaded"
    );

    let metrics_handle = if config.observability.metrics_enabled {
        let handle = init_metrics();
        tracing::info!("Initialized Prometheus metrics at /metrics");
        handle
    } else {
        None
    };

    let negotiator = create_negotiator(&config)?;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    let session_timeout = Duration::from_secs(config.server.session_timeout_secs);

    let state = AppState::new(config, negotiator, Arc::new(HttpServiceFactory)).with_metrics(metrics_handle);
    let sessions = state.sessions.clone();
    let signaling = state.signaling.clone();

    let shutdown = CancellationToken::new();
    let reaper = spawn_reaper(sessions, session_timeout, REAP_INTERVAL, shutdown.clone());

    let app = create_router(state);

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    shutdown.cancel();
    signaling.close_all().await;
    let _ = reaper.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}

#[cfg(feature = "webrtc")]
fn create_negotiator(config: &Settings) -> anyhow::Result<Arc<dyn Negotiator>> {
    use voicebot_transport::{WebRtcConfig, WebRtcNegotiator};

    let webrtc = WebRtcConfig::from(&config.server);
    tracing::info!(ice_servers = webrtc.ice_servers.len(), "Using WebRTC transport");
    let negotiator = WebRtcNegotiator::new(webrtc).context("failed to initialize WebRTC")?;
    Ok(Arc::new(negotiator))
}

#[cfg(not(feature = "webrtc"))]
fn create_negotiator(_config: &Settings) -> anyhow::Result<Arc<dyn Negotiator>> {
    tracing::warn!("Built without the webrtc feature, offers are answered by the loopback transport");
    Ok(Arc::new(voicebot_transport::LoopbackNegotiator::auto_connect()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}

fn init_tracing(config: &Settings) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.observability.log_level;
        let crates = ["voicebot", "voicebot_server", "voicebot_core", "voicebot_config", "voicebot_pipeline", "voicebot_llm", "voicebot_transport"];
        let mut directives: Vec<String> = crates.iter().map(|c| format!("{c}={level}")).collect();
        directives.push("tower_http=debug".to_string());
        directives.join(",").into()
    });

    let subscriber = tracing_subscriber::registry().with(env_filter);
    let fmt_layer = if config.observability.log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    subscriber.with(fmt_layer).init();
}
