use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use spyglass_relay::HostRegistry;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod config;
mod handlers;
mod metrics;

use crate::auth::TokenService;
use crate::config::{FileConfig, StandaloneEngine};
use crate::metrics::GatewayMetrics;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "spyglass")]
#[command(about = "WebSocket gateway bridging browser viewers to remote display engines")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a TOML configuration file (defaults to ./spyglass.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway in the foreground
    Serve(ServeArgs),

    /// Print the effective configuration as TOML and exit
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Host to bind to (overrides the configuration file)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the gateway (overrides the configuration file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Shared engine connections, one per (host, port).
    pub registry: Arc<HostRegistry>,
    /// Single-use tunnel tokens.
    pub tokens: Arc<TokenService>,
    /// Gateway metrics for observability.
    pub metrics: Arc<GatewayMetrics>,
    /// Engine configured on the gateway itself; when set, viewer-supplied
    /// engine parameters are ignored.
    pub standalone: Option<StandaloneEngine>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub(crate) fn new(config: &FileConfig) -> Self {
        AppState {
            registry: Arc::new(HostRegistry::new(config.relay_settings())),
            tokens: Arc::new(TokenService::new(Duration::from_secs(
                config.auth.token_ttl_secs,
            ))),
            metrics: Arc::new(GatewayMetrics::new()),
            standalone: config.standalone_engine(),
            started_at: Utc::now(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config: FileConfig = config::load_config(cli.config.as_deref())
        .extract()
        .context("Invalid configuration")?;

    match cli.command {
        None => run_server(ServeArgs::default(), config).await,
        Some(Commands::Serve(args)) => run_server(args, config).await,
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/tunnel", get(handlers::tunnel_handler))
        .route("/api/configuration", get(handlers::configuration_handler))
        .route("/api/tokens", post(handlers::create_token_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn run_server(args: ServeArgs, config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "spyglass=debug,spyglass_relay=debug,tower_http=debug,info"
    } else {
        "spyglass=info,spyglass_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Spyglass - remote display gateway");

    let state = AppState::new(&config);
    state.tokens.start().await;

    match &state.standalone {
        Some(engine) => info!("Standalone engine: {}:{}", engine.hostname, engine.port),
        None => info!("No standalone engine configured; viewers select engines per tunnel"),
    }

    // Clone references needed for shutdown cleanup
    let registry_for_shutdown = state.registry.clone();
    let tokens_for_shutdown = state.tokens.clone();

    let app = build_router(state);

    let host = args.host.unwrap_or_else(|| config.server.host.clone());
    let port = args.port.unwrap_or(config.server.port);
    let addr = format!("{host}:{port}").parse::<SocketAddr>()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Spyglass listening on http://{}", actual_addr);
    info!("");
    info!("Endpoints:");
    info!("  GET  /tunnel            - WebSocket tunnel to an engine session");
    info!("  POST /api/tokens        - Issue a single-use tunnel token");
    info!("  GET  /api/configuration - Standalone engine configuration");
    info!("  GET  /health            - Health status");
    info!("  GET  /metrics           - Gateway metrics");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Perform cleanup after shutdown
    info!("Closing host connections...");
    registry_for_shutdown.shutdown().await;
    tokens_for_shutdown.stop().await;

    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use spyglass_relay::testing::StubEngine;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    type Viewer =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

    async fn spawn_gateway(state: AppState) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn connect_viewer(addr: SocketAddr, query: &str) -> Viewer {
        let (viewer, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/tunnel?{query}"))
            .await
            .expect("connect viewer socket");
        viewer
    }

    async fn next_frame(viewer: &mut Viewer) -> WsMessage {
        // Wider than the 5 s engine-start wait so a refusal close always
        // arrives before this gives up.
        tokio::time::timeout(Duration::from_secs(10), viewer.next())
            .await
            .expect("timed out waiting for a viewer frame")
            .expect("viewer stream ended")
            .expect("viewer socket error")
    }

    /// Awaits the probe answer; once it arrives the tunnel is fully attached.
    async fn probe_encoding(viewer: &mut Viewer) -> String {
        viewer
            .send(WsMessage::binary(b"comm".to_vec()))
            .await
            .unwrap();
        match next_frame(viewer).await {
            WsMessage::Text(name) => name.as_str().to_string(),
            other => panic!("expected text probe answer, got {other:?}"),
        }
    }

    async fn expect_close(viewer: &mut Viewer, code: u16, reason_contains: &str) {
        match next_frame(viewer).await {
            WsMessage::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), code);
                assert!(
                    frame.reason.contains(reason_contains),
                    "unexpected close reason: {}",
                    frame.reason
                );
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    fn message_for(session_byte: u8, body: &[u8]) -> Vec<u8> {
        let mut message = vec![session_byte; 16];
        message.extend_from_slice(body);
        message
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_bridges_viewer_to_engine_traffic() {
        let engine = StubEngine::spawn().await;
        let addr = spawn_gateway(AppState::new(&FileConfig::default())).await;

        let query = format!(
            "host=127.0.0.1&port={}&sessionid={}",
            engine.port(),
            "ab".repeat(16)
        );
        let mut viewer = connect_viewer(addr, &query).await;
        assert_eq!(probe_encoding(&mut viewer).await, "binary");

        // Instructions round-trip through the engine; the stub echoes them.
        viewer
            .send(WsMessage::binary(vec![1, 2, 3, 4, 5]))
            .await
            .unwrap();
        let echo = next_frame(&mut viewer).await;
        assert_eq!(echo.into_data(), vec![1, 2, 3, 4, 5]);
        assert_eq!(
            engine.recorded_requests().await,
            vec![vec![1, 2, 3, 4, 5]]
        );

        // Messages for other sessions are dropped; only ours comes through.
        engine.publish(message_for(0xee, b"not ours")).await;
        let ours = message_for(0xab, b"display frame");
        engine.publish(ours.clone()).await;
        let frame = next_frame(&mut viewer).await;
        assert_eq!(frame.into_data(), ours);
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_login_establishes_a_fresh_session() {
        let engine = StubEngine::builder()
            .respond_with(message_for(0xcd, b"session meta"))
            .spawn()
            .await;
        let state = AppState::new(&FileConfig::default());
        let tokens = state.tokens.clone();
        let addr = spawn_gateway(state).await;

        let token = tokens.issue("mx", "secret").await;
        let query = format!(
            "host=127.0.0.1&port={}&token={token}&width=800&height=600&keyboard=fr",
            engine.port()
        );
        let mut viewer = connect_viewer(addr, &query).await;
        assert_eq!(probe_encoding(&mut viewer).await, "binary");

        let requests = engine.recorded_requests().await;
        assert_eq!(requests.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&requests[0]).unwrap();
        assert_eq!(body["type"], "connect");
        assert_eq!(body["username"], "mx");
        assert_eq!(body["password"], "secret");
        assert_eq!(body["width"], 800);
        assert_eq!(body["height"], 600);
        assert_eq!(body["keyboard"], "fr");

        // The viewer is filed under the session id the engine assigned.
        let update = message_for(0xcd, b"pixels");
        engine.publish(update.clone()).await;
        let frame = next_frame(&mut viewer).await;
        assert_eq!(frame.into_data(), update);
    }

    #[tokio::test(start_paused = true)]
    async fn standalone_mode_ignores_viewer_parameters() {
        let engine = StubEngine::spawn().await;
        let mut config = FileConfig::default();
        config.standalone.host = Some("127.0.0.1".to_string());
        config.standalone.port = Some(engine.port());
        let addr = spawn_gateway(AppState::new(&config)).await;

        // Bogus viewer parameters; the configured engine wins.
        let mut viewer =
            connect_viewer(addr, "host=nowhere.invalid&port=1&token=junk").await;
        assert_eq!(probe_encoding(&mut viewer).await, "binary");

        // No login round trip happens against a standalone engine.
        assert!(engine.recorded_requests().await.is_empty());

        // Standalone sessions live under the zeroed id.
        let update = message_for(0x00, b"desktop");
        engine.publish(update.clone()).await;
        let frame = next_frame(&mut viewer).await;
        assert_eq!(frame.into_data(), update);
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_closes_when_viewer_sends_text() {
        let engine = StubEngine::spawn().await;
        let addr = spawn_gateway(AppState::new(&FileConfig::default())).await;

        let query = format!(
            "host=127.0.0.1&port={}&sessionid={}",
            engine.port(),
            "ab".repeat(16)
        );
        let mut viewer = connect_viewer(addr, &query).await;
        assert_eq!(probe_encoding(&mut viewer).await, "binary");

        viewer.send(WsMessage::text("hello?")).await.unwrap();
        expect_close(&mut viewer, 1003, "text").await;
    }

    #[tokio::test]
    async fn tunnel_refuses_malformed_session_id() {
        let addr = spawn_gateway(AppState::new(&FileConfig::default())).await;

        let mut viewer =
            connect_viewer(addr, "host=127.0.0.1&port=4900&sessionid=abc").await;
        expect_close(&mut viewer, 1008, "session id").await;
    }

    #[tokio::test]
    async fn tunnel_refuses_unknown_token() {
        let addr = spawn_gateway(AppState::new(&FileConfig::default())).await;

        let mut viewer =
            connect_viewer(addr, "host=127.0.0.1&port=4900&token=deadbeef").await;
        expect_close(&mut viewer, 1008, "token").await;
    }

    #[tokio::test(start_paused = true)]
    async fn tunnel_refuses_unreachable_engine() {
        let engine = StubEngine::spawn().await;
        let port = engine.port();
        drop(engine);
        tokio::task::yield_now().await;

        let addr = spawn_gateway(AppState::new(&FileConfig::default())).await;

        let query = format!("host=127.0.0.1&port={port}&sessionid={}", "ab".repeat(16));
        let mut viewer = connect_viewer(addr, &query).await;
        expect_close(&mut viewer, 1011, "unreachable").await;
    }

    #[tokio::test]
    async fn http_endpoints_report_configuration_tokens_health_and_metrics() {
        let addr = spawn_gateway(AppState::new(&FileConfig::default())).await;
        let client = reqwest::Client::new();

        let configuration: serde_json::Value = client
            .get(format!("http://{addr}/api/configuration"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert!(configuration["standaloneHost"].is_null());
        assert!(configuration["standalonePort"].is_null());

        let response = client
            .post(format!("http://{addr}/api/tokens"))
            .json(&serde_json::json!({"username": "mx", "password": "secret"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["token"].as_str().unwrap().len(), 32);

        let health: serde_json::Value = client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["tunnels"]["active"], 0);

        let metrics: serde_json::Value = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(metrics["tunnels"]["total"], 0);
        assert_eq!(metrics["traffic"]["messages_to_viewers"], 0);
    }

    #[tokio::test]
    async fn standalone_configuration_is_reported_to_viewers() {
        let mut config = FileConfig::default();
        config.standalone.host = Some("render0".to_string());
        config.standalone.port = Some(11000);
        let addr = spawn_gateway(AppState::new(&config)).await;

        let configuration: serde_json::Value = reqwest::get(format!("http://{addr}/api/configuration"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(configuration["standaloneHost"], "render0");
        assert_eq!(configuration["standalonePort"], 11000);
    }
}
