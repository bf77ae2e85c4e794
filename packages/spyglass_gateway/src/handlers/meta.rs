use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::metrics;

/// Standalone engine configuration as reported to browser viewers. Both
/// fields are null unless the gateway runs in standalone mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationDto {
    pub standalone_host: Option<String>,
    pub standalone_port: Option<u16>,
}

/// Configuration endpoint - tells viewers whether host selection applies
pub async fn configuration_handler(State(state): State<AppState>) -> Json<ConfigurationDto> {
    let (standalone_host, standalone_port) = match &state.standalone {
        Some(engine) => (Some(engine.hostname.clone()), Some(engine.port)),
        None => (None, None),
    };

    Json(ConfigurationDto {
        standalone_host,
        standalone_port,
    })
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct CreateTokenResponse {
    pub token: String,
}

/// Token endpoint - issues a single-use tunnel token for the credentials
pub async fn create_token_handler(
    State(state): State<AppState>,
    Json(request): Json<CreateTokenRequest>,
) -> (StatusCode, Json<CreateTokenResponse>) {
    let token = state.tokens.issue(&request.username, &request.password).await;
    (StatusCode::CREATED, Json(CreateTokenResponse { token }))
}

/// Health check endpoint - returns gateway status
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let snapshot = state.metrics.snapshot();

    Json(metrics::HealthStatus {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        started_at: state.started_at.to_rfc3339(),
        uptime_secs: snapshot.uptime_secs,
        tunnels: metrics::TunnelHealth {
            active: snapshot.tunnels.active,
            total: snapshot.tunnels.total,
        },
    })
}

/// Metrics endpoint - returns detailed gateway metrics
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
