use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::client::BotUser;
use crate::server::AppState;
use crate::supervisor::ConnectionState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    success: bool,
    connected: bool,
    connection_state: ConnectionState,
    system_enabled: bool,
    retry_count: u32,
    max_retries: u32,
    user: Option<BotUser>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    success: bool,
    healthy: bool,
    connection_state: ConnectionState,
    system_enabled: bool,
    retry_count: u32,
    max_retries: u32,
    next_retry_in: Option<String>,
    auto_restart_enabled: bool,
}

#[derive(Serialize)]
pub struct QrResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    qr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

/// GET /status
pub async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let status = state.supervisor.status();
    let connected = status.is_connected();
    Json(StatusResponse {
        success: true,
        connected,
        connection_state: status.state,
        system_enabled: status.enabled,
        retry_count: status.retry_count,
        max_retries: status.max_retries,
        user: status.user.filter(|_| connected),
    })
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = state.supervisor.status();
    let healthy = status.is_connected();
    let next_retry_in =
        (!healthy).then(|| format!("{} seconds", status.retry_interval.as_secs_f64()));

    Json(HealthResponse {
        success: true,
        healthy,
        connection_state: status.state,
        system_enabled: status.enabled,
        retry_count: status.retry_count,
        max_retries: status.max_retries,
        next_retry_in,
        auto_restart_enabled: true,
    })
}

/// GET /qr
pub async fn qr(State(state): State<AppState>) -> Json<QrResponse> {
    let response = match state.supervisor.pending_qr() {
        Some(code) => QrResponse {
            success: true,
            qr: Some(code),
            message: None,
        },
        None => QrResponse {
            success: false,
            qr: None,
            message: Some("QR code tidak tersedia"),
        },
    };
    Json(response)
}
