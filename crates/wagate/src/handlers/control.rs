//! Connection and system control handlers.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::present;
use crate::response::ApiError;
use crate::server::AppState;
use crate::supervisor::ConnectionState;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartResponse {
    success: bool,
    message: &'static str,
    retry_count: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetRetryResponse {
    success: bool,
    message: &'static str,
    old_retry_count: u32,
    new_retry_count: u32,
}

#[derive(Deserialize)]
pub struct SystemControlQuery {
    action: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SwitchResponse {
    success: bool,
    message: &'static str,
    system_enabled: bool,
    controlled_by: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatusResponse {
    success: bool,
    system_enabled: bool,
    connection_state: ConnectionState,
    message: String,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum SystemControlResponse {
    Switch(SwitchResponse),
    Status(SystemStatusResponse),
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /restart
pub async fn restart(State(state): State<AppState>) -> Result<Json<RestartResponse>, ApiError> {
    state.ensure_enabled()?;
    state.supervisor.manual_restart().await?;

    Ok(Json(RestartResponse {
        success: true,
        message: "Koneksi restart dimulai",
        retry_count: 0,
    }))
}

/// GET /clear-session
pub async fn clear_session(
    State(state): State<AppState>,
) -> Result<Json<RestartResponse>, ApiError> {
    state.ensure_enabled()?;
    state.supervisor.clear_session().await?;

    Ok(Json(RestartResponse {
        success: true,
        message: "Session cleared, akan restart otomatis dalam 3 detik",
        retry_count: 0,
    }))
}

/// GET /reset-retry
pub async fn reset_retry(
    State(state): State<AppState>,
) -> Result<Json<ResetRetryResponse>, ApiError> {
    state.ensure_enabled()?;
    let old = state.supervisor.reset_retry_count().await?;

    Ok(Json(ResetRetryResponse {
        success: true,
        message: "Retry count reset",
        old_retry_count: old,
        new_retry_count: 0,
    }))
}

/// GET /system-control?action=start|stop|status
pub async fn system_control(
    State(state): State<AppState>,
    Query(query): Query<SystemControlQuery>,
) -> Result<Json<SystemControlResponse>, ApiError> {
    let Some(action) = present(query.action) else {
        return Err(ApiError::bad_request(
            "Parameter action wajib diisi (start/stop/status)",
            "/system-control?action=stop",
        ));
    };

    let response = match action.to_lowercase().as_str() {
        "stop" => {
            state.switch.set(false, "API");
            SystemControlResponse::Switch(SwitchResponse {
                success: true,
                message: "Sistem send WA dihentikan via API",
                system_enabled: false,
                controlled_by: "API",
            })
        }
        "start" => {
            state.switch.set(true, "API");
            SystemControlResponse::Switch(SwitchResponse {
                success: true,
                message: "Sistem send WA diaktifkan via API",
                system_enabled: true,
                controlled_by: "API",
            })
        }
        "status" => {
            let status = state.supervisor.status();
            info!(enabled = status.enabled, "System status requested via API");
            let label = if status.enabled { "AKTIF" } else { "NONAKTIF" };
            SystemControlResponse::Status(SystemStatusResponse {
                success: true,
                system_enabled: status.enabled,
                connection_state: status.state,
                message: format!("Sistem saat ini {label}"),
            })
        }
        _ => {
            return Err(ApiError::BadRequest {
                error: "Action tidak valid. Gunakan: start, stop, atau status",
                example: None,
            });
        }
    };
    Ok(Json(response))
}
