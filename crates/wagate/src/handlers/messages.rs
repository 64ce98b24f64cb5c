//! Outbound message and group listing handlers.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use wagate_bridge_protocol::{direct_jid, group_jid};

use super::present;
use crate::response::ApiError;
use crate::server::AppState;
use crate::supervisor::GroupSummary;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct SendMessageQuery {
    number: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    success: bool,
    message: &'static str,
    to: String,
    text: String,
    system_enabled: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendGroupMessageQuery {
    group_id: Option<String>,
    message: Option<String>,
}

#[derive(Serialize)]
pub struct SendGroupMessageResponse {
    success: bool,
    message: &'static str,
    to: String,
    text: String,
}

#[derive(Serialize)]
pub struct GroupEntry {
    id: String,
    name: String,
    participants: usize,
}

impl From<GroupSummary> for GroupEntry {
    fn from(group: GroupSummary) -> Self {
        Self {
            id: group.id,
            name: group.name,
            participants: group.member_count,
        }
    }
}

#[derive(Serialize)]
pub struct GroupsResponse {
    success: bool,
    groups: Vec<GroupEntry>,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /send-message?number=..&message=..
pub async fn send_message(
    State(state): State<AppState>,
    Query(query): Query<SendMessageQuery>,
) -> Result<Json<SendMessageResponse>, ApiError> {
    state.ensure_enabled()?;

    let (Some(number), Some(text)) = (present(query.number), present(query.message)) else {
        return Err(ApiError::bad_request(
            "Parameter number dan message wajib diisi",
            "/send-message?number=6281234567890&message=Halo%20dari%20API",
        ));
    };

    let jid = direct_jid(&number);
    if let Err(e) = state.supervisor.send(&jid, &text).await {
        error!(error = %e, to = %jid, "Error sending message");
        return Err(e.into());
    }
    info!(to = %number, "Message sent");

    Ok(Json(SendMessageResponse {
        success: true,
        message: "Pesan berhasil dikirim",
        to: number,
        text,
        system_enabled: state.switch.is_enabled(),
    }))
}

/// GET /send-group-message?groupId=..&message=..
pub async fn send_group_message(
    State(state): State<AppState>,
    Query(query): Query<SendGroupMessageQuery>,
) -> Result<Json<SendGroupMessageResponse>, ApiError> {
    state.ensure_enabled()?;

    let (Some(group_id), Some(text)) = (present(query.group_id), present(query.message)) else {
        return Err(ApiError::bad_request(
            "Parameter groupId dan message wajib diisi",
            "/send-group-message?groupId=120363123456789012@g.us&message=Halo%20grup",
        ));
    };

    let jid = group_jid(&group_id);
    if let Err(e) = state.supervisor.send(&jid, &text).await {
        error!(error = %e, to = %jid, "Error sending group message");
        return Err(e.into());
    }
    info!(to = %group_id, "Group message sent");

    Ok(Json(SendGroupMessageResponse {
        success: true,
        message: "Pesan grup berhasil dikirim",
        to: group_id,
        text,
    }))
}

/// GET /groups
pub async fn list_groups(State(state): State<AppState>) -> Result<Json<GroupsResponse>, ApiError> {
    state.ensure_enabled()?;

    let groups = state.supervisor.list_groups().await.map_err(|e| {
        error!(error = %e, "Error fetching groups");
        ApiError::from(e)
    })?;

    Ok(Json(GroupsResponse {
        success: true,
        groups: groups.into_iter().map(GroupEntry::from).collect(),
    }))
}
