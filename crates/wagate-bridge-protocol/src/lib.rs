//! Bridge protocol for wagate.
//!
//! wagate does not speak the chat network's wire protocol itself. Each
//! connection attempt spawns a bridge process that owns the socket, the
//! handshake and the encryption, and talks to wagate over stdio:
//!
//! - [`BridgeCommand`]: wagate → bridge (stdin)
//! - [`BridgeEvent`]: bridge → wagate (stdout)
//!
//! Both directions are JSON Lines: one JSON object per line, tagged by a
//! `"type"` field.
//!
//! ```text
//!  wagate                                   bridge
//!    │  {"type":"start","credentials":...}     │
//!    │ ──────────────────────────────────────▶ │
//!    │  {"type":"qr","code":"2@..."}           │
//!    │ ◀────────────────────────────────────── │
//!    │  {"type":"open","user":{"id":"..."}}    │
//!    │ ◀────────────────────────────────────── │
//!    │  {"type":"send_text","request_id":...}  │
//!    │ ──────────────────────────────────────▶ │
//!    │  {"type":"send_result","request_id":..} │
//!    │ ◀────────────────────────────────────── │
//! ```

use serde::{Deserialize, Serialize};

/// Server part of a one-to-one conversation id.
pub const DIRECT_SUFFIX: &str = "s.whatsapp.net";

/// Server part of a group conversation id.
pub const GROUP_SUFFIX: &str = "g.us";

// ============================================================================
// Commands (wagate → bridge)
// ============================================================================

/// Commands written to the bridge's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeCommand {
    /// Open the connection. `credentials` is `None` when pairing from scratch.
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credentials: Option<serde_json::Value>,
    },
    /// Send a plain text message.
    SendText {
        request_id: String,
        jid: String,
        text: String,
    },
    /// List every group the account participates in.
    FetchGroups { request_id: String },
    /// End the socket and exit.
    Shutdown,
}

// ============================================================================
// Events (bridge → wagate)
// ============================================================================

/// Events read from the bridge's stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A pairing challenge to be scanned from the phone.
    Qr { code: String },
    /// The socket is handshaking.
    Connecting,
    /// The connection is open and bound to `user`.
    Open { user: BotUser },
    /// The connection closed. `status_code` is the network's disconnect code;
    /// `reason`, when the bridge names one, takes precedence over it.
    Close {
        #[serde(default)]
        status_code: Option<u16>,
        #[serde(default)]
        reason: Option<DisconnectReason>,
    },
    /// Credentials rotated; persist them before the next connect.
    CredsUpdate { credentials: serde_json::Value },
    /// An inbound message.
    Message(InboundMessage),
    /// Reply to [`BridgeCommand::SendText`].
    SendResult {
        request_id: String,
        #[serde(default)]
        error: Option<String>,
    },
    /// Reply to [`BridgeCommand::FetchGroups`].
    Groups {
        request_id: String,
        #[serde(default)]
        groups: Vec<GroupInfo>,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Identity the connection is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotUser {
    /// Full user id, e.g. `62812345678:12@s.whatsapp.net`.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl BotUser {
    /// The numeric part of the user id.
    pub fn number(&self) -> &str {
        bare_number(&self.id)
    }
}

/// A message received on the chat network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<String>,
    /// Conversation the message arrived in (direct or group).
    pub remote_jid: String,
    /// Author inside a group; absent for direct messages.
    #[serde(default)]
    pub participant: Option<String>,
    /// Authored by the bound account itself.
    #[serde(default)]
    pub from_me: bool,
    /// Text body, if the message has one.
    #[serde(default)]
    pub text: Option<String>,
    /// Participants explicitly mentioned in the message.
    #[serde(default)]
    pub mentioned_jids: Vec<String>,
}

impl InboundMessage {
    pub fn is_group(&self) -> bool {
        self.remote_jid.contains(&format!("@{GROUP_SUFFIX}"))
    }

    /// The author: the group participant, or the conversation for direct messages.
    pub fn sender(&self) -> &str {
        self.participant.as_deref().unwrap_or(&self.remote_jid)
    }
}

/// A group the account participates in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub participants: usize,
}

// ============================================================================
// Disconnect reasons
// ============================================================================

/// Why a connection closed, decoded from the close status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    BadSession,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    LoggedOut,
    RestartRequired,
    /// Shares close code 408 with `ConnectionLost`; only a named `reason`
    /// on the close event yields it.
    TimedOut,
    Unknown,
}

impl DisconnectReason {
    /// Decode a close status code.
    ///
    /// 408 is shared by "connection lost" and "timed out"; it decodes as
    /// [`DisconnectReason::ConnectionLost`].
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(500) => Self::BadSession,
            Some(428) => Self::ConnectionClosed,
            Some(408) => Self::ConnectionLost,
            Some(440) => Self::ConnectionReplaced,
            Some(401) => Self::LoggedOut,
            Some(515) => Self::RestartRequired,
            _ => Self::Unknown,
        }
    }

    /// The bridge's named reason if it sent one, else the decoded code.
    pub fn resolve(reason: Option<Self>, code: Option<u16>) -> Self {
        reason.unwrap_or_else(|| Self::from_status_code(code))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadSession => "bad_session",
            Self::ConnectionClosed => "connection_closed",
            Self::ConnectionLost => "connection_lost",
            Self::ConnectionReplaced => "connection_replaced",
            Self::LoggedOut => "logged_out",
            Self::RestartRequired => "restart_required",
            Self::TimedOut => "timed_out",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Addressing
// ============================================================================

/// Normalize a phone number to a direct conversation id.
pub fn direct_jid(number: &str) -> String {
    with_suffix(number, DIRECT_SUFFIX)
}

/// Normalize a group id to a group conversation id.
pub fn group_jid(id: &str) -> String {
    with_suffix(id, GROUP_SUFFIX)
}

fn with_suffix(id: &str, suffix: &str) -> String {
    if id.contains(&format!("@{suffix}")) {
        id.to_string()
    } else {
        format!("{id}@{suffix}")
    }
}

/// Strip the device (`:12`) and server (`@s.whatsapp.net`) parts of a user id.
pub fn bare_number(user_id: &str) -> &str {
    let end = user_id.find([':', '@']).unwrap_or(user_id.len());
    &user_id[..end]
}
