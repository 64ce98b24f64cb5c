//! Chat-network client seam.
//!
//! The supervisor drives a [`ChatClient`] without knowing how the network
//! is reached. Each [`ChatClient::connect`] call produces one [`Connection`]:
//! a handle for outbound operations plus the stream of lifecycle and
//! message events for that socket only.
//!
//! The production implementation is [`SubprocessClient`], which runs the
//! protocol bridge as a child process speaking JSON Lines
//! (see `wagate-bridge-protocol`).

mod subprocess;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use subprocess::SubprocessClient;
pub use wagate_bridge_protocol::{BotUser, DisconnectReason, GroupInfo, InboundMessage};

use crate::credentials::Credentials;

// ============================================================================
// Types
// ============================================================================

/// Lifecycle and message events emitted by a single connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Pairing challenge to present to the user.
    Qr(String),
    /// Handshake in progress.
    Connecting,
    /// Connection open and bound to this identity.
    Open(BotUser),
    /// Connection closed.
    Closed {
        reason: DisconnectReason,
        status_code: Option<u16>,
    },
    /// Credentials rotated.
    CredentialsUpdated(Credentials),
    /// Inbound message.
    Message(InboundMessage),
}

/// A live connection: outbound handle plus its event stream.
pub struct Connection {
    pub handle: Arc<dyn ChatConnection>,
    pub events: mpsc::Receiver<ClientEvent>,
}

/// Errors from the chat client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client process could not be started.
    #[error("failed to start chat client: {0}")]
    Spawn(std::io::Error),

    /// I/O with the client failed.
    #[error("chat client io error: {0}")]
    Io(#[from] std::io::Error),

    /// The client sent something we could not understand.
    #[error("chat client protocol error: {0}")]
    Protocol(String),

    /// The connection was torn down while a request was in flight.
    #[error("connection closed")]
    Closed,

    /// The client did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The network rejected the request; message passed through as-is.
    #[error("{0}")]
    Remote(String),
}

// ============================================================================
// Traits
// ============================================================================

/// Opens connections to the chat network.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Start a connection attempt with the stored credentials, if any.
    ///
    /// Returning `Ok` means the attempt is underway; whether it succeeds is
    /// reported through [`ClientEvent::Open`] or [`ClientEvent::Closed`].
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Connection, ClientError>;
}

/// Outbound operations on one connection.
#[async_trait]
pub trait ChatConnection: Send + Sync {
    /// Send a text message to a conversation id.
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), ClientError>;

    /// List the groups the account participates in.
    async fn fetch_groups(&self) -> Result<Vec<GroupInfo>, ClientError>;

    /// Detach all event listeners and end the socket. Idempotent.
    fn close(&self);
}
