//! Connection supervisor.
//!
//! Owns the single logical connection to the chat network: its state, the
//! retry budget and the session-reset policy. Everything runs on one actor
//! task; the rest of the process talks to it through a cloneable
//! [`Supervisor`] handle.
//!
//! # State machine
//!
//! ```text
//!                 connect()
//!  Disconnected ───────────▶ Connecting ──── open ────▶ Connected
//!       ▲                        │                          │
//!       │         close / connect error                     │ close
//!       └────────────────────────┴──────────────────────────┘
//!                        │
//!                        ▼
//!                 retry policy: count += 1
//!                   count <  max → reconnect after retry_interval
//!                   count >= max → wipe credentials, count = 0,
//!                                  reconnect after session_reset_delay
//! ```
//!
//! Every close reason takes the same path. A logged-out device cycles
//! through the budget until the session reset forces a fresh pairing.
//!
//! # Staleness
//!
//! - Each connection attempt runs under an epoch. Teardown bumps the epoch,
//!   so events or attempt results from a torn-down connection are dropped.
//! - Each scheduled reconnect carries a generation. Scheduling and every
//!   manual action bump it, so a timer that fires late does nothing.

mod actor;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};

use crate::client::{BotUser, ChatClient, ClientError, GroupInfo, InboundMessage};
use crate::config::ConnectionConfig;
use crate::credentials::{CredentialError, CredentialStore};
use crate::switch::SystemSwitch;

use actor::{Actor, Command};

/// Mailbox depth for supervisor commands.
const MAILBOX_SIZE: usize = 256;

/// Inbound messages buffered for the command router.
const INBOUND_BUFFER: usize = 256;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Bounded count of consecutive failed connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBudget {
    pub count: u32,
    pub max: u32,
}

/// What to do after a failure has been recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after the ordinary interval.
    Retry,
    /// Budget exhausted: wipe the session, then reconnect.
    ResetSession,
}

impl RetryBudget {
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    /// Count one failure and decide how to recover.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.count += 1;
        if self.count >= self.max {
            RetryDecision::ResetSession
        } else {
            RetryDecision::Retry
        }
    }

    /// Zero the count, returning the previous value.
    pub fn reset(&mut self) -> u32 {
        std::mem::take(&mut self.count)
    }
}

/// Read-only view of the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: ConnectionState,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub enabled: bool,
    pub user: Option<BotUser>,
    pub pending_qr: Option<String>,
}

impl StatusSnapshot {
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Result of a `connect()` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    Started,
    AlreadyConnecting,
}

/// A group, normalized for callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub id: String,
    pub name: String,
    pub member_count: usize,
}

impl From<GroupInfo> for GroupSummary {
    fn from(group: GroupInfo) -> Self {
        Self {
            id: group.id,
            name: group.subject,
            member_count: group.participants,
        }
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// Operation requires an open connection.
    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// The supervisor task is gone.
    #[error("supervisor stopped")]
    Stopped,
}

// ============================================================================
// Supervisor handle
// ============================================================================

/// Handle to the supervisor actor. Cheap to clone.
#[derive(Clone)]
pub struct Supervisor {
    tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<StatusSnapshot>,
    switch: SystemSwitch,
}

impl Supervisor {
    /// Spawn the supervisor actor.
    ///
    /// Returns the handle and the stream of inbound messages for the
    /// command router. No connection is attempted until [`Supervisor::connect`].
    pub fn spawn(
        config: ConnectionConfig,
        client: Arc<dyn ChatClient>,
        credentials: Arc<dyn CredentialStore>,
        switch: SystemSwitch,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(MAILBOX_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let initial = StatusSnapshot {
            state: ConnectionState::Disconnected,
            retry_count: 0,
            max_retries: config.max_retries,
            retry_interval: config.retry_interval(),
            enabled: switch.is_enabled(),
            user: None,
            pending_qr: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let actor = Actor::new(
            config,
            client,
            credentials,
            tx.downgrade(),
            status_tx,
            inbound_tx,
        );
        tokio::spawn(actor.run(rx));

        let supervisor = Self {
            tx,
            status_rx,
            switch,
        };
        (supervisor, inbound_rx)
    }

    /// Start a connection attempt unless one is already underway.
    pub async fn connect(&self) -> Result<ConnectOutcome, SupervisorError> {
        self.call(|reply| Command::Connect { reply }).await
    }

    /// Send a text message. Requires `Connected`.
    pub async fn send(&self, jid: &str, text: &str) -> Result<(), SupervisorError> {
        let jid = jid.to_string();
        let text = text.to_string();
        self.call(|reply| Command::Send { jid, text, reply }).await?
    }

    /// List groups the account participates in. Requires `Connected`.
    pub async fn list_groups(&self) -> Result<Vec<GroupSummary>, SupervisorError> {
        let groups = self.call(|reply| Command::ListGroups { reply }).await??;
        Ok(groups.into_iter().map(GroupSummary::from).collect())
    }

    /// Tear down and reconnect shortly, without spending retry budget.
    pub async fn manual_restart(&self) -> Result<(), SupervisorError> {
        self.call(|reply| Command::ManualRestart { reply }).await
    }

    /// Tear down, wipe the stored session, and reconnect shortly.
    pub async fn clear_session(&self) -> Result<(), SupervisorError> {
        self.call(|reply| Command::ClearSession { reply }).await?
    }

    /// Zero the retry count, returning the previous value.
    pub async fn reset_retry_count(&self) -> Result<u32, SupervisorError> {
        self.call(|reply| Command::ResetRetryCount { reply }).await
    }

    /// Current state. Never waits on the actor.
    pub fn status(&self) -> StatusSnapshot {
        let mut snapshot = self.status_rx.borrow().clone();
        snapshot.enabled = self.switch.is_enabled();
        snapshot
    }

    /// Pairing challenge waiting to be scanned, if any.
    pub fn pending_qr(&self) -> Option<String> {
        self.status_rx.borrow().pending_qr.clone()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.status_rx.clone()
    }

    pub fn switch(&self) -> &SystemSwitch {
        &self.switch
    }

    /// Tear down the connection and stop the actor. Pending timers are dropped.
    pub async fn shutdown(&self) {
        let _ = self.call(|reply| Command::Shutdown { reply }).await;
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SupervisorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| SupervisorError::Stopped)?;
        reply_rx.await.map_err(|_| SupervisorError::Stopped)
    }
}

#[cfg(test)]
mod tests;
