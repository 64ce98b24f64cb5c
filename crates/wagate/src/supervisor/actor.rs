//! Supervisor actor: the only code that mutates connection state.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    ConnectOutcome, ConnectionState, RetryBudget, RetryDecision, StatusSnapshot, SupervisorError,
};
use crate::client::{
    BotUser, ChatClient, ChatConnection, ClientEvent, Connection, DisconnectReason, GroupInfo,
    InboundMessage,
};
use crate::config::ConnectionConfig;
use crate::credentials::CredentialStore;

// ============================================================================
// Mailbox
// ============================================================================

pub(super) enum Command {
    Connect {
        reply: oneshot::Sender<ConnectOutcome>,
    },
    Send {
        jid: String,
        text: String,
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    ListGroups {
        reply: oneshot::Sender<Result<Vec<GroupInfo>, SupervisorError>>,
    },
    ManualRestart {
        reply: oneshot::Sender<()>,
    },
    ClearSession {
        reply: oneshot::Sender<Result<(), SupervisorError>>,
    },
    ResetRetryCount {
        reply: oneshot::Sender<u32>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },

    // Internal: produced by tasks the actor spawns.
    Attempted {
        epoch: u64,
        result: Result<Connection, SupervisorError>,
    },
    Event {
        epoch: u64,
        event: ClientEvent,
    },
    RetryDue {
        generation: u64,
    },
}

/// The live connection and the task forwarding its events.
struct ActiveConnection {
    handle: Arc<dyn ChatConnection>,
    forwarder: JoinHandle<()>,
}

// ============================================================================
// Actor
// ============================================================================

pub(super) struct Actor {
    config: ConnectionConfig,
    client: Arc<dyn ChatClient>,
    credentials: Arc<dyn CredentialStore>,
    mailbox: mpsc::WeakSender<Command>,
    status_tx: watch::Sender<StatusSnapshot>,
    inbound_tx: mpsc::Sender<InboundMessage>,

    state: ConnectionState,
    budget: RetryBudget,
    user: Option<BotUser>,
    pending_qr: Option<String>,
    active: Option<ActiveConnection>,

    epoch: u64,
    generation: u64,
    retry_timer: Option<JoinHandle<()>>,
}

impl Actor {
    pub(super) fn new(
        config: ConnectionConfig,
        client: Arc<dyn ChatClient>,
        credentials: Arc<dyn CredentialStore>,
        mailbox: mpsc::WeakSender<Command>,
        status_tx: watch::Sender<StatusSnapshot>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Self {
        let budget = RetryBudget::new(config.max_retries);
        Self {
            config,
            client,
            credentials,
            mailbox,
            status_tx,
            inbound_tx,
            state: ConnectionState::Disconnected,
            budget,
            user: None,
            pending_qr: None,
            active: None,
            epoch: 0,
            generation: 0,
            retry_timer: None,
        }
    }

    pub(super) async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        debug!("Supervisor started");
        while let Some(command) = rx.recv().await {
            if !self.handle(command).await {
                break;
            }
        }
        rx.close();
        while let Ok(command) = rx.try_recv() {
            close_orphaned(command);
        }
        self.cancel_retry();
        self.teardown();
        self.state = ConnectionState::Disconnected;
        self.publish();
        debug!("Supervisor stopped");
    }

    /// Process one command. Returns `false` to stop the actor.
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Connect { reply } => {
                let outcome = self.connect();
                let _ = reply.send(outcome);
            }
            Command::Send { jid, text, reply } => match self.connected_handle() {
                Some(handle) => {
                    tokio::spawn(async move {
                        let result = handle.send_text(&jid, &text).await;
                        let _ = reply.send(result.map_err(SupervisorError::from));
                    });
                }
                None => {
                    let _ = reply.send(Err(SupervisorError::NotConnected));
                }
            },
            Command::ListGroups { reply } => match self.connected_handle() {
                Some(handle) => {
                    tokio::spawn(async move {
                        let result = handle.fetch_groups().await;
                        let _ = reply.send(result.map_err(SupervisorError::from));
                    });
                }
                None => {
                    let _ = reply.send(Err(SupervisorError::NotConnected));
                }
            },
            Command::ManualRestart { reply } => {
                info!("Manual restart requested");
                self.reset_connection();
                self.schedule_reconnect(self.config.restart_delay());
                self.publish();
                let _ = reply.send(());
            }
            Command::ClearSession { reply } => {
                info!("Clearing session");
                self.reset_connection();
                let result = self.credentials.clear().await.map_err(SupervisorError::from);
                match &result {
                    Ok(()) => info!("Session cleared manually"),
                    Err(e) => error!(error = %e, "Failed to clear session"),
                }
                self.schedule_reconnect(self.config.clear_session_delay());
                self.publish();
                let _ = reply.send(result);
            }
            Command::ResetRetryCount { reply } => {
                let old = self.budget.reset();
                info!(old, "Retry count reset");
                self.publish();
                let _ = reply.send(old);
            }
            Command::Shutdown { reply } => {
                info!("Supervisor shutting down");
                self.cancel_retry();
                self.teardown();
                self.state = ConnectionState::Disconnected;
                self.publish();
                let _ = reply.send(());
                return false;
            }
            Command::Attempted { epoch, result } => self.on_attempted(epoch, result).await,
            Command::Event { epoch, event } => self.on_event(epoch, event).await,
            Command::RetryDue { generation } => {
                if generation != self.generation {
                    debug!(generation, current = self.generation, "Ignoring stale retry timer");
                } else {
                    self.retry_timer = None;
                    self.connect();
                }
            }
        }
        true
    }

    // ========================================================================
    // Connect
    // ========================================================================

    fn connect(&mut self) -> ConnectOutcome {
        if self.state == ConnectionState::Connecting {
            info!("Already connecting, please wait");
            return ConnectOutcome::AlreadyConnecting;
        }

        info!("Starting WhatsApp connection");
        self.state = ConnectionState::Connecting;
        self.teardown();
        self.publish();

        let epoch = self.epoch;
        let client = self.client.clone();
        let credentials = self.credentials.clone();
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let result = match credentials.load().await {
                Ok(stored) => client.connect(stored).await.map_err(SupervisorError::from),
                Err(e) => Err(SupervisorError::from(e)),
            };

            let attempted = Command::Attempted { epoch, result };
            let undelivered = match mailbox.upgrade() {
                Some(tx) => tx.send(attempted).await.err().map(|e| e.0),
                None => Some(attempted),
            };
            if let Some(command) = undelivered {
                close_orphaned(command);
            }
        });

        ConnectOutcome::Started
    }

    async fn on_attempted(&mut self, epoch: u64, result: Result<Connection, SupervisorError>) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Discarding stale connect attempt");
            if let Ok(connection) = result {
                connection.handle.close();
            }
            return;
        }

        match result {
            Ok(Connection { handle, events }) => {
                let forwarder = self.spawn_forwarder(epoch, events);
                self.active = Some(ActiveConnection { handle, forwarder });
                debug!(epoch, "Connect attempt underway");
            }
            Err(e) => {
                error!(error = %e, "Error while connecting");
                self.state = ConnectionState::Disconnected;
                self.teardown();
                self.publish();
                self.apply_retry_policy().await;
            }
        }
    }

    fn spawn_forwarder(&self, epoch: u64, mut events: mpsc::Receiver<ClientEvent>) -> JoinHandle<()> {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(tx) = mailbox.upgrade() else {
                    return;
                };
                if tx.send(Command::Event { epoch, event }).await.is_err() {
                    return;
                }
            }
        })
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    async fn on_event(&mut self, epoch: u64, event: ClientEvent) {
        if epoch != self.epoch {
            debug!(epoch, current = self.epoch, "Dropping event from torn-down connection");
            return;
        }

        match event {
            ClientEvent::Qr(code) => {
                info!(qr = %code, "Pairing QR code received, scan it to link the device");
                self.pending_qr = Some(code);
                self.publish();
            }
            ClientEvent::Connecting => {
                debug!("Connecting to WhatsApp");
            }
            ClientEvent::Open(user) => {
                info!(user = %user.id, "WhatsApp connected");
                self.state = ConnectionState::Connected;
                self.pending_qr = None;
                self.user = Some(user);
                let attempts = self.budget.reset();
                if attempts > 0 {
                    info!(attempts, "Connection restored after {} attempts", attempts);
                }
                self.publish();
            }
            ClientEvent::Closed {
                reason,
                status_code,
            } => {
                warn!(%reason, ?status_code, "Connection closed");
                log_close_reason(reason);
                self.state = ConnectionState::Disconnected;
                self.teardown();
                self.publish();
                self.apply_retry_policy().await;
            }
            ClientEvent::CredentialsUpdated(credentials) => {
                if let Err(e) = self.credentials.save(&credentials).await {
                    warn!(error = %e, "Failed to persist rotated credentials");
                }
            }
            ClientEvent::Message(message) => {
                if let Err(e) = self.inbound_tx.try_send(message) {
                    warn!(error = %e, "Command router not keeping up, dropping message");
                }
            }
        }
    }

    // ========================================================================
    // Retry policy
    // ========================================================================

    async fn apply_retry_policy(&mut self) {
        let decision = self.budget.record_failure();
        info!(
            attempt = self.budget.count,
            max = self.budget.max,
            "Auto restart attempt {}/{}",
            self.budget.count,
            self.budget.max
        );

        match decision {
            RetryDecision::Retry => {
                self.schedule_reconnect(self.config.retry_interval());
            }
            RetryDecision::ResetSession => {
                warn!("Max retry attempts reached, clearing session and restarting");
                self.teardown();
                match self.credentials.clear().await {
                    Ok(()) => info!("Session cleared automatically"),
                    Err(e) => error!(error = %e, "Failed to clear session"),
                }
                self.budget.reset();
                self.schedule_reconnect(self.config.session_reset_delay());
            }
        }
        self.publish();
    }

    fn schedule_reconnect(&mut self, delay: Duration) {
        self.cancel_retry();
        let generation = self.generation;
        let mailbox = self.mailbox.clone();
        debug!(generation, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");

        self.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(Command::RetryDue { generation }).await;
            }
        }));
    }

    /// Invalidate any scheduled reconnect.
    fn cancel_retry(&mut self) {
        self.generation += 1;
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Shared prefix of manual restart and clear-session.
    fn reset_connection(&mut self) {
        self.cancel_retry();
        self.teardown();
        self.state = ConnectionState::Disconnected;
        self.budget.reset();
    }

    /// Detach the current connection and end its socket.
    ///
    /// Bumps the epoch, so anything still in flight for the old connection
    /// is discarded when it arrives.
    fn teardown(&mut self) {
        self.epoch += 1;
        self.user = None;
        if let Some(active) = self.active.take() {
            active.forwarder.abort();
            active.handle.close();
            debug!("Previous connection torn down");
        }
    }

    fn connected_handle(&self) -> Option<Arc<dyn ChatConnection>> {
        if self.state != ConnectionState::Connected {
            return None;
        }
        self.active.as_ref().map(|a| a.handle.clone())
    }

    fn publish(&self) {
        self.status_tx.send_modify(|s| {
            s.state = self.state;
            s.retry_count = self.budget.count;
            s.max_retries = self.budget.max;
            s.user = self.user.clone();
            s.pending_qr = self.pending_qr.clone();
        });
    }
}

/// Close a connection whose attempt finished after the actor stopped.
fn close_orphaned(command: Command) {
    if let Command::Attempted {
        result: Ok(connection),
        ..
    } = command
    {
        debug!("Closing connection that arrived after shutdown");
        connection.handle.close();
    }
}

fn log_close_reason(reason: DisconnectReason) {
    match reason {
        DisconnectReason::BadSession => {
            warn!("Bad session detected, will reset the session once retries run out")
        }
        DisconnectReason::ConnectionClosed => info!("Connection closed, attempting reconnect"),
        DisconnectReason::ConnectionLost => info!("Connection lost, attempting reconnect"),
        DisconnectReason::ConnectionReplaced => warn!("Connection replaced by another session"),
        DisconnectReason::LoggedOut => {
            warn!("Device logged out, will clear the session once retries run out")
        }
        DisconnectReason::RestartRequired => info!("Restart required, attempting reconnect"),
        DisconnectReason::TimedOut => info!("Connection timed out, attempting reconnect"),
        DisconnectReason::Unknown => info!("Unknown close reason, attempting reconnect"),
    }
}
