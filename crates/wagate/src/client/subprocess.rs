//! Chat client backed by a bridge subprocess.
//!
//! One child process per connection attempt. Commands go to its stdin,
//! events come back on stdout, both as JSON Lines. Request/reply pairs
//! (`send_text` → `send_result`, `fetch_groups` → `groups`) are matched
//! by `request_id`.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use wagate_bridge_protocol::{BridgeCommand, BridgeEvent, DisconnectReason, GroupInfo};

use super::{ChatClient, ChatConnection, ClientError, ClientEvent, Connection};
use crate::config::BridgeConfig;
use crate::credentials::Credentials;

/// Buffered events per connection before the bridge reader applies backpressure.
const EVENT_BUFFER: usize = 256;

/// How long a closed bridge gets to exit on its own before it is killed.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ============================================================================
// SubprocessClient
// ============================================================================

/// Launches the configured bridge command for every connect attempt.
pub struct SubprocessClient {
    config: BridgeConfig,
}

impl SubprocessClient {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChatClient for SubprocessClient {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Connection, ClientError> {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(ClientError::Spawn)?;
        debug!(command = %self.config.command, pid = ?child.id(), "Bridge process started");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Protocol("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Protocol("bridge stdout unavailable".to_string()))?;
        let stderr = child.stderr.take();

        let inner = Arc::new(BridgeInner {
            stdin: tokio::sync::Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            query_timeout: Duration::from_millis(self.config.query_timeout_ms),
        });

        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);

        let mut tasks = vec![tokio::spawn(read_events(
            stdout,
            inner.clone(),
            events_tx,
        ))];
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "wagate::bridge", "{}", line);
                }
            }));
        }
        if let Ok(mut guard) = inner.tasks.lock() {
            guard.extend(tasks);
        }

        let connection = SubprocessConnection { inner };
        if let Err(e) = connection.inner.write(&BridgeCommand::Start { credentials }).await {
            connection.close();
            return Err(e);
        }

        Ok(Connection {
            handle: Arc::new(connection),
            events: events_rx,
        })
    }
}

// ============================================================================
// SubprocessConnection
// ============================================================================

/// Reply to a correlated request.
enum Reply {
    Sent(Option<String>),
    Groups(Result<Vec<GroupInfo>, String>),
}

struct BridgeInner {
    stdin: tokio::sync::Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: DashMap<String, oneshot::Sender<Reply>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    query_timeout: Duration,
}

impl BridgeInner {
    async fn write(&self, command: &BridgeCommand) -> Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.write_line(command).await
    }

    async fn write_line(&self, command: &BridgeCommand) -> Result<(), ClientError> {
        let mut line =
            serde_json::to_string(command).map_err(|e| ClientError::Protocol(e.to_string()))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn request(&self, request_id: String, command: BridgeCommand) -> Result<Reply, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);

        if let Err(e) = self.write(&command).await {
            self.pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.pending.remove(&request_id);
                Err(ClientError::Timeout)
            }
        }
    }

    fn resolve(&self, request_id: &str, reply: Reply) {
        match self.pending.remove(request_id) {
            Some((_, tx)) => {
                let _ = tx.send(reply);
            }
            None => debug!(request_id, "Reply for unknown or expired request"),
        }
    }
}

/// Outbound handle for one bridge process.
pub struct SubprocessConnection {
    inner: Arc<BridgeInner>,
}

#[async_trait]
impl ChatConnection for SubprocessConnection {
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), ClientError> {
        let request_id = new_request_id();
        let command = BridgeCommand::SendText {
            request_id: request_id.clone(),
            jid: jid.to_string(),
            text: text.to_string(),
        };
        match self.inner.request(request_id, command).await? {
            Reply::Sent(None) => Ok(()),
            Reply::Sent(Some(error)) => Err(ClientError::Remote(error)),
            Reply::Groups(_) => Err(ClientError::Protocol(
                "groups reply to a send request".to_string(),
            )),
        }
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupInfo>, ClientError> {
        let request_id = new_request_id();
        let command = BridgeCommand::FetchGroups {
            request_id: request_id.clone(),
        };
        match self.inner.request(request_id, command).await? {
            Reply::Groups(Ok(groups)) => Ok(groups),
            Reply::Groups(Err(error)) => Err(ClientError::Remote(error)),
            Reply::Sent(_) => Err(ClientError::Protocol(
                "send reply to a groups request".to_string(),
            )),
        }
    }

    fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        // Dropping the senders fails every in-flight request with `Closed`.
        self.inner.pending.clear();

        let child = self.inner.child.lock().ok().and_then(|mut slot| slot.take());
        let Some(mut child) = child else {
            return;
        };

        // Ask the bridge to end the socket, then make sure it exits.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let inner = self.inner.clone();
                runtime.spawn(async move {
                    if let Err(e) = inner.write_line(&BridgeCommand::Shutdown).await {
                        debug!(error = %e, "Could not send shutdown to bridge");
                    }
                    if tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await.is_err() {
                        debug!("Bridge did not exit in time, killing it");
                        let _ = child.start_kill();
                    }
                });
            }
            Err(_) => {
                let _ = child.start_kill();
            }
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

async fn read_events(
    stdout: ChildStdout,
    inner: Arc<BridgeInner>,
    events_tx: mpsc::Sender<ClientEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut saw_close = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Failed to read from bridge");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let event: BridgeEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed bridge line");
                continue;
            }
        };

        let client_event = match event {
            BridgeEvent::SendResult { request_id, error } => {
                inner.resolve(&request_id, Reply::Sent(error));
                continue;
            }
            BridgeEvent::Groups {
                request_id,
                groups,
                error,
            } => {
                let reply = match error {
                    Some(error) => Err(error),
                    None => Ok(groups),
                };
                inner.resolve(&request_id, Reply::Groups(reply));
                continue;
            }
            BridgeEvent::Qr { code } => ClientEvent::Qr(code),
            BridgeEvent::Connecting => ClientEvent::Connecting,
            BridgeEvent::Open { user } => ClientEvent::Open(user),
            BridgeEvent::Close {
                status_code,
                reason,
            } => {
                saw_close = true;
                ClientEvent::Closed {
                    reason: DisconnectReason::resolve(reason, status_code),
                    status_code,
                }
            }
            BridgeEvent::CredsUpdate { credentials } => ClientEvent::CredentialsUpdated(credentials),
            BridgeEvent::Message(message) => ClientEvent::Message(message),
        };

        if events_tx.send(client_event).await.is_err() {
            return;
        }
    }

    inner.pending.clear();
    if !saw_close {
        debug!("Bridge exited without a close event");
        let _ = events_tx
            .send(ClientEvent::Closed {
                reason: DisconnectReason::Unknown,
                status_code: None,
            })
            .await;
    }
}

fn new_request_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}
