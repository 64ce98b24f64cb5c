//! In-memory doubles for supervisor, router and handler tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{
    BotUser, ChatClient, ChatConnection, ClientError, ClientEvent, Connection, DisconnectReason,
    GroupInfo, InboundMessage,
};
use crate::config::ConnectionConfig;
use crate::credentials::{CredentialError, CredentialStore, Credentials};
use crate::supervisor::Supervisor;
use crate::switch::SystemSwitch;

// ============================================================================
// FakeClient
// ============================================================================

/// One connect attempt observed by [`FakeClient`].
pub(crate) struct FakeSession {
    pub events: mpsc::Sender<ClientEvent>,
    pub credentials: Option<Credentials>,
    pub at: Instant,
    pub closed: watch::Receiver<bool>,
}

impl FakeSession {
    pub async fn open(&self, user_id: &str) {
        let _ = self
            .events
            .send(ClientEvent::Open(BotUser {
                id: user_id.to_string(),
                name: None,
            }))
            .await;
    }

    pub async fn close(&self, reason: DisconnectReason) {
        let _ = self
            .events
            .send(ClientEvent::Closed {
                reason,
                status_code: None,
            })
            .await;
    }

    pub async fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event).await;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Chat client that hands every connect attempt to the test.
#[derive(Clone)]
pub(crate) struct FakeClient {
    sessions: mpsc::UnboundedSender<FakeSession>,
    sends: Arc<Mutex<Vec<(String, String)>>>,
    groups: Arc<Mutex<Vec<GroupInfo>>>,
    fail_connect: Arc<AtomicBool>,
    fail_send: Arc<Mutex<Option<String>>>,
    connects: Arc<AtomicUsize>,
    send_attempts: Arc<AtomicUsize>,
    connect_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
    send_gate: Arc<Mutex<Option<oneshot::Receiver<()>>>>,
}

impl FakeClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<FakeSession>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Self {
            sessions: tx,
            sends: Arc::new(Mutex::new(Vec::new())),
            groups: Arc::new(Mutex::new(Vec::new())),
            fail_connect: Arc::new(AtomicBool::new(false)),
            fail_send: Arc::new(Mutex::new(None)),
            connects: Arc::new(AtomicUsize::new(0)),
            send_attempts: Arc::new(AtomicUsize::new(0)),
            connect_gate: Arc::new(Mutex::new(None)),
            send_gate: Arc::new(Mutex::new(None)),
        };
        (client, rx)
    }

    /// Every `(jid, text)` that reached `send_text`.
    pub fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().unwrap().clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn send_attempts(&self) -> usize {
        self.send_attempts.load(Ordering::SeqCst)
    }

    /// Park the next connect attempt until the returned sender fires or
    /// is dropped. The session is announced before the attempt returns.
    pub fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.connect_gate.lock().unwrap() = Some(rx);
        tx
    }

    /// Park the next `send_text` until released or the connection closes.
    pub fn hold_next_send(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        *self.send_gate.lock().unwrap() = Some(rx);
        tx
    }

    pub fn set_groups(&self, groups: Vec<GroupInfo>) {
        *self.groups.lock().unwrap() = groups;
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, error: Option<&str>) {
        *self.fail_send.lock().unwrap() = error.map(str::to_string);
    }
}

#[async_trait]
impl ChatClient for FakeClient {
    async fn connect(&self, credentials: Option<Credentials>) -> Result<Connection, ClientError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ClientError::Spawn(std::io::Error::other("bridge missing")));
        }

        let (events_tx, events_rx) = mpsc::channel(64);
        let (closed, closed_rx) = watch::channel(false);
        let _ = self.sessions.send(FakeSession {
            events: events_tx,
            credentials,
            at: Instant::now(),
            closed: closed_rx,
        });

        let gate = self.connect_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            let _ = gate.await;
        }

        Ok(Connection {
            handle: Arc::new(FakeConnection {
                client: self.clone(),
                closed,
            }),
            events: events_rx,
        })
    }
}

struct FakeConnection {
    client: FakeClient,
    closed: watch::Sender<bool>,
}

#[async_trait]
impl ChatConnection for FakeConnection {
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), ClientError> {
        self.client.send_attempts.fetch_add(1, Ordering::SeqCst);
        let gate = self.client.send_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            tokio::select! {
                _ = gate => {}
                _ = until_closed(self.closed.subscribe()) => return Err(ClientError::Closed),
            }
        }
        if *self.closed.borrow() {
            return Err(ClientError::Closed);
        }
        if let Some(error) = self.client.fail_send.lock().unwrap().clone() {
            return Err(ClientError::Remote(error));
        }
        self.client
            .sends
            .lock()
            .unwrap()
            .push((jid.to_string(), text.to_string()));
        Ok(())
    }

    async fn fetch_groups(&self) -> Result<Vec<GroupInfo>, ClientError> {
        Ok(self.client.groups.lock().unwrap().clone())
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

async fn until_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

// ============================================================================
// MemoryCredentialStore
// ============================================================================

/// Credential store that counts clears.
#[derive(Clone, Default)]
pub(crate) struct MemoryCredentialStore {
    credentials: Arc<Mutex<Option<Credentials>>>,
    clears: Arc<AtomicUsize>,
}

impl MemoryCredentialStore {
    pub fn with(credentials: Credentials) -> Self {
        let store = Self::default();
        *store.credentials.lock().unwrap() = Some(credentials);
        store
    }

    pub fn clears(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> Option<Credentials> {
        self.credentials.lock().unwrap().clone()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<Credentials>, CredentialError> {
        Ok(self.current())
    }

    async fn save(&self, credentials: &Credentials) -> Result<(), CredentialError> {
        *self.credentials.lock().unwrap() = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        self.clears.fetch_add(1, Ordering::SeqCst);
        *self.credentials.lock().unwrap() = None;
        Ok(())
    }
}

// ============================================================================
// Rig
// ============================================================================

/// A supervisor wired to fakes, for router and handler tests.
pub(crate) struct Rig {
    pub supervisor: Supervisor,
    pub client: FakeClient,
    pub store: MemoryCredentialStore,
    pub sessions: mpsc::UnboundedReceiver<FakeSession>,
    pub inbound: mpsc::Receiver<InboundMessage>,
}

impl Rig {
    pub fn new() -> Self {
        let (client, sessions) = FakeClient::new();
        let store = MemoryCredentialStore::default();
        let (supervisor, inbound) = Supervisor::spawn(
            ConnectionConfig::default(),
            Arc::new(client.clone()),
            Arc::new(store.clone()),
            SystemSwitch::new(),
        );
        Self {
            supervisor,
            client,
            store,
            sessions,
            inbound,
        }
    }

    /// Connect and open the session bound to `user_id`.
    pub async fn connect_as(&mut self, user_id: &str) -> FakeSession {
        self.supervisor.connect().await.unwrap();
        let session = self.sessions.recv().await.unwrap();
        session.open(user_id).await;
        let mut status = self.supervisor.subscribe();
        let _ = status.wait_for(|s| s.is_connected()).await.unwrap();
        session
    }
}
