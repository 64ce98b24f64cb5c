use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::*;
use crate::client::testing::{FakeClient, FakeSession, MemoryCredentialStore};
use crate::client::{ClientEvent, DisconnectReason};

const BOT: &str = "62812345678:4@s.whatsapp.net";

struct Harness {
    supervisor: Supervisor,
    client: FakeClient,
    sessions: mpsc::UnboundedReceiver<FakeSession>,
    store: MemoryCredentialStore,
    inbound: mpsc::Receiver<InboundMessage>,
}

fn start() -> Harness {
    let (client, sessions) = FakeClient::new();
    let store = MemoryCredentialStore::with(json!({"me": {"id": BOT}}));
    let (supervisor, inbound) = Supervisor::spawn(
        ConnectionConfig::default(),
        Arc::new(client.clone()),
        Arc::new(store.clone()),
        SystemSwitch::new(),
    );
    Harness {
        supervisor,
        client,
        sessions,
        store,
        inbound,
    }
}

impl Harness {
    async fn next_session(&mut self) -> FakeSession {
        self.sessions.recv().await.expect("connect attempt")
    }

    async fn connected(&mut self) -> FakeSession {
        self.supervisor.connect().await.unwrap();
        let session = self.next_session().await;
        session.open(BOT).await;
        self.wait_for(ConnectionState::Connected).await;
        session
    }

    async fn wait_for(&self, state: ConnectionState) {
        let mut rx = self.supervisor.subscribe();
        let _ = rx.wait_for(|s| s.state == state).await.unwrap();
    }
}

/// Let every runnable task drain; the paused clock only moves when all are idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// RetryBudget
// ============================================================================

#[test]
fn budget_resets_session_on_reaching_max() {
    let mut budget = RetryBudget::new(6);
    for expected in 1..=5 {
        assert_eq!(budget.record_failure(), RetryDecision::Retry);
        assert_eq!(budget.count, expected);
    }
    assert_eq!(budget.record_failure(), RetryDecision::ResetSession);
    assert_eq!(budget.reset(), 6);
    assert_eq!(budget.count, 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(start_paused = true)]
async fn open_binds_user_and_clears_qr() {
    let mut h = start();
    h.supervisor.connect().await.unwrap();
    let session = h.next_session().await;
    assert_eq!(session.credentials, Some(json!({"me": {"id": BOT}})));

    session.emit(ClientEvent::Qr("2@pairing".to_string())).await;
    settle().await;
    assert_eq!(h.supervisor.pending_qr().as_deref(), Some("2@pairing"));
    assert_eq!(h.supervisor.status().state, ConnectionState::Connecting);

    session.open(BOT).await;
    h.wait_for(ConnectionState::Connected).await;

    let status = h.supervisor.status();
    assert!(status.is_connected());
    assert!(status.enabled);
    assert_eq!(status.user.unwrap().id, BOT);
    assert_eq!(status.pending_qr, None);
}

#[tokio::test(start_paused = true)]
async fn connect_while_connecting_is_noop() {
    let mut h = start();

    let first = h.supervisor.connect().await.unwrap();
    let second = h.supervisor.connect().await.unwrap();
    settle().await;

    assert_eq!(first, ConnectOutcome::Started);
    assert_eq!(second, ConnectOutcome::AlreadyConnecting);
    assert_eq!(h.client.connect_calls(), 1);
    let _ = h.next_session().await;
    assert!(h.sessions.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn close_retries_after_interval_without_touching_credentials() {
    let mut h = start();
    let mut current = h.connected().await;

    for expected in 1..=5 {
        let closed_at = Instant::now();
        current.close(DisconnectReason::ConnectionLost).await;
        let next = h.next_session().await;

        assert_eq!(next.at - closed_at, Duration::from_millis(5000));
        assert_eq!(h.supervisor.status().retry_count, expected);
        assert!(current.is_closed());
        assert!(next.credentials.is_some());
        current = next;
    }
    assert_eq!(h.store.clears(), 0);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_clears_session_once() {
    let mut h = start();
    h.supervisor.connect().await.unwrap();
    let mut current = h.next_session().await;

    for _ in 1..=5 {
        current.close(DisconnectReason::LoggedOut).await;
        current = h.next_session().await;
    }
    assert_eq!(h.supervisor.status().retry_count, 5);

    let closed_at = Instant::now();
    current.close(DisconnectReason::LoggedOut).await;
    let fresh = h.next_session().await;

    assert_eq!(fresh.at - closed_at, Duration::from_millis(3000));
    assert_eq!(h.store.clears(), 1);
    assert_eq!(h.supervisor.status().retry_count, 0);
    assert_eq!(fresh.credentials, None);
}

#[tokio::test(start_paused = true)]
async fn open_resets_retry_count() {
    let mut h = start();
    h.supervisor.connect().await.unwrap();
    let mut current = h.next_session().await;

    for _ in 0..3 {
        current.close(DisconnectReason::Unknown).await;
        current = h.next_session().await;
    }
    assert_eq!(h.supervisor.status().retry_count, 3);

    current.open(BOT).await;
    h.wait_for(ConnectionState::Connected).await;
    assert_eq!(h.supervisor.status().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn connect_error_goes_through_retry_policy() {
    let h = start();
    h.client.fail_connect(true);

    h.supervisor.connect().await.unwrap();
    settle().await;
    assert_eq!(h.client.connect_calls(), 1);
    let status = h.supervisor.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert_eq!(status.retry_count, 1);

    tokio::time::sleep(Duration::from_millis(5000)).await;
    settle().await;
    assert_eq!(h.client.connect_calls(), 2);
    assert_eq!(h.supervisor.status().retry_count, 2);
}

// ============================================================================
// Manual actions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn manual_restart_resets_count_and_cancels_pending_retry() {
    let mut h = start();
    let first = h.connected().await;

    first.close(DisconnectReason::ConnectionClosed).await;
    let second = h.next_session().await;
    second.close(DisconnectReason::ConnectionClosed).await;
    settle().await;
    assert_eq!(h.supervisor.status().retry_count, 2);

    // A retry is now pending at +5s; the restart must supersede it.
    let requested_at = Instant::now();
    h.supervisor.manual_restart().await.unwrap();
    assert_eq!(h.supervisor.status().retry_count, 0);
    assert_eq!(h.supervisor.status().state, ConnectionState::Disconnected);

    let third = h.next_session().await;
    assert_eq!(third.at - requested_at, Duration::from_millis(2000));
    third.open(BOT).await;
    h.wait_for(ConnectionState::Connected).await;

    // Well past the superseded retry: still one healthy connection.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.sessions.try_recv().is_err());
    assert!(h.supervisor.status().is_connected());
    assert!(!third.is_closed());
}

#[tokio::test(start_paused = true)]
async fn manual_restart_tears_down_live_connection() {
    let mut h = start();
    let session = h.connected().await;

    h.supervisor.manual_restart().await.unwrap();
    assert!(session.is_closed());
    assert!(h.supervisor.status().user.is_none());

    // Late events from the old socket are ignored.
    session.open(BOT).await;
    settle().await;
    assert_eq!(h.supervisor.status().state, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn attempt_finishing_after_restart_is_closed() {
    let mut h = start();
    let release = h.client.hold_next_connect();
    h.supervisor.connect().await.unwrap();
    let late = h.next_session().await;

    h.supervisor.manual_restart().await.unwrap();
    let _ = release.send(());
    settle().await;
    assert!(late.is_closed());
    assert_eq!(h.supervisor.status().state, ConnectionState::Disconnected);

    let fresh = h.next_session().await;
    fresh.open(BOT).await;
    h.wait_for(ConnectionState::Connected).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.sessions.try_recv().is_err());
    assert!(!fresh.is_closed());
    assert_eq!(h.client.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn clear_session_wipes_credentials_and_reconnects() {
    let mut h = start();
    let session = h.connected().await;
    session.close(DisconnectReason::BadSession).await;
    let _ = h.next_session().await;

    let requested_at = Instant::now();
    h.supervisor.clear_session().await.unwrap();
    assert_eq!(h.supervisor.status().retry_count, 0);
    assert_eq!(h.store.clears(), 1);

    let fresh = h.next_session().await;
    assert_eq!(fresh.at - requested_at, Duration::from_millis(3000));
    assert_eq!(fresh.credentials, None);
}

#[tokio::test(start_paused = true)]
async fn reset_retry_count_keeps_connection_state() {
    let mut h = start();
    h.supervisor.connect().await.unwrap();
    let session = h.next_session().await;
    session.close(DisconnectReason::TimedOut).await;
    let _ = h.next_session().await;

    let old = h.supervisor.reset_retry_count().await.unwrap();
    assert_eq!(old, 1);
    let status = h.supervisor.status();
    assert_eq!(status.retry_count, 0);
    assert_eq!(status.state, ConnectionState::Connecting);
}

// ============================================================================
// Outbound operations
// ============================================================================

#[tokio::test(start_paused = true)]
async fn send_requires_connection() {
    let mut h = start();
    let err = h
        .supervisor
        .send("628111@s.whatsapp.net", "Hi")
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::NotConnected));

    h.connected().await;
    h.supervisor
        .send("628111@s.whatsapp.net", "Hi")
        .await
        .unwrap();
    assert_eq!(
        h.client.sends(),
        vec![("628111@s.whatsapp.net".to_string(), "Hi".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn send_error_passes_through() {
    let mut h = start();
    h.connected().await;
    h.client.fail_send(Some("rate-overlimit"));

    let err = h
        .supervisor
        .send("628111@s.whatsapp.net", "Hi")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "rate-overlimit");
}

#[tokio::test(start_paused = true)]
async fn list_groups_is_normalized() {
    let mut h = start();
    assert!(matches!(
        h.supervisor.list_groups().await,
        Err(SupervisorError::NotConnected)
    ));

    h.connected().await;
    h.client.set_groups(vec![GroupInfo {
        id: "120363@g.us".to_string(),
        subject: "Ops".to_string(),
        participants: 12,
    }]);

    let groups = h.supervisor.list_groups().await.unwrap();
    assert_eq!(
        groups,
        vec![GroupSummary {
            id: "120363@g.us".to_string(),
            name: "Ops".to_string(),
            member_count: 12,
        }]
    );
}

// ============================================================================
// Events
// ============================================================================

#[tokio::test(start_paused = true)]
async fn rotated_credentials_are_persisted() {
    let mut h = start();
    let session = h.connected().await;

    session
        .emit(ClientEvent::CredentialsUpdated(json!({"rotated": true})))
        .await;
    settle().await;
    assert_eq!(h.store.current(), Some(json!({"rotated": true})));
}

#[tokio::test(start_paused = true)]
async fn inbound_messages_reach_router_channel() {
    let mut h = start();
    let session = h.connected().await;

    let message = InboundMessage {
        id: None,
        remote_jid: "628222@s.whatsapp.net".to_string(),
        participant: None,
        from_me: false,
        text: Some("status".to_string()),
        mentioned_jids: vec![],
    };
    session.emit(ClientEvent::Message(message.clone())).await;
    assert_eq!(h.inbound.recv().await, Some(message));
}

#[tokio::test(start_paused = true)]
async fn shutdown_tears_down_and_stops() {
    let mut h = start();
    let session = h.connected().await;

    h.supervisor.shutdown().await;
    assert!(session.is_closed());
    assert_eq!(h.supervisor.status().state, ConnectionState::Disconnected);
    assert!(matches!(
        h.supervisor.connect().await,
        Err(SupervisorError::Stopped)
    ));
}

#[tokio::test(start_paused = true)]
async fn attempt_finishing_after_shutdown_is_closed() {
    let mut h = start();
    let release = h.client.hold_next_connect();
    h.supervisor.connect().await.unwrap();
    let late = h.next_session().await;

    h.supervisor.shutdown().await;
    let _ = release.send(());
    settle().await;
    assert!(late.is_closed());
}

#[tokio::test(start_paused = true)]
async fn shutdown_fails_send_in_flight() {
    let mut h = start();
    h.connected().await;
    let _release = h.client.hold_next_send();

    let supervisor = h.supervisor.clone();
    let send = tokio::spawn(async move { supervisor.send("628111@s.whatsapp.net", "Hi").await });
    while h.client.send_attempts() == 0 {
        settle().await;
    }

    h.supervisor.shutdown().await;
    let result = send.await.unwrap();
    assert!(matches!(
        result,
        Err(SupervisorError::Client(ClientError::Closed))
    ));
    assert!(h.client.sends().is_empty());
}
