use std::future::Future;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tracing::info;

use crate::handlers;
use crate::response::ApiError;
use crate::supervisor::Supervisor;
use crate::switch::SystemSwitch;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Supervisor,
    pub switch: SystemSwitch,
}

impl AppState {
    pub fn new(supervisor: Supervisor) -> Self {
        let switch = supervisor.switch().clone();
        Self { supervisor, switch }
    }

    /// Fail with [`ApiError::Disabled`] while the system switch is off.
    pub fn ensure_enabled(&self) -> Result<(), ApiError> {
        if self.switch.is_enabled() {
            Ok(())
        } else {
            Err(ApiError::Disabled)
        }
    }
}

/// Every route, as `(path, description)`, for the startup banner.
pub const ENDPOINTS: &[(&str, &str)] = &[
    (
        "/send-message?number=6281234567890&message=Halo",
        "Kirim pesan ke nomor",
    ),
    (
        "/send-group-message?groupId=120363123456789012@g.us&message=Halo",
        "Kirim pesan ke grup",
    ),
    ("/groups", "Lihat list grup"),
    ("/status", "Cek status koneksi & sistem"),
    ("/health", "Health check dengan auto restart info"),
    (
        "/system-control?action=stop/start/status",
        "Kontrol sistem manual",
    ),
    ("/qr", "Dapatkan QR code"),
    ("/restart", "Restart koneksi"),
    ("/clear-session", "Clear session"),
    ("/reset-retry", "Reset retry counter"),
];

pub fn build_app(state: AppState, request_timeout_secs: u64) -> Router {
    Router::new()
        .route("/send-message", get(handlers::send_message))
        .route("/send-group-message", get(handlers::send_group_message))
        .route("/groups", get(handlers::list_groups))
        .route("/status", get(handlers::status))
        .route("/health", get(handlers::health))
        .route("/qr", get(handlers::qr))
        .route("/restart", get(handlers::restart))
        .route("/clear-session", get(handlers::clear_session))
        .route("/reset-retry", get(handlers::reset_retry))
        .route("/system-control", get(handlers::system_control))
        .with_state(state)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_secs),
        ))
}

/// Serve `app` until `signal` resolves.
///
/// The supervisor is stopped as soon as the signal fires; in-flight requests
/// drain afterwards and see the connection already closed.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    supervisor: Supervisor,
    signal: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            signal.await;
            info!("Shutting down gracefully");
            supervisor.shutdown().await;
        })
        .await
}
