//! HTTP request handlers.
//!
//! All endpoints are `GET` with query parameters. Send, group listing,
//! restart, clear-session and reset-retry are refused while the system
//! switch is off; status, health, QR and system-control always answer.

mod control;
mod messages;
mod status;

pub use control::{clear_session, reset_retry, restart, system_control};
pub use messages::{list_groups, send_group_message, send_message};
pub use status::{health, qr, status};

/// Treat an empty query value like an absent one.
fn present(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}
